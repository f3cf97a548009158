use cipwire::{CipShortString, CipStringI, CipStringIContent, CipStringIEntry};

use crate::object::{AttributeFlags, CipClass, Registry};
use crate::services;
use crate::value::AttrValue;
use crate::FILE_CLASS;

/* File object instance states */
const STATE_FILE_LOADED: u8 = 3;

/// Create the File object class with zero instances. Certificate Management
/// creates instances here for the device and CA certificates and for CSRs.
pub fn init(registry: &mut Registry) {
	let mut class = CipClass::new(FILE_CLASS, "file", 3, 7, 7);

	class.insert_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);
	class.insert_class_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);

	registry.register(class);
}

/// Create one file instance holding a blob, returning its instance number.
/// The contents sit in a non-gettable slot; clients read the name, state and
/// size attributes and transfer the contents out of band.
pub fn create_file_instance(registry: &mut Registry, name: &str, contents: Vec<u8>) -> u16 {
	let class = registry
		.class_mut(FILE_CLASS)
		.expect("file class not initialised");
	let instance_number = class.add_instances(1);
	class
		.instance_mut(instance_number)
		.expect("created file instance missing")
		.dynamic = true;

	class.insert_attribute(
		instance_number,
		1,
		AttrValue::Usint(STATE_FILE_LOADED),
		AttributeFlags::GETABLE_SINGLE,
	);
	class.insert_attribute(
		instance_number,
		2,
		AttrValue::StringI(CipStringI(vec![CipStringIEntry {
			language: *b"eng",
			character_set: 4,
			content: CipStringIContent::ShortString(CipShortString::from_str(name)),
		}])),
		AttributeFlags::GETABLE_SINGLE,
	);
	class.insert_attribute(
		instance_number,
		6,
		AttrValue::Udint(contents.len() as u32),
		AttributeFlags::GETABLE_SINGLE,
	);
	class.insert_attribute(
		instance_number,
		7,
		AttrValue::ByteArray(contents),
		AttributeFlags::empty(),
	);

	instance_number
}
