use cipwire::{CipShortString, ReadFrom};

use crate::message::{Request, Response};
use crate::object::{AttributeFlags, CipClass, ObjectAddr, Registry};
use crate::runtime::{CipRuntime, DeviceIdentity};
use crate::services;
use crate::status::GeneralStatus;
use crate::value::AttrValue;
use crate::IDENTITY_CLASS;

/// Create the Identity object, instance 1, attributes 1-7.
pub fn init(registry: &mut Registry, device: &DeviceIdentity) {
	let mut class = CipClass::new(IDENTITY_CLASS, "identity", 1, 7, 7);
	class.add_instance(1);

	class.insert_attribute(
		1,
		1,
		AttrValue::Uint(device.vendor_id),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		1,
		2,
		AttrValue::Uint(device.device_type),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		1,
		3,
		AttrValue::Uint(device.product_code),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		1,
		4,
		AttrValue::Revision {
			major: device.revision_major,
			minor: device.revision_minor,
		},
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		1,
		5,
		AttrValue::Word(device.status),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		1,
		6,
		AttrValue::Udint(device.serial_number),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		1,
		7,
		AttrValue::ShortString(CipShortString::from_str(&device.product_name)),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);

	class.insert_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);
	class.insert_service(
		services::GET_ATTRIBUTE_ALL,
		services::get_attribute_all,
		"GetAttributeAll",
	);
	class.insert_service(services::RESET, reset, "Reset");
	class.insert_class_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);
	class.insert_class_service(
		services::GET_ATTRIBUTE_ALL,
		services::get_attribute_all,
		"GetAttributeAll",
	);

	registry.register(class);
}

/// Identity Reset: an optional single reset-type octet. Types 0 and 1 are
/// supported and surface to the application; anything else is
/// `InvalidParameter`.
fn reset(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	if request.remaining() > 1 {
		response.set_status(GeneralStatus::TooMuchData);
		return;
	}

	let reset_type = if request.remaining() == 1 {
		u8::read_from(&mut request.data).unwrap_or(0)
	} else {
		0
	};

	if reset_type > 1 {
		response.set_status(GeneralStatus::InvalidParameter);
		return;
	}

	rt.app.reset_device(reset_type);
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::runtime::test_support::test_runtime;

	#[test]
	fn test_get_vendor_id() {
		let mut rt = test_runtime();
		let bytes = [0x0E, 0x03, 0x20, 0x01, 0x24, 0x01, 0x30, 0x01];
		let response = services::notify_explicit(
			&mut rt,
			&bytes,
			"10.0.0.2:44818".parse().unwrap(),
			1,
		);
		assert_eq!(response.reply_service, 0x8E);
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(response.message.as_slice(), &[0x01, 0x00]);
	}

	#[test]
	fn test_reset_with_surplus_payload() {
		let mut rt = test_runtime();
		let bytes = [0x05, 0x02, 0x20, 0x01, 0x24, 0x01, 0x00, 0x00];
		let response = services::notify_explicit(
			&mut rt,
			&bytes,
			"10.0.0.2:44818".parse().unwrap(),
			1,
		);
		assert_eq!(response.general_status, GeneralStatus::TooMuchData);
	}

	#[test]
	fn test_reset_bad_type() {
		let mut rt = test_runtime();
		let bytes = [0x05, 0x02, 0x20, 0x01, 0x24, 0x01, 0x07];
		let response = services::notify_explicit(
			&mut rt,
			&bytes,
			"10.0.0.2:44818".parse().unwrap(),
			1,
		);
		assert_eq!(response.general_status, GeneralStatus::InvalidParameter);
	}
}
