use crate::object::{AttributeFlags, CipClass, Registry};
use crate::runtime::InterfaceSettings;
use crate::services;
use crate::value::AttrValue;
use crate::ETHERNET_LINK_CLASS;

/// Create the Ethernet Link object, instance 1: interface speed, interface
/// flags and the MAC address.
pub fn init(registry: &mut Registry, interface: &InterfaceSettings) {
	let mut class = CipClass::new(ETHERNET_LINK_CLASS, "Ethernet link", 4, 3, 7);
	class.add_instance(1);

	class.insert_attribute(
		1,
		1,
		AttrValue::Udint(100),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	/* link up, full duplex, negotiation complete */
	class.insert_attribute(
		1,
		2,
		AttrValue::Dword(0x0D),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		1,
		3,
		AttrValue::MacAddress(interface.mac_address),
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
	class.insert_class_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);

	registry.register(class);
}
