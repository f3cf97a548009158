use std::net::Ipv4Addr;

use cipwire::{CipEpath, CipString, ReadFrom};

use crate::message::{Request, Response};
use crate::object::{AttributeFlags, CipClass, ObjectAddr, Registry};
use crate::runtime::{CipRuntime, InterfaceSettings, StackConfig};
use crate::services;
use crate::status::GeneralStatus;
use crate::value::{AttrValue, InterfaceConfiguration};
use crate::{ETHERNET_LINK_CLASS, TCP_IP_INTERFACE_CLASS};

const INSTANCE: u16 = 1;

/// Create the TCP/IP Interface object, instance 1. Attribute 7 (the safety
/// network number) is a dummy hole required by the Get_Attributes_All table;
/// attribute 13 is the encapsulation inactivity timeout.
pub fn init(registry: &mut Registry, interface: &InterfaceSettings, config: &StackConfig) {
	let mut class = CipClass::new(TCP_IP_INTERFACE_CLASS, "TCP/IP interface", 4, 13, 7);
	class.add_instance(INSTANCE);

	/* status: interface configuration obtained from non-volatile storage */
	class.insert_attribute(
		INSTANCE,
		1,
		AttrValue::Dword(0x01),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	/* configuration capability: settable from software */
	class.insert_attribute(
		INSTANCE,
		2,
		AttrValue::Dword(0x04),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		INSTANCE,
		3,
		AttrValue::Dword(0x00),
		AttributeFlags::SET_AND_GETABLE.union(AttributeFlags::NV_DATA),
	);
	class.insert_attribute(
		INSTANCE,
		4,
		AttrValue::Epath(CipEpath::new(ETHERNET_LINK_CLASS, 1, 0)),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		INSTANCE,
		5,
		AttrValue::InterfaceConfiguration(InterfaceConfiguration {
			ip_address: u32::from(interface.ip_address),
			network_mask: u32::from(interface.network_mask),
			gateway: u32::from(interface.gateway),
			name_server: u32::from(interface.name_server),
			name_server_2: u32::from(interface.name_server_2),
			domain_name: CipString::from_str(&interface.domain_name),
		}),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		INSTANCE,
		6,
		AttrValue::String(CipString::from_str(&interface.host_name)),
		AttributeFlags::SET_AND_GETABLE.union(AttributeFlags::NV_DATA),
	);
	/* safety network number hole */
	class.insert_attribute(
		INSTANCE,
		7,
		AttrValue::Dummy(6),
		AttributeFlags::GETABLE_ALL_DUMMY,
	);
	/* multicast TTL */
	class.insert_attribute(
		INSTANCE,
		8,
		AttrValue::Usint(1),
		AttributeFlags::SET_AND_GETABLE.union(AttributeFlags::NV_DATA),
	);
	class.insert_attribute(
		INSTANCE,
		13,
		AttrValue::Uint(config.encapsulation_inactivity_timeout_s),
		AttributeFlags::GETABLE_SINGLE
			.union(AttributeFlags::SETABLE)
			.union(AttributeFlags::NV_DATA),
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
	class.insert_service(
		services::GET_ATTRIBUTE_LIST,
		services::get_attribute_list,
		"GetAttributeList",
	);
	class.insert_service(
		services::SET_ATTRIBUTE_SINGLE,
		set_attribute_single,
		"SetAttributeSingle",
	);
	class.insert_class_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);

	registry.register(class);
}

/// SetAttributeSingle with the per-attribute validation the interface object
/// requires before the generic decode may run.
fn set_attribute_single(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	match request.path.attribute_number {
		3 => {
			response.start(request.service, GeneralStatus::Success);
			let Ok(control) = u32::read_from(&mut request.data) else {
				response.set_status(GeneralStatus::NotEnoughData);
				return;
			};
			/* startup configuration method, lower nibble: stored, BOOTP, DHCP */
			if control & 0x0F > 2 {
				response.set_status(GeneralStatus::InvalidAttributeValue);
				return;
			}
			rt.set_attr_value(addr.class_code, addr.instance_number, 3, AttrValue::Dword(control));
			rt.nv_dirty = true;
		}
		13 => {
			response.start(request.service, GeneralStatus::Success);
			let Ok(timeout) = u16::read_from(&mut request.data) else {
				response.set_status(GeneralStatus::NotEnoughData);
				return;
			};
			if timeout > 3600 {
				response.set_status(GeneralStatus::InvalidAttributeValue);
				return;
			}
			rt.set_attr_value(addr.class_code, addr.instance_number, 13, AttrValue::Uint(timeout));
			rt.nv_dirty = true;
		}
		_ => services::set_attribute_single(rt, addr, request, response),
	}
}

/// The configured interface addresses, read back from attribute 5.
pub fn interface_configuration(registry: &Registry) -> Option<InterfaceConfiguration> {
	match registry.value(ObjectAddr::new(TCP_IP_INTERFACE_CLASS, INSTANCE), 5)? {
		AttrValue::InterfaceConfiguration(configuration) => Some(configuration.clone()),
		_ => None,
	}
}

pub fn encapsulation_inactivity_timeout(registry: &Registry) -> Option<u16> {
	registry.get_u16(ObjectAddr::new(TCP_IP_INTERFACE_CLASS, INSTANCE), 13)
}

pub fn multicast_ttl(registry: &Registry) -> u8 {
	registry
		.get_u8(ObjectAddr::new(TCP_IP_INTERFACE_CLASS, INSTANCE), 8)
		.unwrap_or(1)
}

/// The target-chosen multicast group for produced Class 1 data, derived from
/// the device address per Vol. 1 3-5.3: 239.192.1.0 with the masked host id
/// shifted into bits 5..15.
pub fn multicast_address(registry: &Registry) -> Ipv4Addr {
	let (ip, mask) = match interface_configuration(registry) {
		Some(configuration) => (configuration.ip_address, configuration.network_mask),
		None => (0, 0),
	};
	let host_id = ip & !mask;
	Ipv4Addr::from(0xEFC0_0100u32 | (host_id.wrapping_sub(1) & 0x3FF) << 5)
}
