use cipwire::ReadFrom;

use crate::connection::Priority;
use crate::message::{Request, Response};
use crate::object::{AttributeFlags, CipClass, ObjectAddr, Registry};
use crate::runtime::CipRuntime;
use crate::services;
use crate::status::GeneralStatus;
use crate::value::AttrValue;
use crate::QOS_CLASS;

const INSTANCE: u16 = 1;

/* Default DSCP values per the QoS object definition. */
const DSCP_EVENT: u8 = 59;
const DSCP_GENERAL: u8 = 47;
const DSCP_URGENT: u8 = 55;
const DSCP_SCHEDULED: u8 = 47;
const DSCP_HIGH: u8 = 43;
const DSCP_LOW: u8 = 31;
const DSCP_EXPLICIT: u8 = 27;

/// Create the QoS object, instance 1. The five DSCP values for transport
/// class 0/1 priorities and explicit traffic are settable and persisted.
pub fn init(registry: &mut Registry) {
	let mut class = CipClass::new(QOS_CLASS, "Quality of Service", 1, 8, 7);
	class.add_instance(INSTANCE);

	class.insert_attribute(INSTANCE, 1, AttrValue::Usint(0), AttributeFlags::empty());
	class.insert_attribute(
		INSTANCE,
		2,
		AttrValue::Usint(DSCP_EVENT),
		AttributeFlags::empty(),
	);
	class.insert_attribute(
		INSTANCE,
		3,
		AttrValue::Usint(DSCP_GENERAL),
		AttributeFlags::empty(),
	);
	for (number, default) in [
		(4u16, DSCP_URGENT),
		(5, DSCP_SCHEDULED),
		(6, DSCP_HIGH),
		(7, DSCP_LOW),
		(8, DSCP_EXPLICIT),
	] {
		class.insert_attribute(
			INSTANCE,
			number,
			AttrValue::Usint(default),
			AttributeFlags::GETABLE_SINGLE
				.union(AttributeFlags::SETABLE)
				.union(AttributeFlags::NV_DATA),
		);
	}

	class.insert_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
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

/// SetAttributeSingle with the DSCP range validation: values must lie
/// strictly between 0 and 63.
fn set_attribute_single(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	let attribute_number = request.path.attribute_number;
	if !(4..=8).contains(&attribute_number) {
		services::set_attribute_single(rt, addr, request, response);
		return;
	}

	response.start(request.service, GeneralStatus::Success);
	let Ok(dscp) = u8::read_from(&mut request.data) else {
		response.set_status(GeneralStatus::NotEnoughData);
		return;
	};
	if dscp == 0 || dscp >= 63 {
		response.set_status(GeneralStatus::InvalidAttributeValue);
		return;
	}

	rt.set_attr_value(
		addr.class_code,
		addr.instance_number,
		attribute_number,
		AttrValue::Usint(dscp),
	);
	rt.nv_dirty = true;
}

/// The DSCP value for an I/O connection of the given priority.
pub fn dscp_for_priority(registry: &Registry, priority: Priority) -> u8 {
	let addr = ObjectAddr::new(QOS_CLASS, INSTANCE);
	let attribute_number = match priority {
		Priority::Urgent => 4,
		Priority::Scheduled => 5,
		Priority::High => 6,
		Priority::Low => 7,
	};
	registry.get_u8(addr, attribute_number).unwrap_or(DSCP_EXPLICIT)
}

pub fn dscp_explicit(registry: &Registry) -> u8 {
	registry
		.get_u8(ObjectAddr::new(QOS_CLASS, INSTANCE), 8)
		.unwrap_or(DSCP_EXPLICIT)
}

/// The settable DSCP values in attribute order, as the NV layer persists
/// them.
pub fn dscp_values(registry: &Registry) -> [u8; 5] {
	let addr = ObjectAddr::new(QOS_CLASS, INSTANCE);
	[
		registry.get_u8(addr, 4).unwrap_or(DSCP_URGENT),
		registry.get_u8(addr, 5).unwrap_or(DSCP_SCHEDULED),
		registry.get_u8(addr, 6).unwrap_or(DSCP_HIGH),
		registry.get_u8(addr, 7).unwrap_or(DSCP_LOW),
		registry.get_u8(addr, 8).unwrap_or(DSCP_EXPLICIT),
	]
}

/// Restore persisted DSCP values, in the same order `dscp_values` reports.
pub fn restore_dscp_values(registry: &mut Registry, values: [u8; 5]) {
	let addr = ObjectAddr::new(QOS_CLASS, INSTANCE);
	for (offset, value) in values.into_iter().enumerate() {
		registry.set_value(addr, 4 + offset as u16, AttrValue::Usint(value));
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::runtime::test_support::test_runtime;

	#[test]
	fn test_dscp_range_is_open_interval() {
		let mut rt = test_runtime();
		for (value, expected) in [
			(0u8, GeneralStatus::InvalidAttributeValue),
			(63, GeneralStatus::InvalidAttributeValue),
			(1, GeneralStatus::Success),
			(62, GeneralStatus::Success),
		] {
			let bytes = [0x10, 0x03, 0x20, 0x48, 0x24, 0x01, 0x30, 0x04, value];
			let response = services::notify_explicit(
				&mut rt,
				&bytes,
				"10.0.0.2:44818".parse().unwrap(),
				1,
			);
			assert_eq!(response.general_status, expected, "dscp {}", value);
		}
		assert_eq!(dscp_for_priority(&rt.registry, Priority::Urgent), 62);
	}

	#[test]
	fn test_read_only_attributes_stay_hidden() {
		let mut rt = test_runtime();
		let bytes = [0x0E, 0x03, 0x20, 0x48, 0x24, 0x01, 0x30, 0x01];
		let response = services::notify_explicit(
			&mut rt,
			&bytes,
			"10.0.0.2:44818".parse().unwrap(),
			1,
		);
		assert_eq!(response.general_status, GeneralStatus::AttributeNotSupported);
	}
}
