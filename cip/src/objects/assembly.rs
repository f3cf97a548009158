use slog::warn;

use crate::message::{Request, Response};
use crate::object::{AttributeFlags, CipClass, ObjectAddr, Registry};
use crate::runtime::CipRuntime;
use crate::services;
use crate::status::GeneralStatus;
use crate::value::AttrValue;
use crate::ASSEMBLY_CLASS;

/// Create the Assembly class with zero instances; the application wires its
/// instances afterwards.
pub fn init(registry: &mut Registry) {
	let mut class = CipClass::new(ASSEMBLY_CLASS, "assembly", 2, 4, 7);

	class.insert_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);
	class.insert_service(
		services::SET_ATTRIBUTE_SINGLE,
		set_assembly_attribute_single,
		"SetAssemblyAttributeSingle",
	);
	class.insert_class_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);

	registry.register(class);
}

/// Create one assembly instance: attribute 3 is the payload buffer, attribute
/// 4 its length. A zero-length buffer is a heartbeat assembly.
pub fn create_assembly_instance(registry: &mut Registry, instance_number: u16, size: usize) {
	let class = registry
		.class_mut(ASSEMBLY_CLASS)
		.expect("assembly class not initialised");
	class.add_instance(instance_number);
	class.insert_attribute(
		instance_number,
		3,
		AttrValue::ByteArray(vec![0; size]),
		AttributeFlags::SET_AND_GETABLE,
	);
	class.insert_attribute(
		instance_number,
		4,
		AttrValue::Uint(size as u16),
		AttributeFlags::GETABLE_SINGLE,
	);
}

/// The byte length of an assembly's payload buffer, or None when the
/// instance does not exist.
pub fn data_length(registry: &Registry, instance_number: u16) -> Option<usize> {
	match registry.value(ObjectAddr::new(ASSEMBLY_CLASS, instance_number), 3)? {
		AttrValue::ByteArray(data) => Some(data.len()),
		_ => None,
	}
}

pub fn data(registry: &Registry, instance_number: u16) -> Option<&[u8]> {
	match registry.value(ObjectAddr::new(ASSEMBLY_CLASS, instance_number), 3)? {
		AttrValue::ByteArray(data) => Some(data),
		_ => None,
	}
}

/// Deliver connected data to an assembly. The declared payload length must
/// match the buffer exactly; the application is then told new data arrived.
pub fn connected_data_received(
	rt: &mut CipRuntime,
	instance_number: u16,
	data: &[u8],
) -> Result<(), ()> {
	let addr = ObjectAddr::new(ASSEMBLY_CLASS, instance_number);
	match rt.registry.attribute_mut(addr, 3).map(|a| &mut a.value) {
		Some(AttrValue::ByteArray(buffer)) => {
			if buffer.len() != data.len() {
				warn!(rt.logger, "wrong amount of data arrived for assembly";
					"instance" => instance_number,
					"expected" => buffer.len(), "got" => data.len());
				return Err(());
			}
			buffer.copy_from_slice(data);
		}
		_ => return Err(()),
	}
	rt.app.after_assembly_data_received(instance_number)
}

/// SetAttributeSingle for assemblies. Attribute 3 of a connected output
/// assembly cannot be written explicitly, a heartbeat assembly accepts no
/// data at all, and the payload length must match the buffer.
fn set_assembly_attribute_single(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::AttributeNotSupported);

	match request.path.attribute_number {
		3 => {}
		4 => {
			response.set_status(GeneralStatus::AttributeNotSetable);
			return;
		}
		_ => return,
	}

	let Some(buffer_len) = data_length(&rt.registry, addr.instance_number) else {
		return;
	};

	if buffer_len == 0 {
		/* heartbeat assembly */
		response.set_status(GeneralStatus::TooMuchData);
		return;
	}

	if rt
		.connections
		.is_connected_output_assembly(addr.instance_number as u32)
	{
		warn!(rt.logger, "explicit write to connected output assembly";
			"instance" => addr.instance_number);
		response.set_status(GeneralStatus::AttributeNotSetable);
		return;
	}

	let remaining = request.remaining();
	if remaining < buffer_len {
		response.set_status(GeneralStatus::NotEnoughData);
		return;
	}
	if remaining > buffer_len {
		response.set_status(GeneralStatus::TooMuchData);
		return;
	}

	let payload = request.data.get_ref()[request.data.position() as usize..].to_vec();
	match connected_data_received(rt, addr.instance_number, &payload) {
		Ok(()) => response.set_status(GeneralStatus::Success),
		Err(()) => response.set_status(GeneralStatus::InvalidAttributeValue),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::runtime::test_support::test_runtime;

	#[test]
	fn test_explicit_set_requires_exact_length() {
		let mut rt = test_runtime();

		/* assembly 150 is 32 bytes; send 4 */
		let mut bytes = vec![0x10, 0x03, 0x20, 0x04, 0x24, 0x96, 0x30, 0x03];
		bytes.extend_from_slice(&[0u8; 4]);
		let response = services::notify_explicit(
			&mut rt,
			&bytes,
			"10.0.0.2:44818".parse().unwrap(),
			1,
		);
		assert_eq!(response.general_status, GeneralStatus::NotEnoughData);
	}

	#[test]
	fn test_explicit_set_and_get_roundtrip() {
		let mut rt = test_runtime();

		let mut bytes = vec![0x10, 0x03, 0x20, 0x04, 0x24, 0x96, 0x30, 0x03];
		bytes.extend_from_slice(&[0x5A; 32]);
		let response = services::notify_explicit(
			&mut rt,
			&bytes,
			"10.0.0.2:44818".parse().unwrap(),
			1,
		);
		assert_eq!(response.general_status, GeneralStatus::Success);

		let bytes = [0x0E, 0x03, 0x20, 0x04, 0x24, 0x96, 0x30, 0x03];
		let response = services::notify_explicit(
			&mut rt,
			&bytes,
			"10.0.0.2:44818".parse().unwrap(),
			1,
		);
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(response.message.as_slice(), &[0x5A; 32]);
	}

	#[test]
	fn test_heartbeat_assembly_rejects_data() {
		let mut rt = test_runtime();
		let bytes = [0x10, 0x03, 0x20, 0x04, 0x24, 0x98, 0x30, 0x03, 0x01];
		let response = services::notify_explicit(
			&mut rt,
			&bytes,
			"10.0.0.2:44818".parse().unwrap(),
			1,
		);
		assert_eq!(response.general_status, GeneralStatus::TooMuchData);
	}
}
