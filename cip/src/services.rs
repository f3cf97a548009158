use slog::{debug, warn};

use cipwire::ReadFrom;

use crate::message::{Request, Response};
use crate::object::{AttributeFlags, ObjectAddr};
use crate::runtime::CipRuntime;
use crate::status::GeneralStatus;

/* Common service codes, Vol. 1 Appendix A. */
pub const GET_ATTRIBUTE_ALL: u8 = 0x01;
pub const GET_ATTRIBUTE_LIST: u8 = 0x03;
pub const SET_ATTRIBUTE_LIST: u8 = 0x04;
pub const RESET: u8 = 0x05;
pub const CREATE: u8 = 0x08;
pub const DELETE: u8 = 0x09;
pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
pub const SET_ATTRIBUTE_SINGLE: u8 = 0x10;
pub const FORWARD_CLOSE: u8 = 0x4E;
pub const FORWARD_OPEN: u8 = 0x54;
pub const LARGE_FORWARD_OPEN: u8 = 0x5B;

/// Route a decoded Message Router Request to the addressed object. Instance 0
/// selects the class level. A missing instance answers
/// `PathDestinationUnknown`, a missing service `ServiceNotSupported`, neither
/// with additional status.
pub fn notify(rt: &mut CipRuntime, request: &mut Request<'_>, response: &mut Response) {
	let addr = ObjectAddr::new(request.path.class_id, request.path.instance_number);

	let Some(class) = rt.registry.class_mut(addr.class_code) else {
		warn!(rt.logger, "request for unknown class"; "class" => addr.class_code);
		response.start(request.service, GeneralStatus::PathDestinationUnknown);
		return;
	};
	class.refresh_class_counters();

	if addr.instance_number != 0 && class.instance(addr.instance_number).is_none() {
		warn!(rt.logger, "request for unknown instance";
			"class" => class.name, "instance" => addr.instance_number);
		response.start(request.service, GeneralStatus::PathDestinationUnknown);
		return;
	}

	let Some(service) = class.service(addr.instance_number, request.service).copied() else {
		warn!(rt.logger, "unsupported service";
			"class" => class.name, "service" => request.service);
		response.start(request.service, GeneralStatus::ServiceNotSupported);
		return;
	};

	debug!(rt.logger, "dispatching service";
		"service" => service.name, "instance" => addr.instance_number);
	(service.function)(rt, addr, request, response);
}

/// Decode and route one explicit request, producing the response the
/// encapsulation layer serialises.
pub fn notify_explicit(
	rt: &mut CipRuntime,
	bytes: &[u8],
	originator: std::net::SocketAddrV4,
	session: u32,
) -> Response {
	let mut response = Response::new(rt.config.response_buffer_capacity());
	match Request::decode(bytes, originator, session) {
		Ok(mut request) => notify(rt, &mut request, &mut response),
		Err((service, status)) => {
			warn!(rt.logger, "malformed request path"; "status" => ?status);
			response.start(service, status);
		}
	}
	response
}

/// GetAttributeSingle. A missing attribute and a clear get bit both answer
/// `AttributeNotSupported`.
pub fn get_attribute_single(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	let attribute_number = request.path.attribute_number;
	response.start(request.service, GeneralStatus::AttributeNotSupported);

	let Some(class) = rt.registry.class(addr.class_code) else {
		return;
	};
	let hooks = class.hooks;
	if !class.masks(addr.instance_number).is_gettable(attribute_number) {
		return;
	}
	let Some(attribute) = rt.registry.attribute(addr, attribute_number) else {
		return;
	};
	let flags = attribute.flags;

	if flags.contains(AttributeFlags::PRE_GET) {
		if let Some(pre_get) = hooks.pre_get {
			pre_get(rt, addr, attribute_number, request.service);
		}
	}

	let attribute = rt
		.registry
		.attribute(addr, attribute_number)
		.expect("attribute vanished during pre-get");
	match attribute.value.encode(&mut response.message) {
		Ok(()) => response.set_status(GeneralStatus::Success),
		Err(_) => {
			response.message.truncate(0);
			response.set_status(GeneralStatus::PartialTransfer);
			return;
		}
	}

	if flags.contains(AttributeFlags::POST_GET) {
		if let Some(post_get) = hooks.post_get {
			post_get(rt, addr, attribute_number, request.service);
		}
	}
}

/// SetAttributeSingle. The typed decode reports its own failure status; the
/// post-set hook additionally runs for NV-flagged attributes so the platform
/// can persist them.
pub fn set_attribute_single(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	let attribute_number = request.path.attribute_number;
	response.start(request.service, GeneralStatus::AttributeNotSupported);

	let Some(class) = rt.registry.class(addr.class_code) else {
		return;
	};
	let hooks = class.hooks;
	let setable = class.masks(addr.instance_number).is_setable(attribute_number);
	let Some(attribute) = rt.registry.attribute(addr, attribute_number) else {
		return;
	};
	let flags = attribute.flags;

	if !setable {
		response.set_status(GeneralStatus::AttributeNotSetable);
		return;
	}

	if flags.contains(AttributeFlags::PRE_SET) {
		if let Some(pre_set) = hooks.pre_set {
			pre_set(rt, addr, attribute_number, request.service);
		}
	}

	let attribute = rt
		.registry
		.attribute_mut(addr, attribute_number)
		.expect("attribute vanished during pre-set");
	match attribute.value.decode_from(&mut request.data) {
		Ok(()) => response.set_status(GeneralStatus::Success),
		Err(status) => {
			response.set_status(status);
			return;
		}
	}

	if flags.contains(AttributeFlags::NV_DATA) {
		rt.nv_dirty = true;
	}
	if flags.intersects(AttributeFlags::POST_SET | AttributeFlags::NV_DATA) {
		if let Some(post_set) = hooks.post_set {
			post_set(rt, addr, attribute_number, request.service);
		}
	}
}

/// GetAttributeAll: every attribute whose get-all bit is set, in declared
/// order. Dummy slots emit their zero-filled region. An instance without
/// attributes answers `ServiceNotSupported`.
pub fn get_attribute_all(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	let Some(class) = rt.registry.class(addr.class_code) else {
		response.start(request.service, GeneralStatus::PathDestinationUnknown);
		return;
	};
	let hooks = class.hooks;

	let attribute_numbers: Vec<(u16, AttributeFlags)> = if addr.instance_number == 0 {
		class.class_attributes.iter().map(|a| (a.number, a.flags)).collect()
	} else {
		match class.instance(addr.instance_number) {
			Some(instance) => instance.attributes.iter().map(|a| (a.number, a.flags)).collect(),
			None => Vec::new(),
		}
	};

	if attribute_numbers.is_empty() {
		response.start(request.service, GeneralStatus::ServiceNotSupported);
		return;
	}

	response.start(request.service, GeneralStatus::Success);

	for (attribute_number, flags) in attribute_numbers {
		let gettable_all = rt
			.registry
			.class(addr.class_code)
			.map(|c| c.masks(addr.instance_number).is_gettable_all(attribute_number))
			.unwrap_or(false);
		if !gettable_all {
			continue;
		}

		if flags.contains(AttributeFlags::PRE_GET) {
			if let Some(pre_get) = hooks.pre_get {
				pre_get(rt, addr, attribute_number, request.service);
			}
		}

		let Some(attribute) = rt.registry.attribute(addr, attribute_number) else {
			continue;
		};
		if attribute.value.encode(&mut response.message).is_err() {
			response.message.truncate(0);
			response.set_status(GeneralStatus::PartialTransfer);
			return;
		}
	}
}

/// GetAttributeList: a 16-bit count then that many attribute numbers, each
/// answered as `(number, status, reserved, value-if-successful)`. On buffer
/// exhaustion the count header is rewound to what was emitted and the general
/// status becomes `PartialTransfer`.
pub fn get_attribute_list(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	let Ok(requested_count) = u16::read_from(&mut request.data) else {
		response.set_status(GeneralStatus::NotEnoughData);
		return;
	};
	if requested_count == 0 {
		response.set_status(GeneralStatus::AttributeListError);
		return;
	}

	let count_mark = response.message.mark();
	if response.message.push_u16_le(0).is_err() {
		response.set_status(GeneralStatus::PartialTransfer);
		return;
	}
	let mut emitted: u16 = 0;

	for _ in 0..requested_count {
		let Ok(attribute_number) = u16::read_from(&mut request.data) else {
			response.message.patch_u16_le(count_mark, emitted);
			response.set_status(GeneralStatus::NotEnoughData);
			return;
		};

		let entry = rt
			.registry
			.attribute(addr, attribute_number)
			.map(|a| (a.flags, a.value.encoded_size()));
		let gettable = rt
			.registry
			.class(addr.class_code)
			.map(|c| c.masks(addr.instance_number).is_gettable(attribute_number))
			.unwrap_or(false);

		/* element header plus value must fit, else rewind and bail */
		let needed = 4 + entry.map(|(_, size)| size).unwrap_or(0);
		if needed > response.message.remaining() {
			response.message.patch_u16_le(count_mark, emitted);
			if response.general_status != GeneralStatus::AttributeListError {
				response.set_status(GeneralStatus::PartialTransfer);
			}
			return;
		}

		let _ = response.message.push_u16_le(attribute_number);
		match entry {
			Some((flags, _)) if gettable => {
				let _ = response.message.push_u8(GeneralStatus::Success.into());
				let _ = response.message.push_u8(0);

				if flags.contains(AttributeFlags::PRE_GET) {
					let hooks = rt.registry.class(addr.class_code).map(|c| c.hooks);
					if let Some(pre_get) = hooks.and_then(|h| h.pre_get) {
						pre_get(rt, addr, attribute_number, request.service);
					}
				}
				let attribute = rt
					.registry
					.attribute(addr, attribute_number)
					.expect("attribute vanished during pre-get");
				if attribute.value.encode(&mut response.message).is_err() {
					response.message.patch_u16_le(count_mark, emitted);
					response.set_status(GeneralStatus::PartialTransfer);
					return;
				}
			}
			Some(_) => {
				let _ = response
					.message
					.push_u8(GeneralStatus::AttributeNotGettable.into());
				let _ = response.message.push_u8(0);
				response.set_status(GeneralStatus::AttributeListError);
			}
			None => {
				let _ = response
					.message
					.push_u8(GeneralStatus::AttributeNotSupported.into());
				let _ = response.message.push_u8(0);
				response.set_status(GeneralStatus::AttributeListError);
			}
		}
		emitted += 1;
	}

	response.message.patch_u16_le(count_mark, emitted);
}

/// SetAttributeList: symmetric to GetAttributeList. A value whose attribute
/// is not setable is skipped by its stored size so the remaining elements
/// stay aligned; a decode failure ends the walk because realignment is no
/// longer possible.
pub fn set_attribute_list(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	let Ok(requested_count) = u16::read_from(&mut request.data) else {
		response.set_status(GeneralStatus::NotEnoughData);
		return;
	};
	if requested_count == 0 {
		response.set_status(GeneralStatus::AttributeListError);
		return;
	}

	let count_mark = response.message.mark();
	if response.message.push_u16_le(0).is_err() {
		response.set_status(GeneralStatus::PartialTransfer);
		return;
	}
	let mut emitted: u16 = 0;

	for _ in 0..requested_count {
		let Ok(attribute_number) = u16::read_from(&mut request.data) else {
			response.message.patch_u16_le(count_mark, emitted);
			response.set_status(GeneralStatus::NotEnoughData);
			return;
		};

		if 4 > response.message.remaining() {
			response.message.patch_u16_le(count_mark, emitted);
			if response.general_status != GeneralStatus::AttributeListError {
				response.set_status(GeneralStatus::PartialTransfer);
			}
			return;
		}

		let entry = rt
			.registry
			.attribute(addr, attribute_number)
			.map(|a| (a.flags, a.value.encoded_size()));
		let setable = rt
			.registry
			.class(addr.class_code)
			.map(|c| c.masks(addr.instance_number).is_setable(attribute_number))
			.unwrap_or(false);

		let _ = response.message.push_u16_le(attribute_number);
		let element_status = match entry {
			Some((flags, stored_size)) => {
				if setable {
					let hooks = rt.registry.class(addr.class_code).map(|c| c.hooks);
					if flags.contains(AttributeFlags::PRE_SET) {
						if let Some(pre_set) = hooks.and_then(|h| h.pre_set) {
							pre_set(rt, addr, attribute_number, request.service);
						}
					}
					let attribute = rt
						.registry
						.attribute_mut(addr, attribute_number)
						.expect("attribute vanished during pre-set");
					match attribute.value.decode_from(&mut request.data) {
						Ok(()) => {
							if flags.contains(AttributeFlags::NV_DATA) {
								rt.nv_dirty = true;
							}
							if flags
								.intersects(AttributeFlags::POST_SET | AttributeFlags::NV_DATA)
							{
								if let Some(post_set) = hooks.and_then(|h| h.post_set) {
									post_set(rt, addr, attribute_number, request.service);
								}
							}
							GeneralStatus::Success
						}
						Err(status) => {
							/* the cursor is no longer aligned; stop here */
							let _ = response.message.push_u8(status.into());
							let _ = response.message.push_u8(0);
							emitted += 1;
							response.message.patch_u16_le(count_mark, emitted);
							response.set_status(GeneralStatus::AttributeListError);
							return;
						}
					}
				} else {
					/* skip the value by the stored shape's size */
					let skip = stored_size.min(request.remaining());
					let position = request.data.position();
					request.data.set_position(position + skip as u64);
					response.set_status(GeneralStatus::AttributeListError);
					GeneralStatus::AttributeNotSetable
				}
			}
			None => {
				/* no shape to skip by; stop after reporting this element */
				let _ = response
					.message
					.push_u8(GeneralStatus::AttributeNotSupported.into());
				let _ = response.message.push_u8(0);
				emitted += 1;
				response.message.patch_u16_le(count_mark, emitted);
				response.set_status(GeneralStatus::AttributeListError);
				return;
			}
		};

		let _ = response.message.push_u8(element_status.into());
		let _ = response.message.push_u8(0);
		emitted += 1;
	}

	response.message.patch_u16_le(count_mark, emitted);
}

/// Create: run the pre-create hook, allocate the smallest unused instance
/// number, then let the post-create hook bind attributes and append the new
/// instance number to the reply.
pub fn create(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	let hooks = match rt.registry.class(addr.class_code) {
		Some(class) => class.hooks,
		None => return,
	};

	if let Some(pre_create) = hooks.pre_create {
		if !pre_create(rt, addr, request, response) {
			return;
		}
	}

	let new_instance_number = {
		let class = rt
			.registry
			.class_mut(addr.class_code)
			.expect("class vanished during create");
		let number = class.add_instances(1);
		class
			.instance_mut(number)
			.expect("created instance missing")
			.dynamic = true;
		number
	};

	if let Some(post_create) = hooks.post_create {
		let new_addr = ObjectAddr::new(addr.class_code, new_instance_number);
		post_create(rt, new_addr, request, response);
	}

	debug!(rt.logger, "instance created";
		"class" => addr.class_code, "instance" => new_instance_number);
}

/// Delete: the pre-delete hook must accept, which it never does for static
/// instances. On acceptance the instance is detached and dropped and the
/// class counters recomputed.
pub fn delete(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::InstanceNotDeletable);

	let hooks = match rt.registry.class(addr.class_code) {
		Some(class) => class.hooks,
		None => return,
	};

	let Some(pre_delete) = hooks.pre_delete else {
		return;
	};
	if !pre_delete(rt, addr, request, response) {
		return;
	}

	if let Some(class) = rt.registry.class_mut(addr.class_code) {
		class.remove_instance(addr.instance_number);
	}

	if let Some(post_delete) = hooks.post_delete {
		post_delete(rt, addr, request, response);
	}

	response.set_status(GeneralStatus::Success);
}

/// Reset: the pre-reset hook validates the request (rejecting surplus
/// payload with `TooMuchData`); the post-reset hook performs the fan-out.
pub fn reset(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	let hooks = match rt.registry.class(addr.class_code) {
		Some(class) => class.hooks,
		None => return,
	};

	if let Some(pre_reset) = hooks.pre_reset {
		if !pre_reset(rt, addr, request, response) {
			return;
		}
	}

	if let Some(post_reset) = hooks.post_reset {
		post_reset(rt, addr, request, response);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::object::{AttributeFlags, CipClass};
	use crate::runtime::test_support::{explicit_request, test_runtime};
	use crate::value::AttrValue;

	/// A scratch object with plain typed attributes, for driving the
	/// generic list services.
	fn add_scratch_class(rt: &mut CipRuntime) {
		let mut class = CipClass::new(0x70, "scratch", 1, 4, 7);
		class.add_instance(1);
		class.insert_attribute(1, 1, AttrValue::Uint(0x1111), AttributeFlags::GETABLE_SINGLE);
		class.insert_attribute(
			1,
			2,
			AttrValue::Udint(0x2222_2222),
			AttributeFlags::SET_AND_GETABLE,
		);
		class.insert_attribute(1, 3, AttrValue::Uint(0x3333), AttributeFlags::SETABLE);
		class.insert_service(GET_ATTRIBUTE_LIST, get_attribute_list, "GetAttributeList");
		class.insert_service(SET_ATTRIBUTE_LIST, set_attribute_list, "SetAttributeList");
		rt.registry.register(class);
	}

	#[test]
	fn test_unknown_class_is_path_destination_unknown() {
		let mut rt = test_runtime();
		let bytes = [0x0E, 0x03, 0x20, 0x7F, 0x24, 0x01, 0x30, 0x01];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::PathDestinationUnknown);
		assert!(response.additional_status.is_empty());
	}

	#[test]
	fn test_unknown_instance_is_path_destination_unknown() {
		let mut rt = test_runtime();
		let bytes = [0x0E, 0x03, 0x20, 0x01, 0x24, 0x63, 0x30, 0x01];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::PathDestinationUnknown);
	}

	#[test]
	fn test_unknown_service_is_service_not_supported() {
		let mut rt = test_runtime();
		let bytes = [0x32, 0x03, 0x20, 0x01, 0x24, 0x01, 0x30, 0x01];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::ServiceNotSupported);
		assert!(response.additional_status.is_empty());
		assert_eq!(response.reply_service, 0xB2);
	}

	#[test]
	fn test_class_level_get_attribute_single() {
		let mut rt = test_runtime();
		/* class attribute 2 of the identity class: max instance */
		let bytes = [0x0E, 0x03, 0x20, 0x01, 0x24, 0x00, 0x30, 0x02];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(response.message.as_slice(), &[0x01, 0x00]);
	}

	#[test]
	fn test_get_attribute_single_not_gettable() {
		let mut rt = test_runtime();
		add_scratch_class(&mut rt);
		let bytes = [0x0E, 0x03, 0x20, 0x70, 0x24, 0x01, 0x30, 0x03];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::AttributeNotSupported);
	}

	#[test]
	fn test_get_attribute_list_mixed_statuses() {
		let mut rt = test_runtime();
		add_scratch_class(&mut rt);

		/* attributes 1 (gettable), 3 (set only), 9 (absent) */
		let mut bytes = vec![0x03, 0x02, 0x20, 0x70, 0x24, 0x01];
		bytes.extend_from_slice(&3u16.to_le_bytes());
		for number in [1u16, 3, 9] {
			bytes.extend_from_slice(&number.to_le_bytes());
		}
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::AttributeListError);

		let body = response.message.as_slice();
		assert_eq!(&body[0..2], &3u16.to_le_bytes());
		/* element 1: number, success, reserved, value */
		assert_eq!(&body[2..4], &1u16.to_le_bytes());
		assert_eq!(body[4], 0x00);
		assert_eq!(&body[6..8], &0x1111u16.to_le_bytes());
		/* element 2: not gettable, no value */
		assert_eq!(&body[8..10], &3u16.to_le_bytes());
		assert_eq!(body[10], 0x2C);
		/* element 3: not supported */
		assert_eq!(&body[12..14], &9u16.to_le_bytes());
		assert_eq!(body[14], 0x14);
	}

	#[test]
	fn test_get_attribute_list_zero_count() {
		let mut rt = test_runtime();
		add_scratch_class(&mut rt);
		let mut bytes = vec![0x03, 0x02, 0x20, 0x70, 0x24, 0x01];
		bytes.extend_from_slice(&0u16.to_le_bytes());
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::AttributeListError);
	}

	#[test]
	fn test_set_attribute_list_writes_and_skips() {
		let mut rt = test_runtime();
		add_scratch_class(&mut rt);

		/* set attribute 2 (setable) and attribute 1 (not setable) */
		let mut bytes = vec![0x04, 0x02, 0x20, 0x70, 0x24, 0x01];
		bytes.extend_from_slice(&2u16.to_le_bytes());
		bytes.extend_from_slice(&2u16.to_le_bytes());
		bytes.extend_from_slice(&0xAABB_CCDDu32.to_le_bytes());
		bytes.extend_from_slice(&1u16.to_le_bytes());
		bytes.extend_from_slice(&0x9999u16.to_le_bytes());
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::AttributeListError);

		/* the setable attribute was written, the read-only one untouched */
		let addr = ObjectAddr::new(0x70, 1);
		assert_eq!(
			rt.registry.value(addr, 2),
			Some(&AttrValue::Udint(0xAABB_CCDD))
		);
		assert_eq!(rt.registry.value(addr, 1), Some(&AttrValue::Uint(0x1111)));

		let body = response.message.as_slice();
		assert_eq!(&body[0..2], &2u16.to_le_bytes());
		assert_eq!(body[4], 0x00); /* first element succeeded */
		assert_eq!(body[8], 0x0E); /* second is not setable */
	}

	#[test]
	fn test_get_attribute_list_partial_transfer_rewinds_count() {
		let mut rt = test_runtime();
		/* a buffer barely larger than one element */
		rt.config.buffer_size = crate::runtime::ENCAPSULATION_RESERVE + 12;
		add_scratch_class(&mut rt);

		let mut bytes = vec![0x03, 0x02, 0x20, 0x70, 0x24, 0x01];
		bytes.extend_from_slice(&2u16.to_le_bytes());
		bytes.extend_from_slice(&1u16.to_le_bytes());
		bytes.extend_from_slice(&2u16.to_le_bytes());
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::PartialTransfer);

		let body = response.message.as_slice();
		/* the count header was rewound to the one element that fit */
		assert_eq!(&body[0..2], &1u16.to_le_bytes());
		assert_eq!(body.len(), 2 + 4 + 2);
	}
}
