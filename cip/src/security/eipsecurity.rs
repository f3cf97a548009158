use slog::info;

use cipwire::{CipEpath, ReadFrom};

use crate::message::{Request, Response};
use crate::object::{AttributeFlags, CipClass, ObjectAddr};
use crate::runtime::CipRuntime;
use crate::security::{EipConfigSnapshot, CONFIG_SESSION_TIMEOUT_MS};
use crate::services;
use crate::status::GeneralStatus;
use crate::value::{AttrValue, CipherSuiteId, PreSharedKey};
use crate::{CERTIFICATE_MANAGEMENT_CLASS, EIP_SECURITY_CLASS};

pub const SERVICE_BEGIN_CONFIG: u8 = 0x4B;
pub const SERVICE_KICK_TIMER: u8 = 0x4C;
pub const SERVICE_APPLY_CONFIG: u8 = 0x4D;
pub const SERVICE_ABORT_CONFIG: u8 = 0x4E;

/* State attribute values, Vol. 8 5-4.4.1. */
pub const STATE_FACTORY_DEFAULT: u8 = 0;
pub const STATE_CONFIGURATION_IN_PROGRESS: u8 = 1;
pub const STATE_CONFIGURED: u8 = 2;
pub const STATE_PULL_MODEL_IN_PROGRESS: u8 = 3;
pub const STATE_PULL_MODEL_COMPLETED: u8 = 4;
pub const STATE_PULL_MODEL_DISABLED: u8 = 5;

/// Maximum PSK identity length in octets, Vol. 8 5-4.4.5.
const SIZE_MAX_PSK_IDENTITY: usize = 128;
/// Maximum PSK length in octets.
const SIZE_MAX_PSK: usize = 64;

const INSTANCE: u16 = 1;

/// The attributes a configuration session may change, in attribute order.
const SETTABLE_ATTRIBUTES: [u16; 11] = [4, 5, 6, 7, 8, 9, 10, 11, 12, 15, 16];

fn available_cipher_suites() -> Vec<CipherSuiteId> {
	[
		(0x00, 0x3B), /* TLS_RSA_WITH_NULL_SHA256 */
		(0x00, 0x3C), /* TLS_RSA_WITH_AES_128_CBC_SHA256 */
		(0x00, 0x3D), /* TLS_RSA_WITH_AES_256_CBC_SHA256 */
		(0xC0, 0x06), /* TLS_ECDHE_ECDSA_WITH_NULL_SHA */
		(0xC0, 0x23), /* TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256 */
		(0xC0, 0x24), /* TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384 */
		(0xC0, 0x3A), /* TLS_ECDHE_PSK_WITH_NULL_SHA256 */
		(0xC0, 0x37), /* TLS_ECDHE_PSK_WITH_AES_128_CBC_SHA256 */
	]
	.into_iter()
	.map(|(iana_first_byte, iana_second_byte)| CipherSuiteId {
		iana_first_byte,
		iana_second_byte,
	})
	.collect()
}

fn default_allowed_cipher_suites() -> Vec<CipherSuiteId> {
	vec![
		CipherSuiteId {
			iana_first_byte: 0xC0,
			iana_second_byte: 0x23,
		},
		CipherSuiteId {
			iana_first_byte: 0xC0,
			iana_second_byte: 0x24,
		},
	]
}

/// Factory default value of one settable attribute.
fn default_value(attribute_number: u16) -> AttrValue {
	match attribute_number {
		4 => AttrValue::CipherSuites(default_allowed_cipher_suites()),
		5 => AttrValue::PreSharedKeys(Vec::new()),
		6 => AttrValue::PathList(vec![CipEpath::new(CERTIFICATE_MANAGEMENT_CLASS, 1, 0)]),
		7 => AttrValue::PathList(Vec::new()),
		8 => AttrValue::ShortEpath(None),
		9 => AttrValue::Bool(false),
		10 => AttrValue::Bool(false),
		11 => AttrValue::Bool(false),
		12 => AttrValue::PathList(Vec::new()),
		15 => AttrValue::Uint(12),
		16 => AttrValue::Usint(0),
		_ => unreachable!("attribute {} is not settable", attribute_number),
	}
}

pub fn state(rt: &CipRuntime) -> u8 {
	rt.attr_u8(EIP_SECURITY_CLASS, INSTANCE, 1)
		.unwrap_or(STATE_FACTORY_DEFAULT)
}

fn set_state(rt: &mut CipRuntime, instance: u16, state: u8) {
	rt.set_attr_value(EIP_SECURITY_CLASS, instance, 1, AttrValue::Usint(state));
}

/// Create the EtherNet/IP Security object, instance 1: the TLS/DTLS policy
/// attributes and the configuration session state machine.
pub fn init(rt: &mut CipRuntime) {
	let mut class = CipClass::new(EIP_SECURITY_CLASS, "EtherNet/IP Security", 7, 16, 7);
	class.add_instance(INSTANCE);

	class.insert_attribute(
		INSTANCE,
		1,
		AttrValue::Usint(STATE_FACTORY_DEFAULT),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		INSTANCE,
		2,
		AttrValue::Dword(0),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		INSTANCE,
		3,
		AttrValue::CipherSuites(available_cipher_suites()),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	for attribute_number in [4u16, 5, 6, 7, 8, 9, 10, 11, 12] {
		class.insert_attribute(
			INSTANCE,
			attribute_number,
			default_value(attribute_number),
			AttributeFlags::SET_AND_GETABLE,
		);
	}
	class.insert_attribute(
		INSTANCE,
		13,
		AttrValue::Bool(true),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		INSTANCE,
		14,
		AttrValue::Uint(0),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	for attribute_number in [15u16, 16] {
		class.insert_attribute(
			INSTANCE,
			attribute_number,
			default_value(attribute_number),
			AttributeFlags::SET_AND_GETABLE,
		);
	}

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
		services::SET_ATTRIBUTE_SINGLE,
		set_attribute_single,
		"SetAttributeSingle",
	);
	class.insert_service(services::RESET, services::reset, "Reset");
	class.insert_service(SERVICE_BEGIN_CONFIG, begin_config, "BeginConfig");
	class.insert_service(SERVICE_KICK_TIMER, kick_timer, "KickTimer");
	class.insert_service(SERVICE_APPLY_CONFIG, apply_config, "ApplyConfig");
	class.insert_service(SERVICE_ABORT_CONFIG, abort_config, "AbortConfig");
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

	class.hooks.pre_reset = Some(pre_reset);

	rt.registry.register(class);
	rt.register_timeout_checker(session_timeout_checker);
}

/// SetAttributeSingle with the attribute validation the object mandates:
/// the bounded single PSK of attribute 5 and the 0..=3600 second DTLS
/// timeout of attribute 15, which may only change during a configuration
/// session.
fn set_attribute_single(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	match request.path.attribute_number {
		5 => decode_pre_shared_keys(rt, addr, request, response),
		15 => decode_dtls_timeout(rt, addr, request, response),
		_ => services::set_attribute_single(rt, addr, request, response),
	}
}

/// At most one pre-shared key may be configured, with a bounded identity and
/// key. The stored keys are never readable back.
fn decode_pre_shared_keys(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	let Ok(count) = u8::read_from(&mut request.data) else {
		response.set_status(GeneralStatus::NotEnoughData);
		return;
	};
	if count > 1 {
		response.set_status(GeneralStatus::InvalidAttributeValue);
		return;
	}

	let keys = if count == 0 {
		Vec::new()
	} else {
		let Ok(identity_size) = u8::read_from(&mut request.data) else {
			response.set_status(GeneralStatus::NotEnoughData);
			return;
		};
		if identity_size as usize > SIZE_MAX_PSK_IDENTITY {
			response.set_status(GeneralStatus::InvalidAttributeValue);
			return;
		}
		let mut identity = vec![0u8; identity_size as usize];
		if std::io::Read::read_exact(&mut request.data, &mut identity).is_err() {
			response.set_status(GeneralStatus::NotEnoughData);
			return;
		}

		let Ok(key_size) = u8::read_from(&mut request.data) else {
			response.set_status(GeneralStatus::NotEnoughData);
			return;
		};
		if key_size as usize > SIZE_MAX_PSK {
			response.set_status(GeneralStatus::InvalidAttributeValue);
			return;
		}
		let mut key = vec![0u8; key_size as usize];
		if std::io::Read::read_exact(&mut request.data, &mut key).is_err() {
			response.set_status(GeneralStatus::NotEnoughData);
			return;
		}

		vec![PreSharedKey { identity, key }]
	};

	rt.set_attr_value(
		addr.class_code,
		addr.instance_number,
		5,
		AttrValue::PreSharedKeys(keys),
	);
}

/// The DTLS timeout is clamped to 0..=3600 seconds and writable only while a
/// configuration session is open.
fn decode_dtls_timeout(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::ObjectStateConflict);

	if state(rt) != STATE_CONFIGURATION_IN_PROGRESS {
		return;
	}

	let Ok(timeout_s) = u16::read_from(&mut request.data) else {
		response.set_status(GeneralStatus::NotEnoughData);
		return;
	};
	if timeout_s > 3600 {
		response.set_status(GeneralStatus::InvalidAttributeValue);
		return;
	}

	rt.set_attr_value(
		addr.class_code,
		addr.instance_number,
		15,
		AttrValue::Uint(timeout_s),
	);
	response.set_status(GeneralStatus::Success);
}

fn snapshot(rt: &CipRuntime) -> EipConfigSnapshot {
	let addr = ObjectAddr::new(EIP_SECURITY_CLASS, INSTANCE);
	EipConfigSnapshot {
		prior_state: state(rt),
		attributes: SETTABLE_ATTRIBUTES
			.iter()
			.filter_map(|&number| {
				rt.registry
					.value(addr, number)
					.map(|value| (number, value.clone()))
			})
			.collect(),
	}
}

/// Begin_Config: only reachable from factory default; snapshots the settable
/// attributes so an abort can roll back.
fn begin_config(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	if state(rt) != STATE_FACTORY_DEFAULT {
		response.set_status(GeneralStatus::ObjectStateConflict);
		return;
	}

	rt.security.eip_config_snapshot = Some(snapshot(rt));
	set_state(rt, INSTANCE, STATE_CONFIGURATION_IN_PROGRESS);
	rt.security.eip_config_timer_ms = CONFIG_SESSION_TIMEOUT_MS;
}

fn kick_timer(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::ObjectStateConflict);

	if state(rt) == STATE_CONFIGURATION_IN_PROGRESS {
		rt.security.eip_config_timer_ms = CONFIG_SESSION_TIMEOUT_MS;
		response.set_status(GeneralStatus::Success);
	}
}

/// Apply_Config moves the pending writes into the live policy. Bit 0 of the
/// behavior flags schedules closing existing connections after the close
/// delay; bit 1 schedules the CIP Security object cleanup.
fn apply_config(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::ObjectStateConflict);

	if state(rt) != STATE_CONFIGURATION_IN_PROGRESS {
		return;
	}

	let mut apply_behavior_flags = 0u16;
	let mut close_delay_ms = 0u16;
	if request.remaining() > 0 {
		let (Ok(flags), Ok(delay)) = (
			u16::read_from(&mut request.data),
			u16::read_from(&mut request.data),
		) else {
			response.set_status(GeneralStatus::NotEnoughData);
			return;
		};
		apply_behavior_flags = flags;
		close_delay_ms = delay;
	}

	if apply_behavior_flags & 0x01 != 0 {
		rt.security.close_connections_delay_ms = Some(close_delay_ms as i64);
	}
	if apply_behavior_flags & 0x02 != 0 {
		rt.security.cleanup_pending = true;
	}

	rt.security.eip_config_snapshot = None;
	set_state(rt, INSTANCE, STATE_CONFIGURED);
	info!(rt.logger, "EtherNet/IP security configuration applied";
		"flags" => apply_behavior_flags, "close_delay_ms" => close_delay_ms);
	response.set_status(GeneralStatus::Success);
}

/// Abort_Config discards pending writes, restoring the snapshot taken when
/// the session began.
fn abort_config(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::ObjectStateConflict);

	if state(rt) != STATE_CONFIGURATION_IN_PROGRESS {
		return;
	}

	if let Some(snapshot) = rt.security.eip_config_snapshot.take() {
		for (attribute_number, value) in snapshot.attributes {
			rt.set_attr_value(EIP_SECURITY_CLASS, INSTANCE, attribute_number, value);
		}
		set_state(rt, INSTANCE, snapshot.prior_state);
	} else {
		set_state(rt, INSTANCE, STATE_FACTORY_DEFAULT);
	}
	response.set_status(GeneralStatus::Success);
}

/// Reset, optionally parameterised with the pull model enable octet: absent
/// or 1 re-enables the pull model and returns to factory default, 0 disables
/// it. A reset out of the configured state would require an authenticated
/// transport.
fn pre_reset(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) -> bool {
	if state(rt) == STATE_CONFIGURED {
		/* plain TCP is not an authenticated transport */
		response.set_status(GeneralStatus::PrivilegeViolation);
		return false;
	}

	let enable_pull_model = match request.remaining() {
		0 => true,
		1 => u8::read_from(&mut request.data).unwrap_or(1) != 0,
		_ => {
			response.set_status(GeneralStatus::TooMuchData);
			return false;
		}
	};

	reset_to_factory_default(rt, addr.instance_number, enable_pull_model);
	response.set_status(GeneralStatus::Success);
	true
}

/// The shared reset path, also cascaded into from the CIP Security object.
pub fn reset_to_factory_default(rt: &mut CipRuntime, instance: u16, enable_pull_model: bool) {
	let pull_model_status: u16 = if enable_pull_model { 0x0000 } else { 0xFFFF };
	let state = if enable_pull_model {
		STATE_FACTORY_DEFAULT
	} else {
		STATE_PULL_MODEL_DISABLED
	};

	set_state(rt, instance, state);
	rt.set_attr_value(
		EIP_SECURITY_CLASS,
		instance,
		13,
		AttrValue::Bool(enable_pull_model),
	);
	rt.set_attr_value(
		EIP_SECURITY_CLASS,
		instance,
		14,
		AttrValue::Uint(pull_model_status),
	);

	for attribute_number in SETTABLE_ATTRIBUTES {
		rt.set_attr_value(
			EIP_SECURITY_CLASS,
			instance,
			attribute_number,
			default_value(attribute_number),
		);
	}
	rt.security.eip_config_snapshot = None;

	info!(rt.logger, "EtherNet/IP security reset";
		"instance" => instance, "pull_model" => enable_pull_model);
}

/// An expired configuration session falls back to factory default.
fn session_timeout_checker(rt: &mut CipRuntime, elapsed_ms: u64) {
	if state(rt) != STATE_CONFIGURATION_IN_PROGRESS {
		return;
	}
	rt.security.eip_config_timer_ms -= elapsed_ms as i64;
	if rt.security.eip_config_timer_ms <= 0 {
		info!(rt.logger, "EtherNet/IP security configuration session timed out");
		set_state(rt, INSTANCE, STATE_FACTORY_DEFAULT);
		rt.security.eip_config_snapshot = None;
		rt.security.eip_config_timer_ms = CONFIG_SESSION_TIMEOUT_MS;
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::runtime::test_support::{explicit_request, test_runtime};
	use crate::value::AttrValue;

	fn service_bytes(service: u8) -> Vec<u8> {
		vec![service, 0x02, 0x20, 0x5E, 0x24, 0x01]
	}

	fn set_attribute(attribute: u8, payload: &[u8]) -> Vec<u8> {
		let mut bytes = vec![0x10, 0x03, 0x20, 0x5E, 0x24, 0x01, 0x30, attribute];
		bytes.extend_from_slice(payload);
		bytes
	}

	#[test]
	fn test_dtls_timeout_bounds() {
		let mut rt = test_runtime();
		explicit_request(&mut rt, &service_bytes(SERVICE_BEGIN_CONFIG));

		let response = explicit_request(&mut rt, &set_attribute(15, &0x0E11u16.to_le_bytes()));
		assert_eq!(response.general_status, GeneralStatus::InvalidAttributeValue);

		let response = explicit_request(&mut rt, &set_attribute(15, &0xFFFFu16.to_le_bytes()));
		assert_eq!(response.general_status, GeneralStatus::InvalidAttributeValue);

		let response = explicit_request(&mut rt, &set_attribute(15, &0x0E10u16.to_le_bytes()));
		assert_eq!(response.general_status, GeneralStatus::Success);
	}

	#[test]
	fn test_dtls_timeout_requires_open_session() {
		let mut rt = test_runtime();
		let response = explicit_request(&mut rt, &set_attribute(15, &100u16.to_le_bytes()));
		assert_eq!(response.general_status, GeneralStatus::ObjectStateConflict);
	}

	#[test]
	fn test_psk_limits() {
		let mut rt = test_runtime();

		/* two keys are refused */
		let response = explicit_request(&mut rt, &set_attribute(5, &[0x02]));
		assert_eq!(response.general_status, GeneralStatus::InvalidAttributeValue);

		/* over-length identity */
		let mut payload = vec![0x01, 0x81];
		payload.extend_from_slice(&[0u8; 129]);
		let response = explicit_request(&mut rt, &set_attribute(5, &payload));
		assert_eq!(response.general_status, GeneralStatus::InvalidAttributeValue);

		/* a single bounded key is accepted and reads back empty */
		let mut payload = vec![0x01, 0x04];
		payload.extend_from_slice(b"user");
		payload.push(0x08);
		payload.extend_from_slice(&[0xAA; 8]);
		let response = explicit_request(&mut rt, &set_attribute(5, &payload));
		assert_eq!(response.general_status, GeneralStatus::Success);

		let read = explicit_request(&mut rt, &[0x0E, 0x03, 0x20, 0x5E, 0x24, 0x01, 0x30, 0x05]);
		assert_eq!(read.general_status, GeneralStatus::Success);
		assert_eq!(read.message.as_slice(), &[0x00]);
	}

	#[test]
	fn test_apply_config_schedules_teardown_and_cleanup() {
		let mut rt = test_runtime();
		explicit_request(&mut rt, &service_bytes(SERVICE_BEGIN_CONFIG));

		let mut bytes = service_bytes(SERVICE_APPLY_CONFIG);
		bytes.extend_from_slice(&0x0003u16.to_le_bytes());
		bytes.extend_from_slice(&0u16.to_le_bytes());
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(state(&rt), STATE_CONFIGURED);
		assert_eq!(rt.security.close_connections_delay_ms, Some(0));
		assert!(rt.security.cleanup_pending);

		rt.manage(1);
		assert_eq!(rt.security.close_connections_delay_ms, None);
		assert!(!rt.security.cleanup_pending);
	}

	#[test]
	fn test_abort_config_rolls_back() {
		let mut rt = test_runtime();
		explicit_request(&mut rt, &service_bytes(SERVICE_BEGIN_CONFIG));

		let response = explicit_request(&mut rt, &set_attribute(16, &[0x01]));
		assert_eq!(response.general_status, GeneralStatus::Success);

		let response = explicit_request(&mut rt, &service_bytes(SERVICE_ABORT_CONFIG));
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(state(&rt), STATE_FACTORY_DEFAULT);
		assert_eq!(
			rt.registry
				.value(ObjectAddr::new(EIP_SECURITY_CLASS, 1), 16),
			Some(&AttrValue::Usint(0))
		);
	}

	#[test]
	fn test_reset_disabling_pull_model() {
		let mut rt = test_runtime();
		let mut bytes = service_bytes(services::RESET);
		bytes.push(0x00);
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(state(&rt), STATE_PULL_MODEL_DISABLED);
		assert_eq!(
			rt.registry
				.value(ObjectAddr::new(EIP_SECURITY_CLASS, 1), 14),
			Some(&AttrValue::Uint(0xFFFF))
		);
	}
}
