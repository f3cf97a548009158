use slog::info;

use crate::message::{Request, Response};
use crate::object::{AttributeFlags, CipClass, ObjectAddr};
use crate::runtime::CipRuntime;
use crate::security::CONFIG_SESSION_TIMEOUT_MS;
use crate::services;
use crate::status::GeneralStatus;
use crate::value::AttrValue;
use crate::{CIP_SECURITY_CLASS, EIP_SECURITY_CLASS};

pub const SERVICE_BEGIN_CONFIG: u8 = 0x4B;
pub const SERVICE_KICK_TIMER: u8 = 0x4C;
pub const SERVICE_END_CONFIG: u8 = 0x4D;
pub const SERVICE_OBJECT_CLEANUP: u8 = 0x4E;

/* State attribute values, Vol. 8 5-3.4.1. */
pub const STATE_FACTORY_DEFAULT: u8 = 0;
pub const STATE_CONFIGURATION_IN_PROGRESS: u8 = 1;
pub const STATE_CONFIGURED: u8 = 2;
pub const STATE_INCOMPLETE_CONFIGURATION: u8 = 3;

/* Security profile bits of attributes 2 and 3. */
const PROFILE_ETHERNET_IP_CONFIDENTIALITY: u16 = 0x02;

const INSTANCE: u16 = 1;

pub fn state(rt: &CipRuntime) -> u8 {
	rt.attr_u8(CIP_SECURITY_CLASS, INSTANCE, 1)
		.unwrap_or(STATE_FACTORY_DEFAULT)
}

pub fn set_state(rt: &mut CipRuntime, state: u8) {
	rt.set_attr_value(CIP_SECURITY_CLASS, INSTANCE, 1, AttrValue::Usint(state));
}

/// Create the CIP Security object, instance 1: the state machine that
/// brackets device security configuration sessions.
pub fn init(rt: &mut CipRuntime) {
	let mut class = CipClass::new(CIP_SECURITY_CLASS, "CIP Security", 3, 3, 7);
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
		AttrValue::Word(PROFILE_ETHERNET_IP_CONFIDENTIALITY),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		INSTANCE,
		3,
		AttrValue::Word(PROFILE_ETHERNET_IP_CONFIDENTIALITY),
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
	class.insert_service(services::RESET, services::reset, "Reset");
	class.insert_service(SERVICE_BEGIN_CONFIG, begin_config, "BeginConfig");
	class.insert_service(SERVICE_KICK_TIMER, kick_timer, "KickTimer");
	class.insert_service(SERVICE_END_CONFIG, end_config, "EndConfig");
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
	class.insert_class_service(SERVICE_OBJECT_CLEANUP, object_cleanup, "ObjectCleanup");

	class.hooks.pre_reset = Some(pre_reset);

	rt.registry.register(class);
	rt.register_timeout_checker(session_timeout_checker);
}

/// Reset returns the object to factory defaults and cascades a reset through
/// every EtherNet/IP Security instance. Any request payload is too much.
fn pre_reset(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) -> bool {
	if request.remaining() > 0 {
		response.set_status(GeneralStatus::TooMuchData);
		return false;
	}

	set_state(rt, STATE_FACTORY_DEFAULT);

	let eip_instances: Vec<u16> = rt
		.registry
		.class(EIP_SECURITY_CLASS)
		.map(|class| class.instances.iter().map(|i| i.instance_number).collect())
		.unwrap_or_default();
	for instance_number in eip_instances {
		crate::security::eipsecurity::reset_to_factory_default(rt, instance_number, true);
	}

	info!(rt.logger, "CIP security reset to factory default");
	response.set_status(GeneralStatus::Success);
	true
}

/// Begin_Config opens a configuration session and starts the ten second
/// session timer. From Configured the request would need an authenticated
/// transport, which plain TCP is not.
fn begin_config(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::PrivilegeViolation);

	match state(rt) {
		STATE_CONFIGURATION_IN_PROGRESS => {
			response.set_status(GeneralStatus::ObjectStateConflict);
		}
		STATE_CONFIGURED => {
			response.set_status(GeneralStatus::PrivilegeViolation);
		}
		_ => {
			set_state(rt, STATE_CONFIGURATION_IN_PROGRESS);
			rt.security.cip_config_timer_ms = CONFIG_SESSION_TIMEOUT_MS;
			response.set_status(GeneralStatus::Success);
		}
	}
}

/// Kick_Timer reloads the running session timer.
fn kick_timer(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::ObjectStateConflict);

	if state(rt) == STATE_CONFIGURATION_IN_PROGRESS {
		rt.security.cip_config_timer_ms = CONFIG_SESSION_TIMEOUT_MS;
		response.set_status(GeneralStatus::Success);
	}
}

/// End_Config completes the session.
fn end_config(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::ObjectStateConflict);

	if state(rt) == STATE_CONFIGURATION_IN_PROGRESS {
		set_state(rt, STATE_CONFIGURED);
		response.set_status(GeneralStatus::Success);
	}
}

/// Object_Cleanup removes configuration orphans; with none present it
/// reports exactly that.
fn object_cleanup(
	_rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::VerificationFailed);
}

/// An expired configuration session demotes the object to incomplete
/// configuration.
fn session_timeout_checker(rt: &mut CipRuntime, elapsed_ms: u64) {
	if state(rt) != STATE_CONFIGURATION_IN_PROGRESS {
		return;
	}
	rt.security.cip_config_timer_ms -= elapsed_ms as i64;
	if rt.security.cip_config_timer_ms <= 0 {
		info!(rt.logger, "CIP security configuration session timed out");
		set_state(rt, STATE_INCOMPLETE_CONFIGURATION);
		rt.security.cip_config_timer_ms = CONFIG_SESSION_TIMEOUT_MS;
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::runtime::test_support::{explicit_request, test_runtime};

	fn service_bytes(service: u8) -> Vec<u8> {
		vec![service, 0x02, 0x20, 0x5D, 0x24, 0x01]
	}

	#[test]
	fn test_begin_kick_end_session() {
		let mut rt = test_runtime();
		assert_eq!(state(&rt), STATE_FACTORY_DEFAULT);

		let response = explicit_request(&mut rt, &service_bytes(SERVICE_BEGIN_CONFIG));
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(state(&rt), STATE_CONFIGURATION_IN_PROGRESS);

		for _ in 0..2 {
			let response = explicit_request(&mut rt, &service_bytes(SERVICE_KICK_TIMER));
			assert_eq!(response.general_status, GeneralStatus::Success);
		}

		/* a second Begin_Config mid-session conflicts */
		let response = explicit_request(&mut rt, &service_bytes(SERVICE_BEGIN_CONFIG));
		assert_eq!(response.general_status, GeneralStatus::ObjectStateConflict);

		let response = explicit_request(&mut rt, &service_bytes(SERVICE_END_CONFIG));
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(state(&rt), STATE_CONFIGURED);
	}

	#[test]
	fn test_session_timer_demotes_to_incomplete() {
		let mut rt = test_runtime();
		let response = explicit_request(&mut rt, &service_bytes(SERVICE_BEGIN_CONFIG));
		assert_eq!(response.general_status, GeneralStatus::Success);

		rt.manage(9_999);
		assert_eq!(state(&rt), STATE_CONFIGURATION_IN_PROGRESS);
		rt.manage(2);
		assert_eq!(state(&rt), STATE_INCOMPLETE_CONFIGURATION);
	}

	#[test]
	fn test_kick_timer_defers_expiry() {
		let mut rt = test_runtime();
		explicit_request(&mut rt, &service_bytes(SERVICE_BEGIN_CONFIG));

		rt.manage(8_000);
		explicit_request(&mut rt, &service_bytes(SERVICE_KICK_TIMER));
		rt.manage(8_000);
		/* the kick reset the window, so the session is still open */
		assert_eq!(state(&rt), STATE_CONFIGURATION_IN_PROGRESS);
	}

	#[test]
	fn test_reset_cascades_to_eip_security() {
		let mut rt = test_runtime();
		explicit_request(&mut rt, &service_bytes(SERVICE_BEGIN_CONFIG));
		explicit_request(&mut rt, &service_bytes(SERVICE_END_CONFIG));
		assert_eq!(state(&rt), STATE_CONFIGURED);

		let response = explicit_request(&mut rt, &service_bytes(services::RESET));
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(state(&rt), STATE_FACTORY_DEFAULT);
		assert_eq!(
			crate::security::eipsecurity::state(&rt),
			crate::security::eipsecurity::STATE_FACTORY_DEFAULT
		);
	}

	#[test]
	fn test_reset_with_payload_is_too_much_data() {
		let mut rt = test_runtime();
		let mut bytes = service_bytes(services::RESET);
		bytes.push(0x01);
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::TooMuchData);
	}
}
