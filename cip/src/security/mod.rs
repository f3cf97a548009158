pub mod certificatemanagement;
pub mod cipsecurity;
pub mod eipsecurity;

use slog::info;

use crate::runtime::CipRuntime;
use crate::value::AttrValue;

/// Both security configuration sessions run on a ten second timer.
pub const CONFIG_SESSION_TIMEOUT_MS: i64 = 10_000;

/// Saved settable attributes of the EtherNet/IP Security object, taken when
/// a configuration session begins so Abort_Config can roll back.
#[derive(Debug, Clone)]
pub struct EipConfigSnapshot {
	pub prior_state: u8,
	pub attributes: Vec<(u16, AttrValue)>,
}

/// Timer and scheduling state of the security objects, outside the
/// attribute-visible object model.
#[derive(Debug)]
pub struct SecurityRuntime {
	pub cip_config_timer_ms: i64,
	pub eip_config_timer_ms: i64,
	pub eip_config_snapshot: Option<EipConfigSnapshot>,
	/// Apply_Config bit 0: close existing connections once this has elapsed.
	pub close_connections_delay_ms: Option<i64>,
	/// Apply_Config bit 1: run the CIP Security object cleanup afterwards.
	pub cleanup_pending: bool,
}

impl Default for SecurityRuntime {
	fn default() -> Self {
		SecurityRuntime {
			cip_config_timer_ms: CONFIG_SESSION_TIMEOUT_MS,
			eip_config_timer_ms: CONFIG_SESSION_TIMEOUT_MS,
			eip_config_snapshot: None,
			close_connections_delay_ms: None,
			cleanup_pending: false,
		}
	}
}

/// Perform actions Apply_Config scheduled: connection teardown after the
/// close delay, then the object cleanup sweep.
pub fn run_scheduled_actions(rt: &mut CipRuntime, elapsed_ms: u64) {
	if let Some(delay) = rt.security.close_connections_delay_ms {
		let remaining = delay - elapsed_ms as i64;
		if remaining <= 0 {
			rt.security.close_connections_delay_ms = None;
			info!(rt.logger, "closing existing connections after security apply");
			crate::connection::close_all_connections(rt);
		} else {
			rt.security.close_connections_delay_ms = Some(remaining);
		}
	}

	if rt.security.cleanup_pending && rt.security.close_connections_delay_ms.is_none() {
		rt.security.cleanup_pending = false;
		/* nothing orphaned to sweep in this device image */
		info!(rt.logger, "security object cleanup ran");
	}
}
