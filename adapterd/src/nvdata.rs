use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use slog::{info, warn};

use cip::object::ObjectAddr;
use cip::objects::{qos, tcpip};
use cip::value::AttrValue;
use cip::{CipRuntime, TCP_IP_INTERFACE_CLASS};

const NV_FILE: &str = "nvdata.toml";

/// The attributes surviving a restart: the QoS DSCP values and the settable
/// TCP/IP interface attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvData {
	pub qos: QosNv,
	pub tcpip: TcpIpNv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosNv {
	pub dscp_urgent: u8,
	pub dscp_scheduled: u8,
	pub dscp_high: u8,
	pub dscp_low: u8,
	pub dscp_explicit: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpIpNv {
	pub configuration_control: u32,
	pub host_name: String,
	pub multicast_ttl: u8,
	pub encapsulation_inactivity_timeout_s: u16,
}

/// Snapshot the NV-flagged attributes out of the object model.
pub fn collect(rt: &CipRuntime) -> NvData {
	let [dscp_urgent, dscp_scheduled, dscp_high, dscp_low, dscp_explicit] =
		qos::dscp_values(&rt.registry);
	let tcpip_addr = ObjectAddr::new(TCP_IP_INTERFACE_CLASS, 1);

	let host_name = match rt.registry.value(tcpip_addr, 6) {
		Some(AttrValue::String(name)) => String::from_utf8_lossy(&name.0).into_owned(),
		_ => String::new(),
	};

	NvData {
		qos: QosNv {
			dscp_urgent,
			dscp_scheduled,
			dscp_high,
			dscp_low,
			dscp_explicit,
		},
		tcpip: TcpIpNv {
			configuration_control: rt.registry.get_u32(tcpip_addr, 3).unwrap_or(0),
			host_name,
			multicast_ttl: tcpip::multicast_ttl(&rt.registry),
			encapsulation_inactivity_timeout_s: rt.encapsulation_inactivity_timeout_s(),
		},
	}
}

/// Put persisted values back into the object model at startup.
pub fn apply(rt: &mut CipRuntime, data: &NvData) {
	qos::restore_dscp_values(
		&mut rt.registry,
		[
			data.qos.dscp_urgent,
			data.qos.dscp_scheduled,
			data.qos.dscp_high,
			data.qos.dscp_low,
			data.qos.dscp_explicit,
		],
	);

	let tcpip_addr = ObjectAddr::new(TCP_IP_INTERFACE_CLASS, 1);
	rt.registry.set_value(
		tcpip_addr,
		3,
		AttrValue::Dword(data.tcpip.configuration_control),
	);
	rt.registry.set_value(
		tcpip_addr,
		6,
		AttrValue::String(cipwire::CipString::from_str(&data.tcpip.host_name)),
	);
	rt.registry
		.set_value(tcpip_addr, 8, AttrValue::Usint(data.tcpip.multicast_ttl));
	rt.registry.set_value(
		tcpip_addr,
		13,
		AttrValue::Uint(data.tcpip.encapsulation_inactivity_timeout_s),
	);
}

pub fn load(directory: &Path, logger: &slog::Logger) -> Option<NvData> {
	let path = directory.join(NV_FILE);
	let raw = std::fs::read_to_string(&path).ok()?;
	match toml::from_str(&raw) {
		Ok(data) => {
			info!(logger, "nv data restored"; "path" => %path.display());
			Some(data)
		}
		Err(error) => {
			warn!(logger, "nv data unreadable, using defaults";
				"path" => %path.display(), "error" => %error);
			None
		}
	}
}

pub fn store(directory: &Path, data: &NvData, logger: &slog::Logger) -> anyhow::Result<()> {
	std::fs::create_dir_all(directory)
		.with_context(|| format!("creating {}", directory.display()))?;
	let path = directory.join(NV_FILE);
	let raw = toml::to_string(data).context("serialising nv data")?;
	std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
	info!(logger, "nv data stored"; "path" => %path.display());
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_nv_roundtrip_through_toml() {
		let data = NvData {
			qos: QosNv {
				dscp_urgent: 55,
				dscp_scheduled: 47,
				dscp_high: 43,
				dscp_low: 31,
				dscp_explicit: 27,
			},
			tcpip: TcpIpNv {
				configuration_control: 1,
				host_name: "press-line-7".to_string(),
				multicast_ttl: 1,
				encapsulation_inactivity_timeout_s: 90,
			},
		};
		let raw = toml::to_string(&data).unwrap();
		let decoded: NvData = toml::from_str(&raw).unwrap();
		assert_eq!(decoded, data);
	}
}
