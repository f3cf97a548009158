use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use cip::runtime::{DeviceIdentity, InterfaceSettings, SlotTriple, StackConfig};

/// The adapter configuration file. Everything has a default so a missing
/// file brings up the demo wiring.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
	pub device: DeviceSection,
	pub network: NetworkSection,
	pub stack: StackSection,
	pub assembly: Vec<AssemblySection>,
	pub exclusive_owner: Vec<SlotSection>,
	pub input_only: Vec<SlotSection>,
	pub listen_only: Vec<SlotSection>,
	pub nv_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
	pub vendor_id: u16,
	pub device_type: u16,
	pub product_code: u16,
	pub revision_major: u8,
	pub revision_minor: u8,
	pub serial_number: u32,
	pub product_name: String,
}

impl Default for DeviceSection {
	fn default() -> Self {
		DeviceSection {
			vendor_id: 1,
			device_type: 0x0C,
			product_code: 65001,
			revision_major: 1,
			revision_minor: 0,
			serial_number: 0x0060_1234,
			product_name: "adapterd sample device".to_string(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
	pub ip_address: Ipv4Addr,
	pub network_mask: Ipv4Addr,
	pub gateway: Ipv4Addr,
	pub name_server: Ipv4Addr,
	pub name_server_2: Ipv4Addr,
	pub domain_name: String,
	pub host_name: String,
	pub mac_address: [u8; 6],
}

impl Default for NetworkSection {
	fn default() -> Self {
		NetworkSection {
			ip_address: Ipv4Addr::UNSPECIFIED,
			network_mask: Ipv4Addr::UNSPECIFIED,
			gateway: Ipv4Addr::UNSPECIFIED,
			name_server: Ipv4Addr::UNSPECIFIED,
			name_server_2: Ipv4Addr::UNSPECIFIED,
			domain_name: String::new(),
			host_name: String::new(),
			mac_address: [0; 6],
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackSection {
	pub buffer_size: usize,
	pub timer_tick_ms: u64,
	pub consumed_data_has_run_idle_header: bool,
	pub produced_data_has_run_idle_header: bool,
	pub encapsulation_inactivity_timeout_s: u16,
	pub input_only_connections_per_path: usize,
	pub listen_only_connections_per_path: usize,
	pub explicit_connections: usize,
}

impl Default for StackSection {
	fn default() -> Self {
		let defaults = StackConfig::default();
		StackSection {
			buffer_size: defaults.buffer_size,
			timer_tick_ms: defaults.timer_tick_ms,
			consumed_data_has_run_idle_header: defaults.consumed_data_has_run_idle_header,
			produced_data_has_run_idle_header: defaults.produced_data_has_run_idle_header,
			encapsulation_inactivity_timeout_s: defaults.encapsulation_inactivity_timeout_s,
			input_only_connections_per_path: defaults.input_only_connections_per_path,
			listen_only_connections_per_path: defaults.listen_only_connections_per_path,
			explicit_connections: defaults.explicit_connections,
		}
	}
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssemblySection {
	pub id: u16,
	pub size: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotSection {
	pub output: u32,
	pub input: u32,
	pub config: u32,
}

impl Default for AdapterConfig {
	/// The demo wiring: a 32-octet input/output pair with a 10-octet
	/// configuration assembly, plus heartbeat output assemblies for the
	/// input only and listen only slots.
	fn default() -> Self {
		AdapterConfig {
			device: DeviceSection::default(),
			network: NetworkSection::default(),
			stack: StackSection::default(),
			assembly: vec![
				AssemblySection { id: 100, size: 32 },
				AssemblySection { id: 150, size: 32 },
				AssemblySection { id: 151, size: 10 },
				AssemblySection { id: 152, size: 0 },
				AssemblySection { id: 153, size: 0 },
			],
			exclusive_owner: vec![SlotSection {
				output: 150,
				input: 100,
				config: 151,
			}],
			input_only: vec![SlotSection {
				output: 152,
				input: 100,
				config: 151,
			}],
			listen_only: vec![SlotSection {
				output: 153,
				input: 100,
				config: 151,
			}],
			nv_dir: PathBuf::from("nvdata"),
		}
	}
}

impl AdapterConfig {
	pub fn load(path: &Path) -> anyhow::Result<AdapterConfig> {
		if !path.exists() {
			return Ok(AdapterConfig::default());
		}
		let raw = std::fs::read_to_string(path)
			.with_context(|| format!("reading {}", path.display()))?;
		toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
	}

	pub fn device_identity(&self) -> DeviceIdentity {
		DeviceIdentity {
			vendor_id: self.device.vendor_id,
			device_type: self.device.device_type,
			product_code: self.device.product_code,
			revision_major: self.device.revision_major,
			revision_minor: self.device.revision_minor,
			status: 0,
			serial_number: self.device.serial_number,
			product_name: self.device.product_name.clone(),
		}
	}

	pub fn interface_settings(&self) -> InterfaceSettings {
		InterfaceSettings {
			ip_address: self.network.ip_address,
			network_mask: self.network.network_mask,
			gateway: self.network.gateway,
			name_server: self.network.name_server,
			name_server_2: self.network.name_server_2,
			domain_name: self.network.domain_name.clone(),
			host_name: self.network.host_name.clone(),
			mac_address: self.network.mac_address,
		}
	}

	pub fn stack_config(&self) -> StackConfig {
		let slot = |section: &SlotSection| SlotTriple {
			output: section.output,
			input: section.input,
			config: section.config,
		};
		StackConfig {
			buffer_size: self.stack.buffer_size,
			timer_tick_ms: self.stack.timer_tick_ms,
			consumed_data_has_run_idle_header: self.stack.consumed_data_has_run_idle_header,
			produced_data_has_run_idle_header: self.stack.produced_data_has_run_idle_header,
			encapsulation_inactivity_timeout_s: self.stack.encapsulation_inactivity_timeout_s,
			exclusive_owner_slots: self.exclusive_owner.iter().map(slot).collect(),
			input_only_slots: self.input_only.iter().map(slot).collect(),
			input_only_connections_per_path: self.stack.input_only_connections_per_path,
			listen_only_slots: self.listen_only.iter().map(slot).collect(),
			listen_only_connections_per_path: self.stack.listen_only_connections_per_path,
			explicit_connections: self.stack.explicit_connections,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_default_wiring_matches_demo() {
		let config = AdapterConfig::default();
		assert_eq!(config.assembly.len(), 5);
		assert_eq!(config.exclusive_owner[0].output, 150);
		assert_eq!(config.exclusive_owner[0].input, 100);
		assert_eq!(config.exclusive_owner[0].config, 151);
	}

	#[test]
	fn test_parse_partial_file() {
		let parsed: AdapterConfig = toml::from_str(
			r#"
			[device]
			vendor_id = 42
			product_name = "press line adapter"

			[[assembly]]
			id = 110
			size = 8
			"#,
		)
		.unwrap();
		assert_eq!(parsed.device.vendor_id, 42);
		assert_eq!(parsed.assembly.len(), 1);
		/* unnamed sections keep their defaults */
		assert_eq!(parsed.stack.encapsulation_inactivity_timeout_s, 120);
	}
}
