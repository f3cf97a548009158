use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use slog::{info, o};

use cipwire::CipShortString;

use crate::connection::ConnectionManager;
use crate::object::Registry;
use crate::objects;
use crate::security::{self, SecurityRuntime};
use crate::value::AttrValue;

/// Octets reserved in the send buffer for the encapsulation header and the
/// Common Packet Format wrapper around a Message Router Response.
pub const ENCAPSULATION_RESERVE: usize = 33;

/// The default upper bound on a single encapsulated frame.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// The UDP port Class 0/1 I/O traffic uses.
pub const IO_UDP_PORT: u16 = 0x08AE;

/// A handle the platform socket layer hands out for a producing or consuming
/// UDP socket.
pub type SocketHandle = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpDirection {
	Consuming,
	Producing,
}

/// The platform socket layer the connection manager drives. Sends are
/// assumed non-blocking up to one MTU.
pub trait SocketDriver {
	fn create_udp_socket(
		&mut self,
		direction: UdpDirection,
		address: SocketAddrV4,
		qos_dscp: u8,
	) -> Option<SocketHandle>;

	fn close_udp_socket(&mut self, handle: SocketHandle);

	fn send_udp(
		&mut self,
		handle: SocketHandle,
		destination: SocketAddrV4,
		data: &[u8],
	) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoConnectionEvent {
	Opened,
	TimedOut,
	Closed,
}

/// The application I/O side of the adapter: assembly payload callbacks and
/// lifecycle notifications.
pub trait Application {
	/// Called right before a produced assembly is sent. Returning true means
	/// the payload changed, which advances the application sequence counter.
	fn before_assembly_data_send(&mut self, _instance_number: u16) -> bool {
		false
	}

	/// Called after consumed data has been written into an assembly buffer.
	fn after_assembly_data_received(&mut self, _instance_number: u16) -> Result<(), ()> {
		Ok(())
	}

	/// The 32-bit run/idle header changed value.
	fn run_idle_changed(&mut self, _run_idle: u32) {}

	fn io_connection_event(
		&mut self,
		_output_point: u32,
		_input_point: u32,
		_event: IoConnectionEvent,
	) {
	}

	/// Identity object Reset service, with the requested reset type.
	fn reset_device(&mut self, _reset_type: u8) {}
}

/// The Create_CSR request parameters, in wire order.
#[derive(Debug, Clone, Default)]
pub struct CsrFields {
	pub common_name: CipShortString,
	pub organization: CipShortString,
	pub organizational_unit: CipShortString,
	pub locality: CipShortString,
	pub state: CipShortString,
	pub country: CipShortString,
	pub email: CipShortString,
	pub serial_number: CipShortString,
}

/// The certificate cryptography collaborator: CSR generation and chain
/// verification live outside the core.
pub trait CertificateStore {
	/// Produce a PEM CSR for the given subject fields.
	fn generate_csr(&mut self, fields: &CsrFields) -> Vec<u8>;

	/// Verify the certificate held by the File Object instance the EPATH
	/// names. Returns false when the chain does not check out.
	fn verify_certificate(&mut self, path: &cipwire::CipEpath) -> bool;
}

/// The device identity the Identity object advertises and the electronic key
/// check compares against.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
	pub vendor_id: u16,
	pub device_type: u16,
	pub product_code: u16,
	pub revision_major: u8,
	pub revision_minor: u8,
	pub status: u16,
	pub serial_number: u32,
	pub product_name: String,
}

impl Default for DeviceIdentity {
	fn default() -> Self {
		DeviceIdentity {
			vendor_id: 1,
			device_type: 0x0C, /* communications adapter */
			product_code: 65001,
			revision_major: 1,
			revision_minor: 0,
			status: 0,
			serial_number: 0,
			product_name: "EtherNet/IP adapter".to_string(),
		}
	}
}

/// The IP-level settings the TCP/IP Interface and Ethernet Link objects
/// expose.
#[derive(Debug, Clone)]
pub struct InterfaceSettings {
	pub ip_address: Ipv4Addr,
	pub network_mask: Ipv4Addr,
	pub gateway: Ipv4Addr,
	pub name_server: Ipv4Addr,
	pub name_server_2: Ipv4Addr,
	pub domain_name: String,
	pub host_name: String,
	pub mac_address: [u8; 6],
}

impl Default for InterfaceSettings {
	fn default() -> Self {
		InterfaceSettings {
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

/// One pre-wired application connection slot: the output/input/configuration
/// assembly triple it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTriple {
	pub output: u32,
	pub input: u32,
	pub config: u32,
}

/// Stack-wide tunables, the runtime equivalent of the build-time options of
/// the configuration surface.
#[derive(Debug, Clone)]
pub struct StackConfig {
	/// Upper bound on a single encapsulated frame.
	pub buffer_size: usize,
	/// Nominal granularity of the platform tick in milliseconds.
	pub timer_tick_ms: u64,
	/// Whether consumed Class 1 data carries a leading 32-bit run/idle header.
	pub consumed_data_has_run_idle_header: bool,
	/// Whether produced Class 1 data carries one.
	pub produced_data_has_run_idle_header: bool,
	/// Initial value of TCP/IP Interface attribute 13, in seconds.
	pub encapsulation_inactivity_timeout_s: u16,
	pub exclusive_owner_slots: Vec<SlotTriple>,
	pub input_only_slots: Vec<SlotTriple>,
	pub input_only_connections_per_path: usize,
	pub listen_only_slots: Vec<SlotTriple>,
	pub listen_only_connections_per_path: usize,
	pub explicit_connections: usize,
}

impl Default for StackConfig {
	fn default() -> Self {
		StackConfig {
			buffer_size: DEFAULT_BUFFER_SIZE,
			timer_tick_ms: 1,
			consumed_data_has_run_idle_header: true,
			produced_data_has_run_idle_header: false,
			encapsulation_inactivity_timeout_s: 120,
			exclusive_owner_slots: Vec::new(),
			input_only_slots: Vec::new(),
			input_only_connections_per_path: 3,
			listen_only_slots: Vec::new(),
			listen_only_connections_per_path: 3,
			explicit_connections: 6,
		}
	}
}

impl StackConfig {
	/// Room a Message Router Response may occupy inside one frame.
	pub fn response_buffer_capacity(&self) -> usize {
		self.buffer_size.saturating_sub(ENCAPSULATION_RESERVE)
	}
}

/// A timeout checker runs on every managed tick, letting objects with
/// session timers (the security objects) count down.
pub type TimeoutCheckerFn = fn(&mut CipRuntime, elapsed_ms: u64);

/// The explicitly-scoped stack state: the object registry, the connection
/// manager, the security object runtime, and the external collaborators.
/// Everything is mutated from the single platform loop thread.
pub struct CipRuntime {
	pub registry: Registry,
	pub connections: ConnectionManager,
	pub security: SecurityRuntime,
	pub sockets: Box<dyn SocketDriver>,
	pub app: Box<dyn Application>,
	pub certificates: Box<dyn CertificateStore>,
	pub config: StackConfig,
	pub device: DeviceIdentity,
	pub logger: slog::Logger,
	/// Set when an NV-flagged attribute was written; the platform NV layer
	/// clears it after persisting.
	pub nv_dirty: bool,
	/// The shared run/idle state consumed from and produced into Class 1
	/// frames.
	pub run_idle_state: u32,
	/// Encapsulation sessions the connection layer decided must be torn
	/// down. Drained by the platform loop.
	pub sessions_to_close: Vec<u32>,
	timeout_checkers: Vec<TimeoutCheckerFn>,
}

impl CipRuntime {
	/// Bring up the whole object model. The message router is the first
	/// object initialised; the application wires its assembly instances
	/// afterwards through [`objects::assembly::create_assembly_instance`].
	pub fn new(
		device: DeviceIdentity,
		interface: InterfaceSettings,
		config: StackConfig,
		sockets: Box<dyn SocketDriver>,
		app: Box<dyn Application>,
		certificates: Box<dyn CertificateStore>,
		logger: slog::Logger,
	) -> CipRuntime {
		let incarnation_seed = common::rand::rand_u16().unwrap_or(0x4D2);
		let connections = ConnectionManager::new(&config, incarnation_seed);

		let mut rt = CipRuntime {
			registry: Registry::new(),
			connections,
			security: SecurityRuntime::default(),
			sockets,
			app,
			certificates,
			config,
			device,
			logger: logger.new(o!("component" => "cip")),
			nv_dirty: false,
			run_idle_state: 0,
			sessions_to_close: Vec::new(),
			timeout_checkers: Vec::new(),
		};

		objects::messagerouter::init(&mut rt.registry);
		objects::identity::init(&mut rt.registry, &rt.device);
		objects::tcpip::init(&mut rt.registry, &interface, &rt.config);
		objects::ethernetlink::init(&mut rt.registry, &interface);
		crate::connection::init_connection_manager_object(&mut rt.registry);
		objects::assembly::init(&mut rt.registry);
		objects::qos::init(&mut rt.registry);
		objects::file::init(&mut rt.registry);
		security::cipsecurity::init(&mut rt);
		security::eipsecurity::init(&mut rt);
		security::certificatemanagement::init(&mut rt);

		info!(rt.logger, "object model initialised";
			"classes" => rt.registry.class_count());
		rt
	}

	pub fn register_timeout_checker(&mut self, checker: TimeoutCheckerFn) {
		self.timeout_checkers.push(checker);
	}

	/// One managed tick: advance every connection timer, then the registered
	/// session timers, then any scheduled security actions.
	pub fn manage(&mut self, elapsed_ms: u64) {
		crate::connection::manage_connections(self, elapsed_ms);

		let checkers = self.timeout_checkers.clone();
		for checker in checkers {
			checker(self, elapsed_ms);
		}

		security::run_scheduled_actions(self, elapsed_ms);
	}

	/// The live value of TCP/IP Interface attribute 13.
	pub fn encapsulation_inactivity_timeout_s(&self) -> u16 {
		objects::tcpip::encapsulation_inactivity_timeout(&self.registry)
			.unwrap_or(self.config.encapsulation_inactivity_timeout_s)
	}

	pub fn take_sessions_to_close(&mut self) -> Vec<u32> {
		std::mem::take(&mut self.sessions_to_close)
	}

	/// True once since the last call if NV data must be persisted.
	pub fn take_nv_dirty(&mut self) -> bool {
		std::mem::take(&mut self.nv_dirty)
	}

	/// Convenience accessor used across the stack.
	pub(crate) fn attr_u8(&self, class: u16, instance: u16, attribute: u16) -> Option<u8> {
		self.registry
			.get_u8(crate::object::ObjectAddr::new(class, instance), attribute)
	}

	pub(crate) fn set_attr_value(
		&mut self,
		class: u16,
		instance: u16,
		attribute: u16,
		value: AttrValue,
	) {
		self.registry
			.set_value(crate::object::ObjectAddr::new(class, instance), attribute, value);
	}
}
