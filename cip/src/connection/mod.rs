pub mod appconn;
pub mod class3;
pub mod io;
pub mod path;

use std::net::{Ipv4Addr, SocketAddrV4};

use slog::{info, warn};

use cipwire::ReadFrom;

use crate::cpf::ConnectedPacket;
use crate::message::{Request, Response};
use crate::object::{CipClass, ObjectAddr, Registry};
use crate::runtime::{CipRuntime, SocketHandle, StackConfig};
use crate::services;
use crate::status::{extended_status, GeneralStatus};
use crate::{ASSEMBLY_CLASS, CONNECTION_MANAGER_CLASS, MESSAGE_ROUTER_CLASS};

pub const DIRECTION_CONSUMING: usize = 0;
pub const DIRECTION_PRODUCING: usize = 1;

/// 32-bit sequence comparison per Vol. 2 3-4.2.
pub fn seq_gt32(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) > 0
}

/// 16-bit variant for the application sequence count.
pub fn seq_leq16(a: u16, b: u16) -> bool {
	(a.wrapping_sub(b) as i16) <= 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
	#[default]
	NonExistent,
	Configuring,
	WaitingForConnectionId,
	Established,
	TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceType {
	#[default]
	Explicit,
	IoExclusiveOwner,
	IoInputOnly,
	IoListenOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
	#[default]
	Null,
	Multicast,
	PointToPoint,
	Reserved,
}

impl ConnectionType {
	fn from_bits(bits: u32) -> ConnectionType {
		match bits & 0x03 {
			0 => ConnectionType::Null,
			1 => ConnectionType::Multicast,
			2 => ConnectionType::PointToPoint,
			_ => ConnectionType::Reserved,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
	#[default]
	Low,
	High,
	Scheduled,
	Urgent,
}

impl Priority {
	fn from_bits(bits: u32) -> Priority {
		match bits & 0x03 {
			0 => Priority::Low,
			1 => Priority::High,
			2 => Priority::Scheduled,
			_ => Priority::Urgent,
		}
	}
}

/// One decoded network connection parameter word (16-bit form) or double
/// word (Large_Forward_Open form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkConnectionParameters {
	pub redundant_owner: bool,
	pub connection_type: ConnectionType,
	pub priority: Priority,
	pub variable_size: bool,
	pub size: u16,
}

impl NetworkConnectionParameters {
	pub fn from_word(word: u16) -> NetworkConnectionParameters {
		NetworkConnectionParameters {
			redundant_owner: word & 0x8000 != 0,
			connection_type: ConnectionType::from_bits((word as u32) >> 13),
			priority: Priority::from_bits((word as u32) >> 10),
			variable_size: word & 0x0200 != 0,
			size: word & 0x01FF,
		}
	}

	pub fn from_dword(dword: u32) -> NetworkConnectionParameters {
		NetworkConnectionParameters {
			redundant_owner: dword & 0x8000_0000 != 0,
			connection_type: ConnectionType::from_bits(dword >> 29),
			priority: Priority::from_bits(dword >> 26),
			variable_size: dword & 0x0200_0000 != 0,
			size: dword as u16,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionTrigger {
	Cyclic,
	ChangeOfState,
	ApplicationObject,
	Reserved,
}

/// The transport class/trigger byte of the Forward_Open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportTrigger(pub u8);

impl TransportTrigger {
	pub fn is_server(self) -> bool {
		self.0 & 0x80 != 0
	}

	pub fn transport_class(self) -> u8 {
		self.0 & 0x0F
	}

	pub fn production_trigger(self) -> ProductionTrigger {
		match (self.0 >> 4) & 0x07 {
			0 => ProductionTrigger::Cyclic,
			1 => ProductionTrigger::ChangeOfState,
			2 => ProductionTrigger::ApplicationObject,
			_ => ProductionTrigger::Reserved,
		}
	}

	pub fn is_cyclic(self) -> bool {
		self.production_trigger() == ProductionTrigger::Cyclic
	}
}

/// One connection slot. Slots live in a fixed arena; `NonExistent` marks a
/// slot as free for reallocation.
#[derive(Debug, Clone)]
pub struct Connection {
	pub state: ConnectionState,
	pub instance_type: InstanceType,

	pub connection_serial_number: u16,
	pub originator_vendor_id: u16,
	pub originator_serial_number: u32,

	/// O->T connection identifier.
	pub consumed_connection_id: u32,
	/// T->O connection identifier.
	pub produced_connection_id: u32,

	pub priority_timetick: u8,
	pub timeout_ticks: u8,
	pub timeout_multiplier: u8,
	pub transport_trigger: TransportTrigger,

	pub o_to_t_rpi_us: u32,
	pub t_to_o_rpi_us: u32,
	pub o_to_t_parameters: NetworkConnectionParameters,
	pub t_to_o_parameters: NetworkConnectionParameters,

	pub connection_path_class: u16,
	pub consuming_point: Option<u32>,
	pub producing_point: Option<u32>,
	pub config_point: Option<u32>,
	pub config_data: Option<Vec<u8>>,

	/// Back-references to the payload assemblies, by instance number.
	pub consuming_instance: u16,
	pub producing_instance: u16,

	/// `[consuming, producing]` socket handles from the platform driver.
	pub sockets: [Option<SocketHandle>; 2],
	pub originator_address: SocketAddrV4,
	pub remote_address: SocketAddrV4,

	pub eip_sequence_producing: u32,
	pub eip_sequence_consuming: u32,
	pub sequence_producing: u16,
	pub sequence_consuming: u16,

	pub expected_packet_rate_ms: i64,
	pub transmission_trigger_timer_ms: i64,
	pub production_inhibit_time_ms: Option<u16>,
	pub production_inhibit_timer_ms: i64,
	pub inactivity_watchdog_timer_ms: i64,
	pub watchdog_reload_ms: i64,

	/// Encapsulation session the Forward_Open arrived on.
	pub associated_session: u32,
}

impl Default for Connection {
	fn default() -> Self {
		Connection {
			state: ConnectionState::NonExistent,
			instance_type: InstanceType::Explicit,
			connection_serial_number: 0,
			originator_vendor_id: 0,
			originator_serial_number: 0,
			consumed_connection_id: 0,
			produced_connection_id: 0,
			priority_timetick: 0,
			timeout_ticks: 0,
			timeout_multiplier: 0,
			transport_trigger: TransportTrigger::default(),
			o_to_t_rpi_us: 0,
			t_to_o_rpi_us: 0,
			o_to_t_parameters: NetworkConnectionParameters::default(),
			t_to_o_parameters: NetworkConnectionParameters::default(),
			connection_path_class: 0,
			consuming_point: None,
			producing_point: None,
			config_point: None,
			config_data: None,
			consuming_instance: 0,
			producing_instance: 0,
			sockets: [None, None],
			originator_address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
			remote_address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
			eip_sequence_producing: 0,
			eip_sequence_consuming: 0,
			sequence_producing: 0,
			sequence_consuming: 0,
			expected_packet_rate_ms: 0,
			transmission_trigger_timer_ms: 0,
			production_inhibit_time_ms: None,
			production_inhibit_timer_ms: 0,
			inactivity_watchdog_timer_ms: 0,
			watchdog_reload_ms: 0,
			associated_session: 0,
		}
	}
}

impl Connection {
	pub fn matches_triple(&self, serial: u16, vendor: u16, originator_serial: u32) -> bool {
		self.connection_serial_number == serial
			&& self.originator_vendor_id == vendor
			&& self.originator_serial_number == originator_serial
	}

	pub fn is_io(&self) -> bool {
		!matches!(self.instance_type, InstanceType::Explicit)
	}

	/// The inactivity watchdog duration, floored at ten seconds.
	pub fn watchdog_duration_ms(&self) -> i64 {
		let base = (self.o_to_t_rpi_us as i64 / 1000) << (2 + self.timeout_multiplier as i64);
		base.max(10_000)
	}
}

/// One pre-wired application slot and the arena indices of the connections
/// it may host.
#[derive(Debug, Clone)]
pub struct AppSlot {
	pub output: u32,
	pub input: u32,
	pub config: u32,
	pub members: Vec<usize>,
}

/// The connection manager: the fixed connection arena, the active list in
/// insertion order, the application slot tables and the connection id
/// generator.
#[derive(Debug)]
pub struct ConnectionManager {
	/// Boot-unique seed occupying the upper half of every connection id.
	incarnation_id: u32,
	connection_counter: u16,
	pub pool: Vec<Connection>,
	pub active: Vec<usize>,
	pub exclusive_owner_slots: Vec<AppSlot>,
	pub input_only_slots: Vec<AppSlot>,
	pub listen_only_slots: Vec<AppSlot>,
	pub explicit_members: Vec<usize>,
}

impl ConnectionManager {
	pub fn new(config: &StackConfig, incarnation_seed: u16) -> ConnectionManager {
		let mut pool = Vec::new();
		let mut allocate = |count: usize| -> Vec<usize> {
			(0..count)
				.map(|_| {
					pool.push(Connection::default());
					pool.len() - 1
				})
				.collect()
		};

		let exclusive_owner_slots = config
			.exclusive_owner_slots
			.iter()
			.map(|triple| AppSlot {
				output: triple.output,
				input: triple.input,
				config: triple.config,
				members: allocate(1),
			})
			.collect();
		let input_only_slots = config
			.input_only_slots
			.iter()
			.map(|triple| AppSlot {
				output: triple.output,
				input: triple.input,
				config: triple.config,
				members: allocate(config.input_only_connections_per_path),
			})
			.collect();
		let listen_only_slots = config
			.listen_only_slots
			.iter()
			.map(|triple| AppSlot {
				output: triple.output,
				input: triple.input,
				config: triple.config,
				members: allocate(config.listen_only_connections_per_path),
			})
			.collect();
		let explicit_members = allocate(config.explicit_connections);

		ConnectionManager {
			incarnation_id: (incarnation_seed as u32) << 16,
			connection_counter: 0,
			pool,
			active: Vec::new(),
			exclusive_owner_slots,
			input_only_slots,
			listen_only_slots,
			explicit_members,
		}
	}

	/// A fresh connection id: the incarnation id in the upper 16 bits, a
	/// wrapping counter in the lower.
	pub fn next_connection_id(&mut self) -> u32 {
		self.connection_counter = self.connection_counter.wrapping_add(1);
		self.incarnation_id | self.connection_counter as u32
	}

	pub fn add_active(&mut self, index: usize) {
		self.pool[index].state = ConnectionState::Established;
		self.active.push(index);
	}

	pub fn remove_active(&mut self, index: usize) {
		self.active.retain(|&i| i != index);
		self.pool[index].state = ConnectionState::NonExistent;
	}

	pub fn active_count(&self) -> usize {
		self.active.len()
	}

	/// Established connection consuming on the given connection identifier.
	pub fn find_by_consumed_id(&self, connection_id: u32) -> Option<usize> {
		self.active.iter().copied().find(|&i| {
			self.pool[i].state == ConnectionState::Established
				&& self.pool[i].consumed_connection_id == connection_id
		})
	}

	/// Established connection matching the Forward_Open identity triple,
	/// per Vol. 1 3-5.5.2.
	pub fn find_established_by_triple(
		&self,
		serial: u16,
		vendor: u16,
		originator_serial: u32,
	) -> Option<usize> {
		self.active.iter().copied().find(|&i| {
			self.pool[i].state == ConnectionState::Established
				&& self.pool[i].matches_triple(serial, vendor, originator_serial)
		})
	}

	/// Forward_Close also reaches connections already timed out.
	pub fn find_closeable_by_triple(
		&self,
		serial: u16,
		vendor: u16,
		originator_serial: u32,
	) -> Option<usize> {
		self.active.iter().copied().find(|&i| {
			matches!(
				self.pool[i].state,
				ConnectionState::Established | ConnectionState::TimedOut
			) && self.pool[i].matches_triple(serial, vendor, originator_serial)
		})
	}

	/// Established connection already consuming from this output assembly.
	pub fn connected_output_assembly(&self, output_point: u32) -> Option<usize> {
		self.active.iter().copied().find(|&i| {
			self.pool[i].state == ConnectionState::Established
				&& self.pool[i].consuming_point == Some(output_point)
		})
	}

	pub fn is_connected_output_assembly(&self, output_point: u32) -> bool {
		self.active
			.iter()
			.any(|&i| self.pool[i].consuming_point == Some(output_point))
	}

	/// The connection currently holding the producing socket for a multicast
	/// input point.
	pub fn existing_producer_multicast(&self, input_point: u32) -> Option<usize> {
		self.active.iter().copied().find(|&i| {
			let connection = &self.pool[i];
			matches!(
				connection.instance_type,
				InstanceType::IoExclusiveOwner | InstanceType::IoInputOnly
			) && connection.producing_point == Some(input_point)
				&& connection.t_to_o_parameters.connection_type == ConnectionType::Multicast
				&& connection.sockets[DIRECTION_PRODUCING].is_some()
		})
	}

	/// The next multicast producer on this input point that does not own the
	/// socket, eligible to take it over.
	pub fn next_non_control_master(&self, input_point: u32) -> Option<usize> {
		self.active.iter().copied().find(|&i| {
			let connection = &self.pool[i];
			matches!(
				connection.instance_type,
				InstanceType::IoExclusiveOwner | InstanceType::IoInputOnly
			) && connection.producing_point == Some(input_point)
				&& connection.t_to_o_parameters.connection_type == ConnectionType::Multicast
				&& connection.sockets[DIRECTION_PRODUCING].is_none()
		})
	}

	fn free_explicit_member(&self) -> Option<usize> {
		self.explicit_members
			.iter()
			.copied()
			.find(|&i| self.pool[i].state == ConnectionState::NonExistent)
	}
}

/// Create the Connection Manager object and register its services.
pub fn init_connection_manager_object(registry: &mut Registry) {
	let mut class = CipClass::new(CONNECTION_MANAGER_CLASS, "connection manager", 1, 0, 7);
	class.add_instance(1);

	class.insert_service(services::FORWARD_OPEN, forward_open, "ForwardOpen");
	class.insert_service(
		services::LARGE_FORWARD_OPEN,
		large_forward_open,
		"LargeForwardOpen",
	);
	class.insert_service(services::FORWARD_CLOSE, forward_close, "ForwardClose");
	class.insert_class_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);

	registry.register(class);
}

fn forward_open(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	forward_open_inner(rt, request, response, false);
}

fn large_forward_open(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	forward_open_inner(rt, request, response, true);
}

fn forward_open_inner(
	rt: &mut CipRuntime,
	request: &mut Request<'_>,
	response: &mut Response,
	large: bool,
) {
	let mut staging = Connection::default();

	macro_rules! read_or_bail {
		($ty:ty) => {
			match <$ty>::read_from(&mut request.data) {
				Ok(value) => value,
				Err(_) => {
					assemble_forward_open_error(
						response,
						request.service,
						&staging,
						GeneralStatus::NotEnoughData,
						&[],
					);
					return;
				}
			}
		};
	}

	staging.priority_timetick = read_or_bail!(u8);
	staging.timeout_ticks = read_or_bail!(u8);
	staging.consumed_connection_id = read_or_bail!(u32);
	staging.produced_connection_id = read_or_bail!(u32);
	staging.connection_serial_number = read_or_bail!(u16);
	staging.originator_vendor_id = read_or_bail!(u16);
	staging.originator_serial_number = read_or_bail!(u32);

	if rt
		.connections
		.find_established_by_triple(
			staging.connection_serial_number,
			staging.originator_vendor_id,
			staging.originator_serial_number,
		)
		.is_some()
	{
		warn!(rt.logger, "duplicate forward open";
			"serial" => staging.connection_serial_number);
		assemble_forward_open_error(
			response,
			request.service,
			&staging,
			GeneralStatus::ConnectionFailure,
			&[extended_status::CONNECTION_IN_USE],
		);
		return;
	}

	staging.timeout_multiplier = read_or_bail!(u8);
	let _reserved = read_or_bail!([u8; 3]);

	staging.o_to_t_rpi_us = read_or_bail!(u32);
	staging.o_to_t_parameters = if large {
		NetworkConnectionParameters::from_dword(read_or_bail!(u32))
	} else {
		NetworkConnectionParameters::from_word(read_or_bail!(u16))
	};
	staging.t_to_o_rpi_us = read_or_bail!(u32);
	staging.t_to_o_parameters = if large {
		NetworkConnectionParameters::from_dword(read_or_bail!(u32))
	} else {
		NetworkConnectionParameters::from_word(read_or_bail!(u16))
	};

	/* align the T->O interval up to a full timer tick */
	let tick_us = (rt.config.timer_tick_ms * 1000) as u32;
	if tick_us > 0 && staging.t_to_o_rpi_us % tick_us > 0 {
		staging.t_to_o_rpi_us = (staging.t_to_o_rpi_us / tick_us) * tick_us + tick_us;
	}

	if staging.o_to_t_parameters.connection_type == ConnectionType::Reserved {
		assemble_forward_open_error(
			response,
			request.service,
			&staging,
			GeneralStatus::ConnectionFailure,
			&[extended_status::INVALID_O_TO_T_CONNECTION_TYPE],
		);
		return;
	}
	if staging.t_to_o_parameters.connection_type == ConnectionType::Reserved {
		assemble_forward_open_error(
			response,
			request.service,
			&staging,
			GeneralStatus::ConnectionFailure,
			&[extended_status::INVALID_T_TO_O_CONNECTION_TYPE],
		);
		return;
	}

	staging.transport_trigger = TransportTrigger(read_or_bail!(u8));
	if staging.transport_trigger.0 & 0x40 != 0 {
		assemble_forward_open_error(
			response,
			request.service,
			&staging,
			GeneralStatus::ConnectionFailure,
			&[extended_status::TRANSPORT_TRIGGER_NOT_SUPPORTED],
		);
		return;
	}

	staging.state = ConnectionState::Configuring;
	if let Err((status, extended)) =
		path::parse_connection_path(&mut staging, request, &rt.registry, &rt.device)
	{
		assemble_forward_open_error(response, request.service, &staging, status, &extended);
		return;
	}

	staging.originator_address = request.originator;
	staging.associated_session = request.session;

	let result = match staging.connection_path_class {
		MESSAGE_ROUTER_CLASS => class3::establish(rt, &staging),
		ASSEMBLY_CLASS => io::establish(rt, &mut staging, request, response),
		_ => Err((
			GeneralStatus::ConnectionFailure,
			vec![extended_status::INCONSISTENT_APPLICATION_PATH_COMBO],
		)),
	};

	match result {
		Ok(index) => {
			info!(rt.logger, "connection established";
				"serial" => staging.connection_serial_number,
				"type" => ?rt.connections.pool[index].instance_type);
			assemble_forward_open_success(rt, response, request.service, index);
		}
		Err((status, extended)) => {
			info!(rt.logger, "forward open rejected";
				"status" => ?status, "extended" => ?extended);
			assemble_forward_open_error(response, request.service, &staging, status, &extended);
		}
	}
}

fn assemble_forward_open_success(
	rt: &CipRuntime,
	response: &mut Response,
	service: u8,
	index: usize,
) {
	let connection = &rt.connections.pool[index];
	response.start(service, GeneralStatus::Success);
	let _ = response.message.push_u32_le(connection.consumed_connection_id);
	let _ = response.message.push_u32_le(connection.produced_connection_id);
	let _ = response
		.message
		.push_u16_le(connection.connection_serial_number);
	let _ = response.message.push_u16_le(connection.originator_vendor_id);
	let _ = response
		.message
		.push_u32_le(connection.originator_serial_number);
	/* the applied packet intervals equal the requested ones */
	let _ = response.message.push_u32_le(connection.o_to_t_rpi_us);
	let _ = response.message.push_u32_le(connection.t_to_o_rpi_us);
	let _ = response.message.push_u8(0); /* application reply size */
	let _ = response.message.push_u8(0); /* reserved */
}

fn assemble_forward_open_error(
	response: &mut Response,
	service: u8,
	staging: &Connection,
	status: GeneralStatus,
	extended: &[u16],
) {
	response.start(service, status);
	match status {
		GeneralStatus::NotEnoughData | GeneralStatus::TooMuchData => {}
		_ => {
			if !extended.is_empty() {
				response.set_extended_status(status, extended);
			}
		}
	}
	let _ = response
		.message
		.push_u16_le(staging.connection_serial_number);
	let _ = response.message.push_u16_le(staging.originator_vendor_id);
	let _ = response
		.message
		.push_u32_le(staging.originator_serial_number);
	let _ = response.message.push_u8(0); /* remaining path size */
	let _ = response.message.push_u8(0); /* reserved */
}

/// Forward_Close. Matching uses only the serial/vendor/originator-serial
/// triple; the connection id pair is ignored.
fn forward_close(
	rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	macro_rules! read_or_bail {
		($ty:ty) => {
			match <$ty>::read_from(&mut request.data) {
				Ok(value) => value,
				Err(_) => {
					response.set_status(GeneralStatus::NotEnoughData);
					return;
				}
			}
		};
	}

	let _priority_timetick = read_or_bail!(u8);
	let _timeout_ticks = read_or_bail!(u8);
	let serial = read_or_bail!(u16);
	let vendor = read_or_bail!(u16);
	let originator_serial = read_or_bail!(u32);
	let connection_path_size = u8::read_from(&mut request.data).unwrap_or(0);

	let found = rt
		.connections
		.find_closeable_by_triple(serial, vendor, originator_serial);

	let application_reply_size = match found {
		Some(index) => {
			info!(rt.logger, "forward close"; "serial" => serial);
			close_connection(rt, index);
			0u8
		}
		None => {
			warn!(rt.logger, "forward close for unknown connection"; "serial" => serial);
			response.set_extended_status(
				GeneralStatus::ConnectionFailure,
				&[extended_status::TARGET_CONNECTION_NOT_FOUND],
			);
			connection_path_size
		}
	};

	let _ = response.message.push_u16_le(serial);
	let _ = response.message.push_u16_le(vendor);
	let _ = response.message.push_u32_le(originator_serial);
	let _ = response.message.push_u8(application_reply_size);
	let _ = response.message.push_u8(0); /* reserved */
}

/// Close one connection through its type-specific close path. Each path runs
/// at most once; the state transition to `NonExistent` guards double close.
pub fn close_connection(rt: &mut CipRuntime, index: usize) {
	if rt.connections.pool[index].state == ConnectionState::NonExistent {
		return;
	}
	let instance_type = rt.connections.pool[index].instance_type;
	match instance_type {
		InstanceType::Explicit => {
			rt.connections.remove_active(index);
			rt.connections.pool[index] = Connection::default();
		}
		_ => io::close_io_connection(rt, index),
	}
}

/// Close everything, as on stack shutdown.
pub fn close_all_connections(rt: &mut CipRuntime) {
	while let Some(&index) = rt.connections.active.first() {
		close_connection(rt, index);
	}
}

/// Close the Class 3 connections bound to an encapsulation session that went
/// away.
pub fn close_connections_for_session(rt: &mut CipRuntime, session: u32) {
	let indices: Vec<usize> = rt
		.connections
		.active
		.iter()
		.copied()
		.filter(|&i| {
			rt.connections.pool[i].instance_type == InstanceType::Explicit
				&& rt.connections.pool[i].associated_session == session
		})
		.collect();
	for index in indices {
		close_connection(rt, index);
	}
}

/// General configuration shared by all connection types: target-chosen
/// connection ids, sequence counts, the expected packet rate and the
/// inactivity watchdog.
pub fn general_connection_configuration(rt: &mut CipRuntime, connection: &mut Connection) {
	if connection.o_to_t_parameters.connection_type == ConnectionType::PointToPoint {
		connection.consumed_connection_id = rt.connections.next_connection_id();
	}
	if connection.t_to_o_parameters.connection_type == ConnectionType::Multicast {
		connection.produced_connection_id = rt.connections.next_connection_id();
	}

	connection.eip_sequence_producing = 0;
	connection.eip_sequence_consuming = 0;
	connection.sequence_producing = 0;
	connection.sequence_consuming = 0;

	if connection.transport_trigger.is_server() {
		connection.expected_packet_rate_ms = (connection.o_to_t_rpi_us / 1000) as i64;
	} else {
		connection.expected_packet_rate_ms = (connection.t_to_o_rpi_us / 1000) as i64;
		/* produce on the next timer tick */
		connection.transmission_trigger_timer_ms = 0;
	}

	connection.production_inhibit_timer_ms = 0;
	connection.watchdog_reload_ms = connection.watchdog_duration_ms();
	connection.inactivity_watchdog_timer_ms = connection.watchdog_reload_ms;
}

/// One managed tick over the active list. Watchdogs always run; production
/// runs for established connections holding the producing socket, gated by
/// the production inhibit for non-cyclic triggers.
pub fn manage_connections(rt: &mut CipRuntime, elapsed_ms: u64) {
	let elapsed = elapsed_ms as i64;
	let indices = rt.connections.active.clone();

	for index in indices {
		if rt.connections.pool[index].state != ConnectionState::Established {
			continue;
		}

		let maintains_watchdog = {
			let connection = &rt.connections.pool[index];
			connection.consuming_instance != 0 || connection.transport_trigger.is_server()
		};

		if maintains_watchdog {
			let connection = &mut rt.connections.pool[index];
			connection.inactivity_watchdog_timer_ms -= elapsed;
			if connection.inactivity_watchdog_timer_ms <= 0 {
				warn!(rt.logger, "connection timed out";
					"serial" => rt.connections.pool[index].connection_serial_number);
				let instance_type = rt.connections.pool[index].instance_type;
				match instance_type {
					InstanceType::Explicit => {
						rt.connections.remove_active(index);
						rt.connections.pool[index] = Connection::default();
					}
					_ => io::handle_io_timeout(rt, index),
				}
			}
		}

		if rt.connections.pool[index].state != ConnectionState::Established {
			continue;
		}

		let due = {
			let connection = &mut rt.connections.pool[index];
			if connection.expected_packet_rate_ms == 0
				|| connection.sockets[DIRECTION_PRODUCING].is_none()
			{
				false
			} else {
				if !connection.transport_trigger.is_cyclic()
					&& connection.production_inhibit_timer_ms >= 0
				{
					connection.production_inhibit_timer_ms -= elapsed;
				}
				connection.transmission_trigger_timer_ms -= elapsed;
				connection.transmission_trigger_timer_ms <= 0
					&& (connection.transport_trigger.is_cyclic()
						|| connection.production_inhibit_timer_ms <= 0)
			}
		};

		if due {
			if let Err(error) = io::send_connected_data(rt, index) {
				warn!(rt.logger, "sending connected data failed"; "error" => %error);
			}
			let connection = &mut rt.connections.pool[index];
			connection.transmission_trigger_timer_ms = connection.expected_packet_rate_ms;
			if !connection.transport_trigger.is_cyclic() {
				connection.production_inhibit_timer_ms =
					connection.production_inhibit_time_ms.unwrap_or(0) as i64;
			}
		}
	}
}

/// Dispatch one connected datagram from the socket layer. Datagrams from a
/// source other than the captured originator are dropped with a warning, as
/// are replays and reordered frames.
pub fn handle_received_connected_data(
	rt: &mut CipRuntime,
	packet: &ConnectedPacket,
	from: SocketAddrV4,
) {
	let Some(index) = rt.connections.find_by_consumed_id(packet.connection_id) else {
		return;
	};

	{
		let connection = &rt.connections.pool[index];
		if connection.originator_address.ip() != from.ip() {
			warn!(rt.logger, "connected data with wrong address information";
				"connection" => packet.connection_id, "from" => %from);
			return;
		}
	}

	if let Some(sequence) = packet.encapsulation_sequence {
		let connection = &mut rt.connections.pool[index];
		if !seq_gt32(sequence, connection.eip_sequence_consuming) {
			return;
		}
		connection.eip_sequence_consuming = sequence;
	}

	{
		let connection = &mut rt.connections.pool[index];
		connection.inactivity_watchdog_timer_ms = connection.watchdog_reload_ms;
	}

	if rt.connections.pool[index].is_io() {
		io::receive_io_data(rt, index, &packet.data);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::cpf;
	use crate::objects::assembly;
	use crate::runtime::test_support::{
		forward_close_from, forward_open_from, test_runtime_with_io, ForwardOpenOptions,
		HEARTBEAT_INPUT_ONLY, INPUT_ASSEMBLY,
	};
	use crate::runtime::IoConnectionEvent;

	const OWNER: &str = "192.168.1.20:44818";
	const SECOND: &str = "192.168.1.21:44818";
	const THIRD: &str = "192.168.1.22:44818";

	fn input_only_options(serial: u16, originator_serial: u32) -> ForwardOpenOptions {
		ForwardOpenOptions {
			serial,
			originator_serial,
			output: Some(HEARTBEAT_INPUT_ONLY),
			/* heartbeat consuming: sequence count only */
			o_to_t_size: 2,
			..ForwardOpenOptions::default()
		}
	}

	fn listen_only_options(serial: u16, originator_serial: u32) -> ForwardOpenOptions {
		ForwardOpenOptions {
			serial,
			originator_serial,
			o_to_t_type: 0, /* null */
			output: None,
			config: Some(151),
			..ForwardOpenOptions::default()
		}
	}

	#[test]
	fn test_exclusive_owner_forward_open_success() {
		let (mut rt, net, _app) = test_runtime_with_io();

		let options = ForwardOpenOptions::default();
		let response = forward_open_from(&mut rt, &options, OWNER);
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(rt.connections.active_count(), 1);

		/* both directions got target-chosen connection ids */
		let body = response.message.as_slice();
		let consumed_id = u32::from_le_bytes(body[0..4].try_into().unwrap());
		let produced_id = u32::from_le_bytes(body[4..8].try_into().unwrap());
		assert_ne!(consumed_id, 0x0001_0001); /* O->T point-to-point reallocates */
		assert_ne!(produced_id, 0x0002_0002); /* T->O multicast reallocates */
		assert_eq!(&body[8..10], &options.serial.to_le_bytes());

		/* the reply advertises the target-chosen multicast group */
		let t_to_o = response
			.sockaddr_items
			.iter()
			.find(|item| item.direction == cpf::SockaddrDirection::TargetToOriginator)
			.expect("T->O sockaddr item missing");
		assert_eq!(*t_to_o.address.ip(), std::net::Ipv4Addr::new(239, 192, 1, 32));
		assert_eq!(t_to_o.address.port(), 0x08AE);

		/* two sockets were opened: consuming and producing */
		assert_eq!(net.borrow().opened.len(), 2);
	}

	#[test]
	fn test_second_owner_is_rejected_with_ownership_conflict() {
		let (mut rt, _net, _app) = test_runtime_with_io();

		let first = ForwardOpenOptions::default();
		assert_eq!(
			forward_open_from(&mut rt, &first, OWNER).general_status,
			GeneralStatus::Success
		);

		let second = ForwardOpenOptions {
			serial: 0x0002,
			originator_serial: 0xCAFE_0002,
			..ForwardOpenOptions::default()
		};
		let response = forward_open_from(&mut rt, &second, SECOND);
		assert_eq!(response.general_status, GeneralStatus::ConnectionFailure);
		assert_eq!(response.additional_status, vec![extended_status::OWNERSHIP_CONFLICT]);
		assert_eq!(rt.connections.active_count(), 1);
	}

	#[test]
	fn test_duplicate_forward_open_is_connection_in_use() {
		let (mut rt, _net, _app) = test_runtime_with_io();

		let options = ForwardOpenOptions::default();
		assert_eq!(
			forward_open_from(&mut rt, &options, OWNER).general_status,
			GeneralStatus::Success
		);
		let response = forward_open_from(&mut rt, &options, OWNER);
		assert_eq!(response.general_status, GeneralStatus::ConnectionFailure);
		assert_eq!(response.additional_status, vec![extended_status::CONNECTION_IN_USE]);
	}

	#[test]
	fn test_wrong_connection_size_reports_correct_size() {
		let (mut rt, _net, _app) = test_runtime_with_io();

		let options = ForwardOpenOptions {
			o_to_t_size: 10,
			..ForwardOpenOptions::default()
		};
		let response = forward_open_from(&mut rt, &options, OWNER);
		assert_eq!(response.general_status, GeneralStatus::ConnectionFailure);
		/* the second status word echoes the acceptable size */
		assert_eq!(
			response.additional_status,
			vec![extended_status::INVALID_O_TO_T_CONNECTION_SIZE, 38]
		);
	}

	#[test]
	fn test_forward_open_then_close_roundtrip() {
		let (mut rt, net, _app) = test_runtime_with_io();

		let options = ForwardOpenOptions::default();
		assert_eq!(
			forward_open_from(&mut rt, &options, OWNER).general_status,
			GeneralStatus::Success
		);
		assert_eq!(rt.connections.active_count(), 1);

		let response = forward_close_from(&mut rt, &options, OWNER);
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(rt.connections.active_count(), 0);
		/* both UDP sockets are gone */
		assert_eq!(net.borrow().closed.len(), 2);
	}

	#[test]
	fn test_forward_close_unknown_triple() {
		let (mut rt, _net, _app) = test_runtime_with_io();
		let options = ForwardOpenOptions::default();
		let response = forward_close_from(&mut rt, &options, OWNER);
		assert_eq!(response.general_status, GeneralStatus::ConnectionFailure);
		assert_eq!(
			response.additional_status,
			vec![extended_status::TARGET_CONNECTION_NOT_FOUND]
		);
	}

	#[test]
	fn test_listen_only_requires_existing_producer() {
		let (mut rt, _net, _app) = test_runtime_with_io();

		let response =
			forward_open_from(&mut rt, &listen_only_options(0x0010, 0xCAFE_0010), THIRD);
		assert_eq!(response.general_status, GeneralStatus::ConnectionFailure);
		assert_eq!(
			response.additional_status,
			vec![extended_status::NON_LISTEN_ONLY_CONNECTION_NOT_OPENED]
		);
	}

	#[test]
	fn test_listen_only_joins_producer_and_inherits_id() {
		let (mut rt, _net, _app) = test_runtime_with_io();

		let owner = ForwardOpenOptions::default();
		let owner_response = forward_open_from(&mut rt, &owner, OWNER);
		assert_eq!(owner_response.general_status, GeneralStatus::Success);
		let owner_produced_id = u32::from_le_bytes(
			owner_response.message.as_slice()[4..8].try_into().unwrap(),
		);

		let listener = listen_only_options(0x0010, 0xCAFE_0010);
		let response = forward_open_from(&mut rt, &listener, THIRD);
		assert_eq!(response.general_status, GeneralStatus::Success);
		let listener_produced_id =
			u32::from_le_bytes(response.message.as_slice()[4..8].try_into().unwrap());
		/* same multicast stream, same produced connection id */
		assert_eq!(listener_produced_id, owner_produced_id);

		/* the listener does not own the producing socket */
		let listener_index = rt.connections.active[1];
		assert_eq!(
			rt.connections.pool[listener_index].sockets[DIRECTION_PRODUCING],
			None
		);
	}

	#[test]
	fn test_owner_close_hands_socket_to_input_only() {
		let (mut rt, _net, _app) = test_runtime_with_io();

		let owner = ForwardOpenOptions::default();
		assert_eq!(
			forward_open_from(&mut rt, &owner, OWNER).general_status,
			GeneralStatus::Success
		);

		let input_only = input_only_options(0x0020, 0xCAFE_0020);
		assert_eq!(
			forward_open_from(&mut rt, &input_only, SECOND).general_status,
			GeneralStatus::Success
		);

		let listener = listen_only_options(0x0030, 0xCAFE_0030);
		assert_eq!(
			forward_open_from(&mut rt, &listener, THIRD).general_status,
			GeneralStatus::Success
		);
		assert_eq!(rt.connections.active_count(), 3);

		/* the owner closes; the input only connection adopts the socket */
		assert_eq!(
			forward_close_from(&mut rt, &owner, OWNER).general_status,
			GeneralStatus::Success
		);
		assert_eq!(rt.connections.active_count(), 2);
		let adopted = rt
			.connections
			.existing_producer_multicast(INPUT_ASSEMBLY as u32)
			.expect("no producer after handover");
		assert_eq!(
			rt.connections.pool[adopted].instance_type,
			InstanceType::IoInputOnly
		);
	}

	#[test]
	fn test_owner_close_without_successor_closes_listeners() {
		let (mut rt, _net, _app) = test_runtime_with_io();

		let owner = ForwardOpenOptions::default();
		assert_eq!(
			forward_open_from(&mut rt, &owner, OWNER).general_status,
			GeneralStatus::Success
		);
		let listener = listen_only_options(0x0030, 0xCAFE_0030);
		assert_eq!(
			forward_open_from(&mut rt, &listener, THIRD).general_status,
			GeneralStatus::Success
		);

		assert_eq!(
			forward_close_from(&mut rt, &owner, OWNER).general_status,
			GeneralStatus::Success
		);
		/* no producer left, so the listen only connection went too */
		assert_eq!(rt.connections.active_count(), 0);
	}

	#[test]
	fn test_cyclic_production_and_sequence_counters() {
		let (mut rt, net, app) = test_runtime_with_io();

		let options = ForwardOpenOptions::default();
		assert_eq!(
			forward_open_from(&mut rt, &options, OWNER).general_status,
			GeneralStatus::Success
		);

		/* five 10 ms cycles; the application reports changed data on the
		   first three only */
		app.borrow_mut().data_changed = true;
		for tick in 0..50u32 {
			if tick == 30 {
				app.borrow_mut().data_changed = false;
			}
			rt.manage(1);
		}

		let sent = &net.borrow().sent;
		assert_eq!(sent.len(), 5);

		let last = sent.last().unwrap();
		/* item count, then the sequenced address item: type, length, the
		   connection id and the 32-bit sequence */
		let eip_sequence = u32::from_le_bytes(last.data[10..14].try_into().unwrap());
		assert_eq!(eip_sequence, 5);
		/* connected data item header, then the 16-bit application sequence */
		let application_sequence = u16::from_le_bytes(last.data[18..20].try_into().unwrap());
		assert_eq!(application_sequence, 3);
	}

	#[test]
	fn test_watchdog_holds_for_silent_originator_within_floor() {
		let (mut rt, _net, app) = test_runtime_with_io();

		let options = ForwardOpenOptions::default();
		assert_eq!(
			forward_open_from(&mut rt, &options, OWNER).general_status,
			GeneralStatus::Success
		);

		/* watchdog = max(10ms << 4, 10s) = 10s; 80 ms of silence is fine */
		rt.manage(80);
		let index = rt.connections.active[0];
		assert_eq!(rt.connections.pool[index].state, ConnectionState::Established);

		/* but a full ten seconds is not */
		rt.manage(10_000);
		assert_eq!(rt.connections.pool[index].state, ConnectionState::TimedOut);
		assert!(app
			.borrow()
			.events
			.iter()
			.any(|(_, _, event)| *event == IoConnectionEvent::TimedOut));
	}

	#[test]
	fn test_receive_filters_source_and_sequence() {
		let (mut rt, _net, app) = test_runtime_with_io();

		let options = ForwardOpenOptions::default();
		let response = forward_open_from(&mut rt, &options, OWNER);
		let consumed_id =
			u32::from_le_bytes(response.message.as_slice()[0..4].try_into().unwrap());

		let make_packet = |eip_seq: u32, app_seq: u16, run_idle: u32| cpf::ConnectedPacket {
			connection_id: consumed_id,
			encapsulation_sequence: Some(eip_seq),
			data: {
				let mut data = app_seq.to_le_bytes().to_vec();
				data.extend_from_slice(&run_idle.to_le_bytes());
				data.extend_from_slice(&[0x11; 32]);
				data
			},
			sockaddr_items: Vec::new(),
		};

		/* wrong source ip: dropped, nothing reaches the assembly */
		handle_received_connected_data(
			&mut rt,
			&make_packet(1, 1, 1),
			"192.168.1.99:2222".parse().unwrap(),
		);
		assert!(app.borrow().received.is_empty());

		/* right source: accepted, run/idle transition signalled */
		handle_received_connected_data(
			&mut rt,
			&make_packet(1, 1, 1),
			"192.168.1.20:2222".parse().unwrap(),
		);
		assert_eq!(app.borrow().received, vec![INPUT_ASSEMBLY]);
		assert_eq!(app.borrow().run_idle, vec![1]);

		/* replayed encapsulation sequence: dropped */
		handle_received_connected_data(
			&mut rt,
			&make_packet(1, 2, 1),
			"192.168.1.20:2222".parse().unwrap(),
		);
		assert_eq!(app.borrow().received.len(), 1);

		/* stale application sequence: accepted at EIP level, no new data */
		handle_received_connected_data(
			&mut rt,
			&make_packet(2, 1, 1),
			"192.168.1.20:2222".parse().unwrap(),
		);
		assert_eq!(app.borrow().received.len(), 1);

		/* fresh both ways, steady run/idle: data lands, no extra signal */
		handle_received_connected_data(
			&mut rt,
			&make_packet(3, 2, 1),
			"192.168.1.20:2222".parse().unwrap(),
		);
		assert_eq!(app.borrow().received.len(), 2);
		assert_eq!(app.borrow().run_idle.len(), 1);
		assert_eq!(
			assembly::data(&rt.registry, INPUT_ASSEMBLY).unwrap(),
			&[0x11; 32]
		);
	}

	#[test]
	fn test_connection_id_carries_incarnation() {
		let (mut rt, _net, _app) = test_runtime_with_io();
		let incarnation = rt.connections.incarnation_id;
		let id = rt.connections.next_connection_id();
		assert_eq!(id & 0xFFFF_0000, incarnation);
		assert_eq!(id & 0xFFFF, 1);
	}

	#[test]
	fn test_sequence_comparison_wraps() {
		assert!(seq_gt32(1, 0xFFFF_FFFF));
		assert!(!seq_gt32(0xFFFF_FFFF, 1));
		assert!(seq_leq16(0xFFFF, 1));
		assert!(!seq_leq16(2, 1));
	}

	#[test]
	fn test_network_parameter_decoding() {
		let word = NetworkConnectionParameters::from_word(0x4000 | 0x0200 | 38);
		assert_eq!(word.connection_type, ConnectionType::PointToPoint);
		assert!(word.variable_size);
		assert_eq!(word.size, 38);

		let dword = NetworkConnectionParameters::from_dword((1 << 29) | 1400);
		assert_eq!(dword.connection_type, ConnectionType::Multicast);
		assert_eq!(dword.size, 1400);
	}
}
