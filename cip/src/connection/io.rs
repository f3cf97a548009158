use std::io;
use std::net::SocketAddrV4;

use slog::{debug, info, warn};

use crate::connection::{
	general_connection_configuration, seq_leq16, Connection, ConnectionState, ConnectionType,
	InstanceType, DIRECTION_CONSUMING, DIRECTION_PRODUCING,
};
use crate::cpf::{
	SockaddrDirection, SockaddrInfo, ITEM_CONNECTED_ADDRESS, ITEM_CONNECTED_DATA,
	ITEM_SEQUENCED_ADDRESS,
};
use crate::message::{Request, Response};
use crate::objects::{assembly, qos, tcpip};
use crate::runtime::{CipRuntime, IoConnectionEvent, UdpDirection, IO_UDP_PORT};
use crate::status::{extended_status, GeneralStatus};

const NULL_FORWARD_OPEN_NOT_SUPPORTED: u16 = 0x0132;

type EstablishError = (GeneralStatus, Vec<u16>);

fn failure(extended: u16) -> EstablishError {
	(GeneralStatus::ConnectionFailure, vec![extended])
}

/// Establish a Class 0/1 I/O connection from the parsed Forward_Open data:
/// reserve an application slot, resolve the production inhibit time, check
/// sizes and multicast consistency, apply configuration data, open the UDP
/// channels and activate the connection.
pub fn establish(
	rt: &mut CipRuntime,
	staging: &mut Connection,
	request: &Request<'_>,
	response: &mut Response,
) -> Result<usize, EstablishError> {
	if staging.o_to_t_parameters.connection_type == ConnectionType::Null
		&& staging.t_to_o_parameters.connection_type == ConnectionType::Null
	{
		return Err(failure(NULL_FORWARD_OPEN_NOT_SUPPORTED));
	}

	let index = rt.connections.find_io_slot(staging).map_err(failure)?;

	process_production_inhibit_time(staging)?;
	general_connection_configuration(rt, staging);

	if staging.o_to_t_parameters.connection_type != ConnectionType::Null {
		setup_consuming_side(rt, staging)?;
	}
	if staging.t_to_o_parameters.connection_type != ConnectionType::Null {
		check_multicast_producer_consistency(rt, staging)?;
		setup_producing_side(rt, staging)?;
	}

	if staging.config_data.is_some() {
		apply_configuration_data(rt, staging)?;
	}

	rt.connections.pool[index] = staging.clone();
	if let Err((status, extended)) = open_communication_channels(rt, index, request, response) {
		rt.connections.pool[index] = Connection::default();
		return Err((status, extended));
	}

	rt.connections.add_active(index);
	let (output, input) = (
		staging.consuming_point.unwrap_or(0),
		staging.producing_point.unwrap_or(0),
	);
	rt.app
		.io_connection_event(output, input, IoConnectionEvent::Opened);
	Ok(index)
}

/// Resolve the production inhibit time: absent defaults to a quarter of the
/// T->O interval, present must not exceed it.
fn process_production_inhibit_time(staging: &mut Connection) -> Result<(), EstablishError> {
	match staging.production_inhibit_time_ms {
		None => {
			staging.production_inhibit_time_ms = Some((staging.t_to_o_rpi_us / 4000) as u16);
			Ok(())
		}
		Some(inhibit_ms) => {
			if inhibit_ms as u32 > staging.t_to_o_rpi_us / 1000 {
				Err(failure(extended_status::RPI_NOT_SUPPORTED))
			} else {
				Ok(())
			}
		}
	}
}

/// Wire the consuming side to its assembly and validate the declared O->T
/// size against the buffer, accounting for the sequence count of Class 1
/// transports and an optional run/idle header.
fn setup_consuming_side(
	rt: &mut CipRuntime,
	staging: &mut Connection,
) -> Result<(), EstablishError> {
	let point = staging
		.consuming_point
		.ok_or_else(|| failure(extended_status::INVALID_CONSUMING_APPLICATION_PATH))?;
	let buffer_length = assembly::data_length(&rt.registry, point as u16)
		.ok_or_else(|| failure(extended_status::INVALID_CONSUMING_APPLICATION_PATH))?;

	let is_heartbeat = buffer_length == 0;
	let mut data_size = staging.o_to_t_parameters.size as i64;
	let mut diff_size = 0i64;
	if staging.transport_trigger.transport_class() == 1 {
		data_size -= 2;
		diff_size += 2;
	}
	if rt.config.consumed_data_has_run_idle_header && data_size > 0 && !is_heartbeat {
		data_size -= 4;
		diff_size += 4;
	}
	if buffer_length as i64 != data_size {
		let correct = (buffer_length as i64 + diff_size) as u16;
		return Err((
			GeneralStatus::ConnectionFailure,
			vec![extended_status::INVALID_O_TO_T_CONNECTION_SIZE, correct],
		));
	}

	staging.consuming_instance = point as u16;
	Ok(())
}

/// A second multicast producer on an input point must agree with the
/// established one on interval, size type, priority, transport class,
/// trigger and production inhibit time.
fn check_multicast_producer_consistency(
	rt: &CipRuntime,
	staging: &Connection,
) -> Result<(), EstablishError> {
	if staging.t_to_o_parameters.connection_type != ConnectionType::Multicast {
		return Ok(());
	}

	for &index in rt.connections.active.iter() {
		let other = &rt.connections.pool[index];
		if other.producing_point.is_none() || other.producing_point != staging.producing_point {
			continue;
		}

		if other.t_to_o_rpi_us != staging.t_to_o_rpi_us {
			return Err(failure(extended_status::RPI_VALUES_NOT_ACCEPTABLE));
		}
		if other.t_to_o_parameters.variable_size != staging.t_to_o_parameters.variable_size {
			return Err(failure(extended_status::MISMATCHED_T_TO_O_FIX_VAR));
		}
		if other.t_to_o_parameters.priority != staging.t_to_o_parameters.priority {
			return Err(failure(extended_status::MISMATCHED_T_TO_O_PRIORITY));
		}
		if other.transport_trigger.transport_class()
			!= staging.transport_trigger.transport_class()
		{
			return Err(failure(extended_status::MISMATCHED_TRANSPORT_CLASS));
		}
		if other.transport_trigger.production_trigger()
			!= staging.transport_trigger.production_trigger()
		{
			return Err(failure(extended_status::MISMATCHED_T_TO_O_PRODUCTION_TRIGGER));
		}
		if other.production_inhibit_time_ms != staging.production_inhibit_time_ms {
			return Err(failure(
				extended_status::MISMATCHED_T_TO_O_PRODUCTION_INHIBIT_TIME,
			));
		}
	}
	Ok(())
}

fn setup_producing_side(
	rt: &mut CipRuntime,
	staging: &mut Connection,
) -> Result<(), EstablishError> {
	let point = staging
		.producing_point
		.ok_or_else(|| failure(extended_status::INVALID_PRODUCING_APPLICATION_PATH))?;
	let buffer_length = assembly::data_length(&rt.registry, point as u16)
		.ok_or_else(|| failure(extended_status::INVALID_PRODUCING_APPLICATION_PATH))?;

	let is_heartbeat = buffer_length == 0;
	let mut data_size = staging.t_to_o_parameters.size as i64;
	let mut diff_size = 0i64;
	if staging.transport_trigger.transport_class() == 1 {
		data_size -= 2;
		diff_size += 2;
	}
	if rt.config.produced_data_has_run_idle_header && data_size > 0 && !is_heartbeat {
		data_size -= 4;
		diff_size += 4;
	}
	if buffer_length as i64 != data_size {
		let correct = (buffer_length as i64 + diff_size) as u16;
		return Err((
			GeneralStatus::ConnectionFailure,
			vec![extended_status::INVALID_T_TO_O_CONNECTION_SIZE, correct],
		));
	}

	staging.producing_instance = point as u16;
	Ok(())
}

/// Inline configuration data from the connection path. When another live
/// connection shares the configuration point the data must be identical;
/// otherwise it is delivered to the configuration assembly.
fn apply_configuration_data(
	rt: &mut CipRuntime,
	staging: &mut Connection,
) -> Result<(), EstablishError> {
	let Some(config_point) = staging.config_point else {
		return Ok(());
	};
	let data = staging.config_data.clone().unwrap_or_default();
	if data.is_empty() {
		return Ok(());
	}

	let shared = rt
		.connections
		.active
		.iter()
		.any(|&i| rt.connections.pool[i].config_point == Some(config_point));

	if shared {
		let existing = assembly::data(&rt.registry, config_point as u16).unwrap_or(&[]);
		if existing != data.as_slice() {
			warn!(rt.logger, "configuration data conflicts with live connection";
				"config_point" => config_point);
			return Err(failure(extended_status::OWNERSHIP_CONFLICT));
		}
	} else if assembly::connected_data_received(rt, config_point as u16, &data).is_err() {
		warn!(rt.logger, "configuration data was invalid"; "config_point" => config_point);
		return Err(failure(
			extended_status::INVALID_CONFIGURATION_APPLICATION_PATH,
		));
	}

	Ok(())
}

fn open_communication_channels(
	rt: &mut CipRuntime,
	index: usize,
	request: &Request<'_>,
	response: &mut Response,
) -> Result<(), EstablishError> {
	let socket_failure = || (GeneralStatus::ConnectionFailure, Vec::new());

	let (consuming_type, producing_type, priority) = {
		let connection = &rt.connections.pool[index];
		(
			connection.o_to_t_parameters.connection_type,
			connection.t_to_o_parameters.connection_type,
			connection.t_to_o_parameters.priority,
		)
	};
	let dscp = qos::dscp_for_priority(&rt.registry, priority);
	let multicast_group =
		SocketAddrV4::new(tcpip::multicast_address(&rt.registry), IO_UDP_PORT);

	match consuming_type {
		ConnectionType::PointToPoint => {
			let bind = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, IO_UDP_PORT);
			let handle = rt
				.sockets
				.create_udp_socket(UdpDirection::Consuming, bind, dscp)
				.ok_or_else(socket_failure)?;
			rt.connections.pool[index].sockets[DIRECTION_CONSUMING] = Some(handle);
			response.sockaddr_items.push(SockaddrInfo {
				direction: SockaddrDirection::OriginatorToTarget,
				address: bind,
			});
		}
		ConnectionType::Multicast => {
			/* consume from the group the originator advertised, or our own */
			let group = request
				.sockaddr_items
				.iter()
				.find(|item| item.direction == SockaddrDirection::OriginatorToTarget)
				.map(|item| item.address)
				.unwrap_or(multicast_group);
			let handle = rt
				.sockets
				.create_udp_socket(UdpDirection::Consuming, group, dscp)
				.ok_or_else(socket_failure)?;
			rt.connections.pool[index].sockets[DIRECTION_CONSUMING] = Some(handle);
			response.sockaddr_items.push(SockaddrInfo {
				direction: SockaddrDirection::OriginatorToTarget,
				address: group,
			});
		}
		_ => {}
	}

	match producing_type {
		ConnectionType::PointToPoint => {
			/* the originator may name its consuming port in a T->O sockaddr */
			let port = request
				.sockaddr_items
				.iter()
				.find(|item| item.direction == SockaddrDirection::TargetToOriginator)
				.map(|item| item.address.port())
				.unwrap_or(IO_UDP_PORT);
			let remote = SocketAddrV4::new(*request.originator.ip(), port);
			let handle = rt
				.sockets
				.create_udp_socket(UdpDirection::Producing, remote, dscp)
				.ok_or_else(socket_failure)?;
			let connection = &mut rt.connections.pool[index];
			connection.sockets[DIRECTION_PRODUCING] = Some(handle);
			connection.remote_address = remote;
		}
		ConnectionType::Multicast => {
			open_producing_multicast(rt, index, multicast_group, dscp, response)
				.map_err(|_| socket_failure())?;
		}
		_ => {}
	}

	Ok(())
}

/// Producing multicast: the first producer on an input point opens the
/// socket and advertises the target-chosen group; later connections inherit
/// the established producer's connection id, and only an exclusive owner
/// takes over the socket itself.
fn open_producing_multicast(
	rt: &mut CipRuntime,
	index: usize,
	group: SocketAddrV4,
	dscp: u8,
	response: &mut Response,
) -> Result<(), ()> {
	let producing_point = rt.connections.pool[index]
		.producing_point
		.expect("multicast producer without a producing point");
	let existing = rt.connections.existing_producer_multicast(producing_point);

	match existing {
		None => {
			let handle = rt
				.sockets
				.create_udp_socket(UdpDirection::Producing, group, dscp)
				.ok_or(())?;
			let connection = &mut rt.connections.pool[index];
			connection.sockets[DIRECTION_PRODUCING] = Some(handle);
			connection.remote_address = group;
		}
		Some(existing_index) => {
			let (existing_id, existing_remote) = {
				let existing = &rt.connections.pool[existing_index];
				(existing.produced_connection_id, existing.remote_address)
			};

			let take_socket =
				rt.connections.pool[index].instance_type == InstanceType::IoExclusiveOwner;
			if take_socket {
				let socket = rt.connections.pool[existing_index].sockets[DIRECTION_PRODUCING]
					.take();
				rt.connections.pool[index].sockets[DIRECTION_PRODUCING] = socket;
			} else {
				rt.connections.pool[index].sockets[DIRECTION_PRODUCING] = None;
			}

			let connection = &mut rt.connections.pool[index];
			connection.produced_connection_id = existing_id;
			connection.remote_address = existing_remote;
		}
	}

	response.sockaddr_items.push(SockaddrInfo {
		direction: SockaddrDirection::TargetToOriginator,
		address: rt.connections.pool[index].remote_address,
	});
	Ok(())
}

/// Build and send one produced Class 0/1 frame: the address item with the
/// encapsulation sequence, then the connected data item with the application
/// sequence, the optional run/idle header and the assembly payload.
pub fn send_connected_data(rt: &mut CipRuntime, index: usize) -> io::Result<()> {
	let (producing_instance, transport_class, produced_id, remote, handle) = {
		let connection = &rt.connections.pool[index];
		(
			connection.producing_instance,
			connection.transport_trigger.transport_class(),
			connection.produced_connection_id,
			connection.remote_address,
			connection.sockets[DIRECTION_PRODUCING],
		)
	};
	let Some(handle) = handle else {
		return Ok(());
	};

	let data_changed = rt.app.before_assembly_data_send(producing_instance);
	let payload = assembly::data(&rt.registry, producing_instance)
		.unwrap_or(&[])
		.to_vec();

	let (eip_sequence, application_sequence) = {
		let connection = &mut rt.connections.pool[index];
		connection.eip_sequence_producing = connection.eip_sequence_producing.wrapping_add(1);
		if data_changed {
			connection.sequence_producing = connection.sequence_producing.wrapping_add(1);
		}
		(connection.eip_sequence_producing, connection.sequence_producing)
	};

	let mut frame: Vec<u8> = Vec::with_capacity(24 + payload.len());
	frame.extend_from_slice(&2u16.to_le_bytes()); /* item count */

	if transport_class != 0 {
		frame.extend_from_slice(&ITEM_SEQUENCED_ADDRESS.to_le_bytes());
		frame.extend_from_slice(&8u16.to_le_bytes());
		frame.extend_from_slice(&produced_id.to_le_bytes());
		frame.extend_from_slice(&eip_sequence.to_le_bytes());
	} else {
		frame.extend_from_slice(&ITEM_CONNECTED_ADDRESS.to_le_bytes());
		frame.extend_from_slice(&4u16.to_le_bytes());
		frame.extend_from_slice(&produced_id.to_le_bytes());
	}

	let mut data_length = payload.len();
	if rt.config.produced_data_has_run_idle_header {
		data_length += 4;
	}
	if transport_class == 1 {
		data_length += 2;
	}

	frame.extend_from_slice(&ITEM_CONNECTED_DATA.to_le_bytes());
	frame.extend_from_slice(&(data_length as u16).to_le_bytes());
	if transport_class == 1 {
		frame.extend_from_slice(&application_sequence.to_le_bytes());
	}
	if rt.config.produced_data_has_run_idle_header {
		frame.extend_from_slice(&rt.run_idle_state.to_le_bytes());
	}
	frame.extend_from_slice(&payload);

	debug!(rt.logger, "producing connected data";
		"connection" => produced_id, "sequence" => eip_sequence);
	rt.sockets.send_udp(handle, remote, &frame)
}

/// Consume one accepted connected payload: the Class 1 application sequence
/// filter, the optional run/idle header, then exact-length delivery into the
/// consuming assembly.
pub fn receive_io_data(rt: &mut CipRuntime, index: usize, data: &[u8]) {
	let mut data = data;

	{
		let connection = &mut rt.connections.pool[index];
		if connection.transport_trigger.transport_class() == 1 {
			if data.len() < 2 {
				return;
			}
			let sequence = u16::from_le_bytes([data[0], data[1]]);
			if seq_leq16(sequence, connection.sequence_consuming) {
				/* no new data for the assembly */
				return;
			}
			connection.sequence_consuming = sequence;
			data = &data[2..];
		}
	}

	if data.is_empty() {
		return;
	}

	if rt.config.consumed_data_has_run_idle_header {
		if data.len() < 4 {
			return;
		}
		let run_idle = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
		if run_idle != rt.run_idle_state {
			rt.app.run_idle_changed(run_idle);
			rt.run_idle_state = run_idle;
		}
		data = &data[4..];
	}

	let consuming_instance = rt.connections.pool[index].consuming_instance;
	let payload = data.to_vec();
	if assembly::connected_data_received(rt, consuming_instance, &payload).is_err() {
		warn!(rt.logger, "consumed data rejected by assembly";
			"instance" => consuming_instance);
	}
}

/// Close an I/O connection. A closing multicast producer hands its socket to
/// the next non-controlling connection on the same input point; with nobody
/// left, the listen-only connections on that point close too.
pub fn close_io_connection(rt: &mut CipRuntime, index: usize) {
	let (output, input) = {
		let connection = &rt.connections.pool[index];
		(
			connection.consuming_point.unwrap_or(0),
			connection.producing_point.unwrap_or(0),
		)
	};
	rt.app
		.io_connection_event(output, input, IoConnectionEvent::Closed);

	let hands_over = {
		let connection = &rt.connections.pool[index];
		matches!(
			connection.instance_type,
			InstanceType::IoExclusiveOwner | InstanceType::IoInputOnly
		) && connection.t_to_o_parameters.connection_type == ConnectionType::Multicast
			&& connection.sockets[DIRECTION_PRODUCING].is_some()
	};

	if hands_over {
		let producing_point = rt.connections.pool[index]
			.producing_point
			.expect("multicast producer without a producing point");
		match rt.connections.next_non_control_master(producing_point) {
			Some(next_index) => transfer_producing_socket(rt, index, next_index),
			None => {
				close_all_for_input_with_type(rt, producing_point, InstanceType::IoListenOnly)
			}
		}
	}

	let connection = &mut rt.connections.pool[index];
	let sockets = [
		connection.sockets[DIRECTION_CONSUMING].take(),
		connection.sockets[DIRECTION_PRODUCING].take(),
	];
	for handle in sockets.into_iter().flatten() {
		rt.sockets.close_udp_socket(handle);
	}

	rt.connections.remove_active(index);
	rt.connections.pool[index] = Connection::default();
}

/// The inactivity watchdog fired. The connection stays in the active list in
/// the timed-out state until a Forward_Close cleans it up, but multicast
/// production is handed over immediately.
pub fn handle_io_timeout(rt: &mut CipRuntime, index: usize) {
	let (output, input) = {
		let connection = &rt.connections.pool[index];
		(
			connection.consuming_point.unwrap_or(0),
			connection.producing_point.unwrap_or(0),
		)
	};
	rt.app
		.io_connection_event(output, input, IoConnectionEvent::TimedOut);

	/* a watchdog as long as the encapsulation inactivity timeout means the
	   TCP side is equally dead */
	let encapsulation_timeout_ms = rt.encapsulation_inactivity_timeout_s() as i64 * 1000;
	let (reload, session) = {
		let connection = &rt.connections.pool[index];
		(connection.watchdog_reload_ms, connection.associated_session)
	};
	if reload == encapsulation_timeout_ms && session != 0 {
		rt.sessions_to_close.push(session);
	}

	let is_multicast_producer = {
		let connection = &rt.connections.pool[index];
		connection.t_to_o_parameters.connection_type == ConnectionType::Multicast
	};

	if is_multicast_producer {
		let producing_point = rt.connections.pool[index].producing_point.unwrap_or(0);
		let instance_type = rt.connections.pool[index].instance_type;
		match instance_type {
			InstanceType::IoExclusiveOwner => {
				close_all_for_input_with_type(rt, producing_point, InstanceType::IoInputOnly);
				close_all_for_input_with_type(rt, producing_point, InstanceType::IoListenOnly);
			}
			InstanceType::IoInputOnly => {
				if rt.connections.pool[index].sockets[DIRECTION_PRODUCING].is_some() {
					match rt.connections.next_non_control_master(producing_point) {
						Some(next_index) => transfer_producing_socket(rt, index, next_index),
						None => close_all_for_input_with_type(
							rt,
							producing_point,
							InstanceType::IoListenOnly,
						),
					}
				}
			}
			_ => {}
		}
	}

	info!(rt.logger, "io connection moved to timed out";
		"output" => output, "input" => input);
	rt.connections.pool[index].state = ConnectionState::TimedOut;
}

/// Move the producing socket and the production context from one multicast
/// producer to its successor.
fn transfer_producing_socket(rt: &mut CipRuntime, from: usize, to: usize) {
	let socket = rt.connections.pool[from].sockets[DIRECTION_PRODUCING].take();
	let (remote, eip_sequence, sequence, trigger_timer) = {
		let source = &rt.connections.pool[from];
		(
			source.remote_address,
			source.eip_sequence_producing,
			source.sequence_producing,
			source.transmission_trigger_timer_ms,
		)
	};

	let successor = &mut rt.connections.pool[to];
	successor.sockets[DIRECTION_PRODUCING] = socket;
	successor.remote_address = remote;
	successor.eip_sequence_producing = eip_sequence;
	successor.sequence_producing = sequence;
	successor.transmission_trigger_timer_ms = trigger_timer;

	info!(rt.logger, "producing socket handed over";
		"input" => rt.connections.pool[to].producing_point.unwrap_or(0));
}

/// Close every connection of one application type consuming or producing the
/// given input point.
fn close_all_for_input_with_type(rt: &mut CipRuntime, input_point: u32, kind: InstanceType) {
	let indices: Vec<usize> = rt
		.connections
		.active
		.iter()
		.copied()
		.filter(|&i| {
			rt.connections.pool[i].instance_type == kind
				&& rt.connections.pool[i].producing_point == Some(input_point)
		})
		.collect();
	for index in indices {
		close_io_connection(rt, index);
	}
}
