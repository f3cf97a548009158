use std::io::{Cursor, Read};
use std::net::SocketAddrV4;

use slog::{debug, warn};

use cip::cpf::{
	SockaddrDirection, SockaddrInfo, ITEM_CONNECTED_ADDRESS, ITEM_CONNECTED_DATA,
	ITEM_LIST_IDENTITY, ITEM_LIST_SERVICES, ITEM_NULL_ADDRESS, ITEM_SOCKADDR_INFO_O_TO_T,
	ITEM_SOCKADDR_INFO_T_TO_O, ITEM_UNCONNECTED_DATA,
};
use cip::connection::{seq_leq16, InstanceType};
use cip::objects::tcpip;
use cip::{services, CipRuntime};
use cipwire::{CipShortString, ReadFrom, WriteTo};

use crate::{
	EncapCommand, EncapHeader, SessionManager, ENCAPSULATION_HEADER_LENGTH,
	ENCAPSULATION_PROTOCOL_VERSION, ENIP_PORT, STATUS_INCORRECT_DATA, STATUS_INVALID_COMMAND,
	STATUS_INVALID_SESSION_HANDLE, STATUS_SUCCESS, STATUS_UNSUPPORTED_PROTOCOL_VERSION,
};

/// What the platform should do with the TCP stream after one handled frame.
#[derive(Debug, PartialEq, Eq)]
pub enum TcpAction {
	/// Nothing to send back.
	None,
	/// Send these bytes on the stream.
	Reply(Vec<u8>),
	/// Tear the stream down (UnRegisterSession).
	Close,
}

fn encode_reply(header: EncapHeader, body: &[u8]) -> Vec<u8> {
	let mut frame = Vec::with_capacity(ENCAPSULATION_HEADER_LENGTH + body.len());
	header
		.reply(header.status, body.len())
		.write_to(&mut frame)
		.expect("header encode cannot fail on a vec");
	frame.extend_from_slice(body);
	frame
}

fn status_reply(header: &EncapHeader, status: u32) -> Vec<u8> {
	let mut reply = header.reply(status, 0);
	reply.length = 0;
	let mut frame = Vec::with_capacity(ENCAPSULATION_HEADER_LENGTH);
	reply.write_to(&mut frame).expect("header encode cannot fail");
	frame
}

/// One parsed common packet format item.
struct CpfItem {
	type_id: u16,
	data: Vec<u8>,
}

fn read_cpf_items(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Vec<CpfItem>> {
	let item_count = u16::read_from(cursor)?;
	let mut items = Vec::with_capacity(item_count as usize);
	for _ in 0..item_count {
		let type_id = u16::read_from(cursor)?;
		let length = u16::read_from(cursor)? as usize;
		let mut data = vec![0u8; length];
		cursor.read_exact(&mut data)?;
		items.push(CpfItem { type_id, data });
	}
	Ok(items)
}

fn sockaddr_items(items: &[CpfItem]) -> Vec<SockaddrInfo> {
	items
		.iter()
		.filter_map(|item| {
			let direction = match item.type_id {
				ITEM_SOCKADDR_INFO_O_TO_T => SockaddrDirection::OriginatorToTarget,
				ITEM_SOCKADDR_INFO_T_TO_O => SockaddrDirection::TargetToOriginator,
				_ => return None,
			};
			SockaddrInfo::read_payload(direction, &mut Cursor::new(&item.data[..])).ok()
		})
		.collect()
}

/// Handle one framed encapsulation message from a TCP stream.
/// `stream_session` is the session registered on this stream, if any.
pub fn handle_tcp_frame(
	rt: &mut CipRuntime,
	sessions: &mut SessionManager,
	stream_session: &mut Option<u32>,
	bytes: &[u8],
	peer: SocketAddrV4,
) -> TcpAction {
	let mut cursor = Cursor::new(bytes);
	let Ok(header) = EncapHeader::read_from(&mut cursor) else {
		warn!(rt.logger, "short encapsulation frame"; "peer" => %peer);
		return TcpAction::None;
	};
	let body = &bytes[ENCAPSULATION_HEADER_LENGTH..];
	if header.length as usize != body.len() {
		warn!(rt.logger, "encapsulation length mismatch";
			"declared" => header.length, "received" => body.len());
		return TcpAction::None;
	}

	if let Some(handle) = *stream_session {
		sessions.touch(handle, rt.encapsulation_inactivity_timeout_s());
	}

	let Some(command) = header.command() else {
		debug!(rt.logger, "unknown encapsulation command"; "command" => header.command);
		return TcpAction::Reply(status_reply(&header, STATUS_INVALID_COMMAND));
	};

	match command {
		EncapCommand::Nop => TcpAction::None,
		EncapCommand::ListServices => {
			TcpAction::Reply(encode_reply(header, &list_services_body()))
		}
		EncapCommand::ListIdentity => {
			TcpAction::Reply(encode_reply(header, &list_identity_body(rt)))
		}
		EncapCommand::ListInterfaces => TcpAction::Reply(encode_reply(header, &[0, 0])),
		EncapCommand::RegisterSession => {
			register_session(rt, sessions, stream_session, &header, body, peer)
		}
		EncapCommand::UnRegisterSession => {
			if let Some(handle) = stream_session.take() {
				sessions.unregister(handle);
				cip::connection::close_connections_for_session(rt, handle);
			}
			TcpAction::Close
		}
		EncapCommand::SendRRData => {
			send_rr_data(rt, sessions, *stream_session, &header, body, peer)
		}
		EncapCommand::SendUnitData => {
			send_unit_data(rt, sessions, *stream_session, &header, body, peer)
		}
	}
}

/// Handle one encapsulation datagram from the explicit UDP port. Only the
/// unsolicited list commands and NOP are served here.
pub fn handle_udp_frame(rt: &mut CipRuntime, bytes: &[u8], peer: SocketAddrV4) -> Option<Vec<u8>> {
	let mut cursor = Cursor::new(bytes);
	let header = EncapHeader::read_from(&mut cursor).ok()?;

	match header.command() {
		Some(EncapCommand::ListIdentity) => {
			Some(encode_reply(header, &list_identity_body(rt)))
		}
		Some(EncapCommand::ListServices) => Some(encode_reply(header, &list_services_body())),
		Some(EncapCommand::ListInterfaces) => Some(encode_reply(header, &[0, 0])),
		Some(EncapCommand::Nop) | None => None,
		Some(_) => {
			debug!(rt.logger, "tcp-only command over udp";
				"command" => header.command, "peer" => %peer);
			Some(status_reply(&header, STATUS_INVALID_COMMAND))
		}
	}
}

fn register_session(
	rt: &mut CipRuntime,
	sessions: &mut SessionManager,
	stream_session: &mut Option<u32>,
	header: &EncapHeader,
	body: &[u8],
	peer: SocketAddrV4,
) -> TcpAction {
	let mut cursor = Cursor::new(body);
	let (Ok(version), Ok(options)) = (u16::read_from(&mut cursor), u16::read_from(&mut cursor))
	else {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	};

	if version != ENCAPSULATION_PROTOCOL_VERSION {
		let mut reply = header.reply(STATUS_UNSUPPORTED_PROTOCOL_VERSION, 4);
		reply.status = STATUS_UNSUPPORTED_PROTOCOL_VERSION;
		let mut frame = Vec::new();
		reply.write_to(&mut frame).expect("header encode cannot fail");
		frame.extend_from_slice(&ENCAPSULATION_PROTOCOL_VERSION.to_le_bytes());
		frame.extend_from_slice(&options.to_le_bytes());
		return TcpAction::Reply(frame);
	}

	let handle = sessions.register(peer, rt.encapsulation_inactivity_timeout_s());
	*stream_session = Some(handle);

	let mut reply = header.reply(STATUS_SUCCESS, 4);
	reply.session_handle = handle;
	let mut frame = Vec::new();
	reply.write_to(&mut frame).expect("header encode cannot fail");
	frame.extend_from_slice(&version.to_le_bytes());
	frame.extend_from_slice(&options.to_le_bytes());
	TcpAction::Reply(frame)
}

/// SendRRData carries one unconnected explicit request: a null address item
/// plus an unconnected data item holding the Message Router Request.
fn send_rr_data(
	rt: &mut CipRuntime,
	sessions: &SessionManager,
	stream_session: Option<u32>,
	header: &EncapHeader,
	body: &[u8],
	peer: SocketAddrV4,
) -> TcpAction {
	let session = match stream_session {
		Some(handle) if sessions.is_valid(handle) && header.session_handle == handle => handle,
		_ => {
			return TcpAction::Reply(status_reply(header, STATUS_INVALID_SESSION_HANDLE));
		}
	};

	let mut cursor = Cursor::new(body);
	let (Ok(_interface_handle), Ok(_timeout)) =
		(u32::read_from(&mut cursor), u16::read_from(&mut cursor))
	else {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	};
	let Ok(items) = read_cpf_items(&mut cursor) else {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	};

	let address_ok = items
		.first()
		.is_some_and(|item| item.type_id == ITEM_NULL_ADDRESS);
	let Some(request_item) = items
		.iter()
		.find(|item| item.type_id == ITEM_UNCONNECTED_DATA)
	else {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	};
	if !address_ok {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	}

	let response = {
		let mut request = match cip::Request::decode(&request_item.data, peer, session) {
			Ok(request) => request,
			Err((service, status)) => {
				let mut response = cip::Response::new(rt.config.response_buffer_capacity());
				response.start(service, status);
				return TcpAction::Reply(wrap_rr_reply(header, &response));
			}
		};
		request.sockaddr_items = sockaddr_items(&items);
		let mut response = cip::Response::new(rt.config.response_buffer_capacity());
		services::notify(rt, &mut request, &mut response);
		response
	};

	TcpAction::Reply(wrap_rr_reply(header, &response))
}

fn wrap_rr_reply(header: &EncapHeader, response: &cip::Response) -> Vec<u8> {
	let mut body: Vec<u8> = Vec::new();
	body.extend_from_slice(&0u32.to_le_bytes()); /* interface handle */
	body.extend_from_slice(&0u16.to_le_bytes()); /* timeout */

	let item_count = 2 + response.sockaddr_items.len() as u16;
	body.extend_from_slice(&item_count.to_le_bytes());
	body.extend_from_slice(&ITEM_NULL_ADDRESS.to_le_bytes());
	body.extend_from_slice(&0u16.to_le_bytes());
	body.extend_from_slice(&ITEM_UNCONNECTED_DATA.to_le_bytes());
	body.extend_from_slice(&(response.encoded_len() as u16).to_le_bytes());
	response
		.encode(&mut body)
		.expect("response encode cannot fail on a vec");
	for item in response.sockaddr_items.iter() {
		item.write_item(&mut body).expect("sockaddr encode cannot fail");
	}

	encode_reply(*header, &body)
}

/// SendUnitData carries one Class 3 connected request: a connected address
/// item with the O->T connection id and a connected data item whose first
/// word is the connection sequence count.
fn send_unit_data(
	rt: &mut CipRuntime,
	sessions: &SessionManager,
	stream_session: Option<u32>,
	header: &EncapHeader,
	body: &[u8],
	peer: SocketAddrV4,
) -> TcpAction {
	let session = match stream_session {
		Some(handle) if sessions.is_valid(handle) && header.session_handle == handle => handle,
		_ => {
			return TcpAction::Reply(status_reply(header, STATUS_INVALID_SESSION_HANDLE));
		}
	};

	let mut cursor = Cursor::new(body);
	let (Ok(_interface_handle), Ok(_timeout)) =
		(u32::read_from(&mut cursor), u16::read_from(&mut cursor))
	else {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	};
	let Ok(items) = read_cpf_items(&mut cursor) else {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	};

	let (Some(address_item), Some(data_item)) = (
		items.iter().find(|i| i.type_id == ITEM_CONNECTED_ADDRESS),
		items.iter().find(|i| i.type_id == ITEM_CONNECTED_DATA),
	) else {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	};
	if address_item.data.len() != 4 || data_item.data.len() < 2 {
		return TcpAction::Reply(status_reply(header, STATUS_INCORRECT_DATA));
	}

	let connection_id = u32::from_le_bytes(address_item.data[..4].try_into().unwrap());
	let sequence = u16::from_le_bytes(data_item.data[..2].try_into().unwrap());

	let Some(index) = rt.connections.find_by_consumed_id(connection_id) else {
		warn!(rt.logger, "connected request for unknown connection";
			"connection" => connection_id);
		return TcpAction::None;
	};
	if rt.connections.pool[index].instance_type != InstanceType::Explicit {
		return TcpAction::None;
	}

	{
		let connection = &mut rt.connections.pool[index];
		/* strict 16-bit monotony once traffic has been seen; duplicates are
		   replays of requests already answered */
		let seen_traffic = connection.eip_sequence_consuming != 0;
		if seen_traffic && seq_leq16(sequence, connection.sequence_consuming) {
			return TcpAction::None;
		}
		connection.sequence_consuming = sequence;
		connection.eip_sequence_consuming = 1;
		connection.inactivity_watchdog_timer_ms = connection.watchdog_reload_ms;
	}

	let produced_id = rt.connections.pool[index].produced_connection_id;
	let request_bytes = &data_item.data[2..];
	let response = services::notify_explicit(rt, request_bytes, peer, session);

	let mut reply_body: Vec<u8> = Vec::new();
	reply_body.extend_from_slice(&0u32.to_le_bytes());
	reply_body.extend_from_slice(&0u16.to_le_bytes());
	reply_body.extend_from_slice(&2u16.to_le_bytes());
	reply_body.extend_from_slice(&ITEM_CONNECTED_ADDRESS.to_le_bytes());
	reply_body.extend_from_slice(&4u16.to_le_bytes());
	reply_body.extend_from_slice(&produced_id.to_le_bytes());
	reply_body.extend_from_slice(&ITEM_CONNECTED_DATA.to_le_bytes());
	reply_body.extend_from_slice(&((response.encoded_len() + 2) as u16).to_le_bytes());
	reply_body.extend_from_slice(&sequence.to_le_bytes());
	response
		.encode(&mut reply_body)
		.expect("response encode cannot fail on a vec");

	TcpAction::Reply(encode_reply(*header, &reply_body))
}

fn list_identity_body(rt: &CipRuntime) -> Vec<u8> {
	let device_ip = tcpip::interface_configuration(&rt.registry)
		.map(|configuration| configuration.ip_address)
		.unwrap_or(0);

	let mut payload: Vec<u8> = Vec::new();
	payload.extend_from_slice(&ENCAPSULATION_PROTOCOL_VERSION.to_le_bytes());
	/* sockaddr of the listening endpoint, big-endian */
	payload.extend_from_slice(&2u16.to_be_bytes());
	payload.extend_from_slice(&ENIP_PORT.to_be_bytes());
	payload.extend_from_slice(&device_ip.to_be_bytes());
	payload.extend_from_slice(&[0u8; 8]);
	payload.extend_from_slice(&rt.device.vendor_id.to_le_bytes());
	payload.extend_from_slice(&rt.device.device_type.to_le_bytes());
	payload.extend_from_slice(&rt.device.product_code.to_le_bytes());
	payload.push(rt.device.revision_major);
	payload.push(rt.device.revision_minor);
	payload.extend_from_slice(&rt.device.status.to_le_bytes());
	payload.extend_from_slice(&rt.device.serial_number.to_le_bytes());
	CipShortString::from_str(&rt.device.product_name)
		.write_to(&mut payload)
		.expect("short string encode cannot fail");
	payload.push(0x03); /* state: operational */

	let mut body: Vec<u8> = Vec::new();
	body.extend_from_slice(&1u16.to_le_bytes());
	body.extend_from_slice(&ITEM_LIST_IDENTITY.to_le_bytes());
	body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
	body.extend_from_slice(&payload);
	body
}

fn list_services_body() -> Vec<u8> {
	let mut payload: Vec<u8> = Vec::new();
	payload.extend_from_slice(&ENCAPSULATION_PROTOCOL_VERSION.to_le_bytes());
	/* capability: TCP explicit plus class 0/1 UDP */
	payload.extend_from_slice(&0x0120u16.to_le_bytes());
	payload.extend_from_slice(b"Communications\0\0");

	let mut body: Vec<u8> = Vec::new();
	body.extend_from_slice(&1u16.to_le_bytes());
	body.extend_from_slice(&ITEM_LIST_SERVICES.to_le_bytes());
	body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
	body.extend_from_slice(&payload);
	body
}
