use std::net::SocketAddrV4;

use cip::objects::assembly;
use cip::runtime::{
	Application, CertificateStore, CipRuntime, CsrFields, DeviceIdentity, InterfaceSettings,
	SlotTriple, SocketDriver, SocketHandle, StackConfig, UdpDirection,
};
use cipwire::ReadFrom;

use crate::{
	handle_tcp_frame, EncapCommand, EncapHeader, SessionManager, TcpAction,
	ENCAPSULATION_HEADER_LENGTH, STATUS_INVALID_SESSION_HANDLE, STATUS_SUCCESS,
};

struct NullSockets;

impl SocketDriver for NullSockets {
	fn create_udp_socket(
		&mut self,
		_direction: UdpDirection,
		_address: SocketAddrV4,
		_qos_dscp: u8,
	) -> Option<SocketHandle> {
		Some(1)
	}

	fn close_udp_socket(&mut self, _handle: SocketHandle) {}

	fn send_udp(
		&mut self,
		_handle: SocketHandle,
		_destination: SocketAddrV4,
		_data: &[u8],
	) -> std::io::Result<()> {
		Ok(())
	}
}

struct NullApplication;

impl Application for NullApplication {}

struct NullCertificates;

impl CertificateStore for NullCertificates {
	fn generate_csr(&mut self, _fields: &CsrFields) -> Vec<u8> {
		Vec::new()
	}

	fn verify_certificate(&mut self, _path: &cipwire::CipEpath) -> bool {
		false
	}
}

fn runtime() -> CipRuntime {
	let config = StackConfig {
		exclusive_owner_slots: vec![SlotTriple {
			output: 150,
			input: 100,
			config: 151,
		}],
		..StackConfig::default()
	};
	let interface = InterfaceSettings {
		ip_address: "192.168.1.10".parse().unwrap(),
		network_mask: "255.255.255.0".parse().unwrap(),
		..InterfaceSettings::default()
	};
	let mut rt = CipRuntime::new(
		DeviceIdentity::default(),
		interface,
		config,
		Box::new(NullSockets),
		Box::new(NullApplication),
		Box::new(NullCertificates),
		common::obs::discard_logger(),
	);
	assembly::create_assembly_instance(&mut rt.registry, 100, 32);
	assembly::create_assembly_instance(&mut rt.registry, 150, 32);
	assembly::create_assembly_instance(&mut rt.registry, 151, 10);
	rt
}

fn peer() -> SocketAddrV4 {
	"192.168.1.20:49152".parse().unwrap()
}

fn register_session_frame() -> Vec<u8> {
	vec![
		0x65, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
		0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
	]
}

fn send_rr_data_frame(session: u32, request: &[u8]) -> Vec<u8> {
	let mut body: Vec<u8> = Vec::new();
	body.extend_from_slice(&0u32.to_le_bytes());
	body.extend_from_slice(&0u16.to_le_bytes());
	body.extend_from_slice(&2u16.to_le_bytes());
	body.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); /* null address item */
	body.extend_from_slice(&0x00B2u16.to_le_bytes());
	body.extend_from_slice(&(request.len() as u16).to_le_bytes());
	body.extend_from_slice(request);

	let mut frame = Vec::new();
	let mut header = EncapHeader::new(EncapCommand::SendRRData, session);
	header.length = body.len() as u16;
	cipwire::WriteTo::write_to(&header, &mut frame).unwrap();
	frame.extend_from_slice(&body);
	frame
}

fn register(rt: &mut CipRuntime, sessions: &mut SessionManager) -> (Option<u32>, u32) {
	let mut stream_session = None;
	let action = handle_tcp_frame(rt, sessions, &mut stream_session, &register_session_frame(), peer());
	let TcpAction::Reply(reply) = action else {
		panic!("register session produced no reply");
	};
	let header = EncapHeader::read_from(&mut std::io::Cursor::new(&reply)).unwrap();
	assert_eq!(header.status, STATUS_SUCCESS);
	assert_ne!(header.session_handle, 0);
	(stream_session, header.session_handle)
}

#[test]
fn test_register_session_assigns_handle() {
	let mut rt = runtime();
	let mut sessions = SessionManager::new(common::obs::discard_logger());
	let (stream_session, handle) = register(&mut rt, &mut sessions);
	assert_eq!(stream_session, Some(handle));
	assert!(sessions.is_valid(handle));
}

#[test]
fn test_register_then_get_vendor_id() {
	let mut rt = runtime();
	let mut sessions = SessionManager::new(common::obs::discard_logger());
	let (mut stream_session, handle) = register(&mut rt, &mut sessions);

	/* GetAttributeSingle Identity instance 1 attribute 1 */
	let request = [0x0E, 0x03, 0x20, 0x01, 0x24, 0x01, 0x30, 0x01];
	let frame = send_rr_data_frame(handle, &request);
	let action = handle_tcp_frame(&mut rt, &mut sessions, &mut stream_session, &frame, peer());
	let TcpAction::Reply(reply) = action else {
		panic!("no reply");
	};

	/* skip the encapsulation header, interface handle, timeout and the two
	   CPF items down to the Message Router Response */
	let response_offset = ENCAPSULATION_HEADER_LENGTH + 6 + 2 + 4 + 4;
	let response = &reply[response_offset..];
	assert_eq!(response[0], 0x8E); /* reply service */
	assert_eq!(response[1], 0x00);
	assert_eq!(response[2], 0x00); /* success */
	assert_eq!(response[3], 0x00);
	assert_eq!(&response[4..6], &[0x01, 0x00]); /* vendor id 1 */
}

#[test]
fn test_send_rr_data_without_session() {
	let mut rt = runtime();
	let mut sessions = SessionManager::new(common::obs::discard_logger());
	let mut stream_session = None;

	let request = [0x0E, 0x03, 0x20, 0x01, 0x24, 0x01, 0x30, 0x01];
	let frame = send_rr_data_frame(42, &request);
	let action = handle_tcp_frame(&mut rt, &mut sessions, &mut stream_session, &frame, peer());
	let TcpAction::Reply(reply) = action else {
		panic!("no reply");
	};
	let header = EncapHeader::read_from(&mut std::io::Cursor::new(&reply)).unwrap();
	assert_eq!(header.status, STATUS_INVALID_SESSION_HANDLE);
}

#[test]
fn test_unregister_closes_stream() {
	let mut rt = runtime();
	let mut sessions = SessionManager::new(common::obs::discard_logger());
	let (mut stream_session, handle) = register(&mut rt, &mut sessions);

	let mut frame = register_session_frame();
	frame[0] = 0x66; /* UnRegisterSession */
	frame[2] = 0;
	frame.truncate(ENCAPSULATION_HEADER_LENGTH);
	let action = handle_tcp_frame(&mut rt, &mut sessions, &mut stream_session, &frame, peer());
	assert_eq!(action, TcpAction::Close);
	assert!(!sessions.is_valid(handle));
	assert_eq!(stream_session, None);
}

#[test]
fn test_unknown_command_is_rejected() {
	let mut rt = runtime();
	let mut sessions = SessionManager::new(common::obs::discard_logger());
	let mut stream_session = None;

	let mut frame = register_session_frame();
	frame[0] = 0x99;
	frame.truncate(ENCAPSULATION_HEADER_LENGTH);
	frame[2] = 0;
	let action = handle_tcp_frame(&mut rt, &mut sessions, &mut stream_session, &frame, peer());
	let TcpAction::Reply(reply) = action else {
		panic!("no reply");
	};
	let header = EncapHeader::read_from(&mut std::io::Cursor::new(&reply)).unwrap();
	assert_eq!(header.status, crate::STATUS_INVALID_COMMAND);
}

#[test]
fn test_list_identity_over_udp() {
	let mut rt = runtime();
	let mut frame = vec![0u8; ENCAPSULATION_HEADER_LENGTH];
	frame[0] = 0x63; /* ListIdentity */

	let reply = crate::handle_udp_frame(&mut rt, &frame, peer()).expect("no reply");
	let header = EncapHeader::read_from(&mut std::io::Cursor::new(&reply)).unwrap();
	assert_eq!(header.command, 0x63);

	let body = &reply[ENCAPSULATION_HEADER_LENGTH..];
	assert_eq!(&body[0..2], &[0x01, 0x00]); /* one item */
	assert_eq!(&body[2..4], &[0x0C, 0x00]); /* list identity item */
	/* vendor id sits after version and the 16-octet sockaddr */
	assert_eq!(&body[24..26], &[0x01, 0x00]);
}

#[test]
fn test_class3_connected_request_roundtrip() {
	let mut rt = runtime();
	let mut sessions = SessionManager::new(common::obs::discard_logger());
	let (mut stream_session, handle) = register(&mut rt, &mut sessions);

	/* open the class 3 connection through SendRRData */
	let mut fo: Vec<u8> = vec![0x54, 0x02, 0x20, 0x06, 0x24, 0x01];
	fo.push(0x07);
	fo.push(0xE9);
	fo.extend_from_slice(&0u32.to_le_bytes());
	fo.extend_from_slice(&0x0002_0002u32.to_le_bytes());
	fo.extend_from_slice(&0x0042u16.to_le_bytes());
	fo.extend_from_slice(&0x0001u16.to_le_bytes());
	fo.extend_from_slice(&0xCAFE_0042u32.to_le_bytes());
	fo.push(0);
	fo.extend_from_slice(&[0, 0, 0]);
	fo.extend_from_slice(&1_000_000u32.to_le_bytes());
	fo.extend_from_slice(&((2u16 << 13) | 0x0200 | 64).to_le_bytes());
	fo.extend_from_slice(&1_000_000u32.to_le_bytes());
	fo.extend_from_slice(&((2u16 << 13) | 0x0200 | 64).to_le_bytes());
	fo.push(0x83);
	fo.push(0x02);
	fo.extend_from_slice(&[0x20, 0x02, 0x24, 0x01]);

	let frame = send_rr_data_frame(handle, &fo);
	let action = handle_tcp_frame(&mut rt, &mut sessions, &mut stream_session, &frame, peer());
	let TcpAction::Reply(reply) = action else {
		panic!("no reply");
	};
	let response_offset = ENCAPSULATION_HEADER_LENGTH + 6 + 2 + 4 + 4;
	assert_eq!(reply[response_offset + 2], 0x00, "forward open failed");
	let consumed_id = u32::from_le_bytes(
		reply[response_offset + 4..response_offset + 8].try_into().unwrap(),
	);

	/* now a connected GetAttributeSingle through SendUnitData */
	let request = [0x0E, 0x03, 0x20, 0x01, 0x24, 0x01, 0x30, 0x01];
	let mut body: Vec<u8> = Vec::new();
	body.extend_from_slice(&0u32.to_le_bytes());
	body.extend_from_slice(&0u16.to_le_bytes());
	body.extend_from_slice(&2u16.to_le_bytes());
	body.extend_from_slice(&0x00A1u16.to_le_bytes());
	body.extend_from_slice(&4u16.to_le_bytes());
	body.extend_from_slice(&consumed_id.to_le_bytes());
	body.extend_from_slice(&0x00B1u16.to_le_bytes());
	body.extend_from_slice(&((request.len() + 2) as u16).to_le_bytes());
	body.extend_from_slice(&1u16.to_le_bytes()); /* sequence count */
	body.extend_from_slice(&request);

	let mut frame = Vec::new();
	let mut header = EncapHeader::new(EncapCommand::SendUnitData, handle);
	header.length = body.len() as u16;
	cipwire::WriteTo::write_to(&header, &mut frame).unwrap();
	frame.extend_from_slice(&body);

	let action = handle_tcp_frame(&mut rt, &mut sessions, &mut stream_session, &frame, peer());
	let TcpAction::Reply(reply) = action else {
		panic!("no reply");
	};
	/* connected reply: address item with the produced id, data item with the
	   echoed sequence then the response */
	let data_offset = ENCAPSULATION_HEADER_LENGTH + 6 + 2 + 8 + 4;
	assert_eq!(&reply[data_offset..data_offset + 2], &[0x01, 0x00]); /* sequence */
	assert_eq!(reply[data_offset + 2], 0x8E);
	assert_eq!(reply[data_offset + 4], 0x00);

	/* a replayed sequence count is dropped */
	let action = handle_tcp_frame(&mut rt, &mut sessions, &mut stream_session, &frame, peer());
	assert_eq!(action, TcpAction::None);
}
