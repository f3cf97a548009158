use std::io::{self, Cursor};
use std::net::SocketAddrV4;

use cipwire::{CipEpath, MessageWriter, PaddedPath, ReadFrom, WriteTo};

use crate::cpf::SockaddrInfo;
use crate::status::GeneralStatus;

/// A deserialised Message Router Request: the service code, the decoded
/// request path, and a cursor over the remaining service data. Socket
/// address info items that arrived in the encapsulation wrapper ride along
/// for Forward_Open.
#[derive(Debug)]
pub struct Request<'a> {
	pub service: u8,
	pub path: CipEpath,
	pub data_segment: Option<Vec<u8>>,
	pub data: Cursor<&'a [u8]>,
	pub originator: SocketAddrV4,
	pub session: u32,
	pub sockaddr_items: Vec<SockaddrInfo>,
}

impl<'a> Request<'a> {
	/// Parse `service | request_path_size | request_path | service_data`.
	/// On a path parse failure the already-read service code is returned so
	/// the caller can still echo a reply.
	pub fn decode(
		bytes: &'a [u8],
		originator: SocketAddrV4,
		session: u32,
	) -> Result<Request<'a>, (u8, GeneralStatus)> {
		let mut cursor = Cursor::new(bytes);
		let service =
			u8::read_from(&mut cursor).map_err(|_| (0, GeneralStatus::NotEnoughData))?;
		let path = PaddedPath::read_from(&mut cursor).map_err(|e| {
			let status = match e.kind() {
				io::ErrorKind::UnexpectedEof => GeneralStatus::NotEnoughData,
				_ => GeneralStatus::PathSegmentError,
			};
			(service, status)
		})?;

		let position = cursor.position() as usize;
		Ok(Request {
			service,
			path: path.epath,
			data_segment: path.data_segment,
			data: Cursor::new(&bytes[position..]),
			originator,
			session,
			sockaddr_items: Vec::new(),
		})
	}

	/// Build a request for an internally triggered service call.
	pub fn internal(
		service: u8,
		path: CipEpath,
		data: &'a [u8],
		originator: SocketAddrV4,
	) -> Request<'a> {
		Request {
			service,
			path,
			data_segment: None,
			data: Cursor::new(data),
			originator,
			session: 0,
			sockaddr_items: Vec::new(),
		}
	}

	/// Octets of service data not yet consumed.
	pub fn remaining(&self) -> usize {
		self.data.get_ref().len() - self.data.position() as usize
	}
}

/// The Message Router Response under construction: reply header fields plus
/// the bounded outgoing-message buffer. Forward_Open additionally parks its
/// socket address info items here for the encapsulation layer to emit.
#[derive(Debug)]
pub struct Response {
	pub reply_service: u8,
	pub general_status: GeneralStatus,
	pub additional_status: Vec<u16>,
	pub message: MessageWriter,
	pub sockaddr_items: Vec<SockaddrInfo>,
	capacity: usize,
}

impl Response {
	pub fn new(capacity: usize) -> Self {
		Response {
			reply_service: 0,
			general_status: GeneralStatus::Success,
			additional_status: Vec::new(),
			message: MessageWriter::new(capacity),
			sockaddr_items: Vec::new(),
			capacity,
		}
	}

	/// Reset the response for a fresh reply to `service`: clears the message
	/// and any additional status and sets the reply service echo.
	pub fn start(&mut self, service: u8, status: GeneralStatus) {
		self.reply_service = 0x80 | service;
		self.general_status = status;
		self.additional_status.clear();
		self.message = MessageWriter::new(self.capacity);
	}

	pub fn set_status(&mut self, status: GeneralStatus) {
		self.general_status = status;
	}

	pub fn set_extended_status(&mut self, status: GeneralStatus, additional: &[u16]) {
		debug_assert!(additional.len() <= 2);
		self.general_status = status;
		self.additional_status = additional.to_vec();
	}

	/// Serialise `reply_service | reserved | general_status | add-status
	/// count | add-status words | response_data`.
	pub fn encode<T: io::Write>(&self, target: &mut T) -> io::Result<()> {
		self.reply_service.write_to(target)?;
		0u8.write_to(target)?;
		self.general_status.write_to(target)?;
		(self.additional_status.len() as u8).write_to(target)?;
		for word in self.additional_status.iter() {
			word.write_to(target)?;
		}
		target.write_all(self.message.as_slice())
	}

	pub fn encoded_len(&self) -> usize {
		4 + self.additional_status.len() * 2 + self.message.len()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn originator() -> SocketAddrV4 {
		"192.168.1.10:2222".parse().unwrap()
	}

	#[test]
	fn test_request_decode() {
		/* GetAttributeSingle of Identity instance 1 attribute 1 */
		let bytes = [0x0E, 0x03, 0x20, 0x01, 0x24, 0x01, 0x30, 0x01];
		let request = Request::decode(&bytes, originator(), 1).unwrap();
		assert_eq!(request.service, 0x0E);
		assert_eq!(request.path, CipEpath::new(0x01, 0x01, 0x01));
		assert_eq!(request.remaining(), 0);
	}

	#[test]
	fn test_request_decode_keeps_service_data() {
		let bytes = [0x10, 0x02, 0x20, 0x48, 0x30, 0x04, 0x2F];
		let request = Request::decode(&bytes, originator(), 1).unwrap();
		assert_eq!(request.service, 0x10);
		assert_eq!(request.remaining(), 1);
	}

	#[test]
	fn test_request_decode_bad_path_echoes_service() {
		let bytes = [0x0E, 0x01, 0xE3, 0x00];
		let err = Request::decode(&bytes, originator(), 1).unwrap_err();
		assert_eq!(err, (0x0E, GeneralStatus::PathSegmentError));
	}

	#[test]
	fn test_response_encode() {
		let mut response = Response::new(64);
		response.start(0x0E, GeneralStatus::Success);
		response.message.push_u16_le(0x0001).unwrap();
		let mut buf = Vec::new();
		response.encode(&mut buf).unwrap();
		assert_eq!(buf, vec![0x8E, 0x00, 0x00, 0x00, 0x01, 0x00]);
	}

	#[test]
	fn test_response_extended_status_encode() {
		let mut response = Response::new(64);
		response.start(0x54, GeneralStatus::ConnectionFailure);
		response.set_extended_status(GeneralStatus::ConnectionFailure, &[0x0106]);
		let mut buf = Vec::new();
		response.encode(&mut buf).unwrap();
		assert_eq!(buf, vec![0xD4, 0x00, 0x01, 0x01, 0x06, 0x01]);
	}
}
