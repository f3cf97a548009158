mod handler;
mod session;
#[cfg(test)]
mod tests;

pub use handler::{handle_tcp_frame, handle_udp_frame, TcpAction};
pub use session::{Session, SessionManager};

use std::io::{self, Read, Write};

use cipwire::{int_enum, ReadFrom, WriteTo};
use thiserror::Error;

/// The encapsulation header is always 24 octets.
pub const ENCAPSULATION_HEADER_LENGTH: usize = 24;

/// The TCP and UDP port explicit EtherNet/IP traffic uses.
pub const ENIP_PORT: u16 = 0xAF12;

int_enum! {
	/// Encapsulation commands, Vol. 2 2-3.2.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum EncapCommand: u16 {
		Nop = 0x0000,
		ListServices = 0x0004,
		ListIdentity = 0x0063,
		ListInterfaces = 0x0064,
		RegisterSession = 0x0065,
		UnRegisterSession = 0x0066,
		SendRRData = 0x006F,
		SendUnitData = 0x0070,
	}
}

/* Encapsulation status codes, Vol. 2 2-3.6. */
pub const STATUS_SUCCESS: u32 = 0x0000;
pub const STATUS_INVALID_COMMAND: u32 = 0x0001;
pub const STATUS_INSUFFICIENT_MEMORY: u32 = 0x0002;
pub const STATUS_INCORRECT_DATA: u32 = 0x0003;
pub const STATUS_INVALID_SESSION_HANDLE: u32 = 0x0064;
pub const STATUS_INVALID_LENGTH: u32 = 0x0065;
pub const STATUS_UNSUPPORTED_PROTOCOL_VERSION: u32 = 0x0069;

/// The protocol version RegisterSession negotiates.
pub const ENCAPSULATION_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum EncapError {
	#[error("declared length {declared} exceeds the frame bound {bound}")]
	Oversized { declared: usize, bound: usize },

	#[error("io error: {0}")]
	Io(#[from] io::Error),
}

/// Read one encapsulated frame from a TCP stream: the 24-octet header, then
/// exactly the declared number of body octets. A frame above the device
/// buffer bound is drained off the stream (keeping it framed) and reported
/// as oversized; partial receives are not reassembled.
pub fn read_frame<T: Read>(source: &mut T, buffer_bound: usize) -> Result<Vec<u8>, EncapError> {
	let mut header = [0u8; ENCAPSULATION_HEADER_LENGTH];
	source.read_exact(&mut header)?;

	let declared = u16::from_le_bytes([header[2], header[3]]) as usize;
	if declared > buffer_bound {
		let mut remaining = declared;
		let mut scratch = [0u8; 256];
		while remaining > 0 {
			let chunk = remaining.min(scratch.len());
			source.read_exact(&mut scratch[..chunk])?;
			remaining -= chunk;
		}
		return Err(EncapError::Oversized {
			declared,
			bound: buffer_bound,
		});
	}

	let mut frame = vec![0u8; ENCAPSULATION_HEADER_LENGTH + declared];
	frame[..ENCAPSULATION_HEADER_LENGTH].copy_from_slice(&header);
	source.read_exact(&mut frame[ENCAPSULATION_HEADER_LENGTH..])?;
	Ok(frame)
}

/// The 24-octet encapsulation header. The command stays a raw word so that
/// unknown commands can still be answered with an invalid-command status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
	pub command: u16,
	pub length: u16,
	pub session_handle: u32,
	pub status: u32,
	pub sender_context: [u8; 8],
	pub options: u32,
}

impl EncapHeader {
	pub fn new(command: EncapCommand, session_handle: u32) -> EncapHeader {
		EncapHeader {
			command: command.into(),
			length: 0,
			session_handle,
			status: STATUS_SUCCESS,
			sender_context: [0; 8],
			options: 0,
		}
	}

	pub fn command(&self) -> Option<EncapCommand> {
		EncapCommand::try_from(self.command).ok()
	}

	/// A reply header echoing command, session and sender context.
	pub fn reply(&self, status: u32, length: usize) -> EncapHeader {
		EncapHeader {
			command: self.command,
			length: length as u16,
			session_handle: self.session_handle,
			status,
			sender_context: self.sender_context,
			options: 0,
		}
	}
}

impl ReadFrom for EncapHeader {
	fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
		Ok(EncapHeader {
			command: u16::read_from(source)?,
			length: u16::read_from(source)?,
			session_handle: u32::read_from(source)?,
			status: u32::read_from(source)?,
			sender_context: <[u8; 8]>::read_from(source)?,
			options: u32::read_from(source)?,
		})
	}
}

impl WriteTo for EncapHeader {
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
		self.command.write_to(target)?;
		self.length.write_to(target)?;
		self.session_handle.write_to(target)?;
		self.status.write_to(target)?;
		self.sender_context.write_to(target)?;
		self.options.write_to(target)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn test_header_roundtrip() {
		let header = EncapHeader {
			command: EncapCommand::RegisterSession.into(),
			length: 4,
			session_handle: 0xDEAD_BEEF,
			status: 0,
			sender_context: *b"adapter!",
			options: 0,
		};
		let mut buf = Vec::new();
		header.write_to(&mut buf).unwrap();
		assert_eq!(buf.len(), ENCAPSULATION_HEADER_LENGTH);
		let decoded = EncapHeader::read_from(&mut Cursor::new(&buf)).unwrap();
		assert_eq!(decoded, header);
	}

	#[test]
	fn test_register_session_wire_image() {
		let header = EncapHeader::new(EncapCommand::RegisterSession, 0).reply(0, 4);
		let mut buf = Vec::new();
		header.write_to(&mut buf).unwrap();
		assert_eq!(&buf[0..4], &[0x65, 0x00, 0x04, 0x00]);
	}
}
