use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use nix::libc;
use slog::{debug, info, o, warn};

use cip::runtime::{SocketDriver, SocketHandle, UdpDirection};

/// One UDP socket the driver manages for a connection.
struct DriverSocket {
	socket: UdpSocket,
	direction: UdpDirection,
}

/// The shared socket table. The CIP core holds the driver half; the poll
/// loop holds the other to wire consuming sockets into its descriptor set.
#[derive(Default)]
pub struct SocketTable {
	sockets: HashMap<SocketHandle, DriverSocket>,
	next_handle: SocketHandle,
}

impl SocketTable {
	/// The consuming sockets to include in the poll set.
	pub fn consuming_handles(&self) -> Vec<SocketHandle> {
		let mut handles: Vec<SocketHandle> = self
			.sockets
			.iter()
			.filter(|(_, entry)| entry.direction == UdpDirection::Consuming)
			.map(|(&handle, _)| handle)
			.collect();
		handles.sort_unstable();
		handles
	}

	pub fn raw_fd(&self, handle: SocketHandle) -> Option<i32> {
		self.sockets.get(&handle).map(|entry| entry.socket.as_raw_fd())
	}

	pub fn recv_from(
		&self,
		handle: SocketHandle,
		buffer: &mut [u8],
	) -> io::Result<(usize, SocketAddrV4)> {
		let entry = self
			.sockets
			.get(&handle)
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))?;
		let (length, from) = entry.socket.recv_from(buffer)?;
		match from {
			SocketAddr::V4(from) => Ok((length, from)),
			SocketAddr::V6(_) => Err(io::Error::new(
				io::ErrorKind::InvalidData,
				"ipv6 datagram on an ipv4 socket",
			)),
		}
	}
}

/// Mark a socket's traffic with a DSCP value; it sits in the upper six bits
/// of the TOS octet.
pub fn set_dscp<T: AsRawFd>(socket: &T, dscp: u8) {
	let tos: libc::c_int = (dscp as libc::c_int) << 2;
	unsafe {
		libc::setsockopt(
			socket.as_raw_fd(),
			libc::IPPROTO_IP,
			libc::IP_TOS,
			(&tos as *const libc::c_int).cast(),
			std::mem::size_of::<libc::c_int>() as libc::socklen_t,
		);
	}
}

/// The platform UDP socket layer behind the `SocketDriver` contract:
/// consuming sockets bind (and join a multicast group where asked),
/// producing sockets just carry the QoS marking.
pub struct UdpDriver {
	table: Rc<RefCell<SocketTable>>,
	logger: slog::Logger,
}

impl UdpDriver {
	pub fn new(logger: &slog::Logger) -> (UdpDriver, Rc<RefCell<SocketTable>>) {
		let table = Rc::new(RefCell::new(SocketTable::default()));
		(
			UdpDriver {
				table: table.clone(),
				logger: logger.new(o!("component" => "udp-driver")),
			},
			table,
		)
	}
}

impl SocketDriver for UdpDriver {
	fn create_udp_socket(
		&mut self,
		direction: UdpDirection,
		address: SocketAddrV4,
		qos_dscp: u8,
	) -> Option<SocketHandle> {
		let socket = match direction {
			UdpDirection::Consuming => {
				let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, address.port());
				let socket = match UdpSocket::bind(bind) {
					Ok(socket) => socket,
					Err(error) => {
						warn!(self.logger, "cannot bind consuming socket";
							"address" => %bind, "error" => %error);
						return None;
					}
				};
				if address.ip().is_multicast() {
					if let Err(error) =
						socket.join_multicast_v4(address.ip(), &Ipv4Addr::UNSPECIFIED)
					{
						warn!(self.logger, "cannot join multicast group";
							"group" => %address.ip(), "error" => %error);
						return None;
					}
				}
				socket
			}
			UdpDirection::Producing => match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
				Ok(socket) => socket,
				Err(error) => {
					warn!(self.logger, "cannot create producing socket"; "error" => %error);
					return None;
				}
			},
		};

		if socket.set_nonblocking(true).is_err() {
			return None;
		}
		set_dscp(&socket, qos_dscp);

		let mut table = self.table.borrow_mut();
		table.next_handle += 1;
		let handle = table.next_handle;
		table.sockets.insert(handle, DriverSocket { socket, direction });
		debug!(self.logger, "udp socket created";
			"handle" => handle, "direction" => ?direction, "address" => %address);
		Some(handle)
	}

	fn close_udp_socket(&mut self, handle: SocketHandle) {
		if self.table.borrow_mut().sockets.remove(&handle).is_some() {
			debug!(self.logger, "udp socket closed"; "handle" => handle);
		}
	}

	fn send_udp(
		&mut self,
		handle: SocketHandle,
		destination: SocketAddrV4,
		data: &[u8],
	) -> io::Result<()> {
		let table = self.table.borrow();
		let entry = table
			.sockets
			.get(&handle)
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))?;
		entry.socket.send_to(data, destination)?;
		Ok(())
	}
}

/// One accepted explicit-messaging TCP stream and its registered session.
pub struct TcpConnection {
	pub stream: TcpStream,
	pub peer: SocketAddrV4,
	pub session: Option<u32>,
}

/// Read one encapsulated frame off the stream. Oversized frames are dropped
/// with a log; only an io error ends the stream.
pub fn read_frame(
	connection: &mut TcpConnection,
	buffer_bound: usize,
	logger: &slog::Logger,
) -> io::Result<Option<Vec<u8>>> {
	match enip::read_frame(&mut connection.stream, buffer_bound) {
		Ok(frame) => Ok(Some(frame)),
		Err(enip::EncapError::Oversized { declared, bound }) => {
			warn!(logger, "oversized encapsulated frame dropped";
				"peer" => %connection.peer, "declared" => declared, "bound" => bound);
			Ok(None)
		}
		Err(enip::EncapError::Io(error)) => Err(error),
	}
}

pub fn send_reply(connection: &mut TcpConnection, reply: &[u8], logger: &slog::Logger) {
	if let Err(error) = connection.stream.write_all(reply) {
		info!(logger, "reply write failed, dropping stream";
			"peer" => %connection.peer, "error" => %error);
	}
}
