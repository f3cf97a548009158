mod config;
mod network;
mod nvdata;

use std::cell::Cell;
use std::io::{stderr, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use anyhow::Context;
use clap::{Arg, Command};
use nix::poll::{poll, PollFd, PollFlags};
use slog::{error, info, warn};

use cip::objects::assembly;
use cip::runtime::{Application, CertificateStore, CipRuntime, CsrFields, IoConnectionEvent};
use cip::{connection, cpf, AttrValue, ObjectAddr, ASSEMBLY_CLASS};
use common::obs::assemble_async_logger;
use enip::{SessionManager, TcpAction, ENIP_PORT};

use config::AdapterConfig;
use network::{TcpConnection, UdpDriver};

fn main() {
	let matches = Command::new("adapterd")
		.version("0.1.0")
		.about("An EtherNet/IP adapter daemon")
		.arg(
			Arg::new("config")
				.default_value("adapterd.toml")
				.long("config")
				.short('c')
				.num_args(1)
				.help("The path to the adapter configuration file"),
		)
		.arg(
			Arg::new("listen")
				.default_value("0.0.0.0")
				.long("listen")
				.short('l')
				.num_args(1)
				.help("The address to bind the EtherNet/IP listeners on"),
		)
		.get_matches();

	let logger = assemble_async_logger(stderr());
	let config_path: &String = matches.get_one("config").unwrap();
	let listen: &String = matches.get_one("listen").unwrap();

	if let Err(err) = run(&logger, PathBuf::from(config_path), listen) {
		error!(logger, "adapterd failed"; "error" => format!("{:#}", err));
		std::process::exit(1);
	}
}

/// The demo application: produced data always counts as fresh, and data
/// consumed into the output assembly is mirrored back into the input
/// assembly, like the shipped sample I/O wiring.
struct DemoApplication {
	mirror_output: Option<u32>,
	mirror_pending: Rc<Cell<bool>>,
	logger: slog::Logger,
}

impl Application for DemoApplication {
	fn before_assembly_data_send(&mut self, _instance_number: u16) -> bool {
		true
	}

	fn after_assembly_data_received(&mut self, instance_number: u16) -> Result<(), ()> {
		if Some(instance_number as u32) == self.mirror_output {
			self.mirror_pending.set(true);
		}
		Ok(())
	}

	fn run_idle_changed(&mut self, run_idle: u32) {
		info!(self.logger, "run/idle changed"; "run_idle" => run_idle);
	}

	fn io_connection_event(&mut self, output_point: u32, input_point: u32, event: IoConnectionEvent) {
		info!(self.logger, "io connection event";
			"output" => output_point, "input" => input_point, "event" => ?event);
	}

	fn reset_device(&mut self, reset_type: u8) {
		info!(self.logger, "identity reset requested"; "type" => reset_type);
	}
}

/// Certificate cryptography lives outside the core; this stand-in hands out
/// a placeholder CSR and accepts every chain.
struct StubCertificateAuthority {
	logger: slog::Logger,
}

impl CertificateStore for StubCertificateAuthority {
	fn generate_csr(&mut self, fields: &CsrFields) -> Vec<u8> {
		info!(self.logger, "generating csr";
			"common_name" => String::from_utf8_lossy(&fields.common_name.0).into_owned());
		let mut csr = b"-----BEGIN CERTIFICATE REQUEST-----\n".to_vec();
		csr.extend_from_slice(&fields.common_name.0);
		csr.extend_from_slice(b"\n-----END CERTIFICATE REQUEST-----\n");
		csr
	}

	fn verify_certificate(&mut self, path: &cipwire::CipEpath) -> bool {
		info!(self.logger, "verifying certificate";
			"class" => path.class_id, "instance" => path.instance_number);
		true
	}
}

fn run(logger: &slog::Logger, config_path: PathBuf, listen: &str) -> anyhow::Result<()> {
	let config = AdapterConfig::load(&config_path)?;
	let listen_ip: Ipv4Addr = listen.parse().context("parsing the listen address")?;

	let (driver, socket_table) = UdpDriver::new(logger);
	let mirror_pending = Rc::new(Cell::new(false));
	let mirror_pair = config
		.exclusive_owner
		.first()
		.map(|slot| (slot.output, slot.input));

	let mut rt = CipRuntime::new(
		config.device_identity(),
		config.interface_settings(),
		config.stack_config(),
		Box::new(driver),
		Box::new(DemoApplication {
			mirror_output: mirror_pair.map(|(output, _)| output),
			mirror_pending: mirror_pending.clone(),
			logger: logger.clone(),
		}),
		Box::new(StubCertificateAuthority {
			logger: logger.clone(),
		}),
		logger.clone(),
	);

	for section in config.assembly.iter() {
		assembly::create_assembly_instance(&mut rt.registry, section.id, section.size);
	}

	if let Some(data) = nvdata::load(&config.nv_dir, logger) {
		nvdata::apply(&mut rt, &data);
	}

	let mut sessions = SessionManager::new(logger.clone());

	let listener = TcpListener::bind(SocketAddrV4::new(listen_ip, ENIP_PORT))
		.with_context(|| format!("binding tcp {}:{}", listen_ip, ENIP_PORT))?;
	listener.set_nonblocking(true)?;
	let udp = UdpSocket::bind(SocketAddrV4::new(listen_ip, ENIP_PORT))
		.with_context(|| format!("binding udp {}:{}", listen_ip, ENIP_PORT))?;
	udp.set_nonblocking(true)?;

	let explicit_dscp = cip::objects::qos::dscp_explicit(&rt.registry);
	network::set_dscp(&listener, explicit_dscp);
	network::set_dscp(&udp, explicit_dscp);

	info!(logger, "listening"; "address" => %listen_ip, "port" => ENIP_PORT);

	let tick_ms = rt.config.timer_tick_ms.max(1);
	let buffer_bound = rt.config.buffer_size;
	let mut streams: Vec<TcpConnection> = Vec::new();
	let mut last_tick = Instant::now();

	loop {
		let io_handles = socket_table.borrow().consuming_handles();
		/* the ready flags below index against this snapshot of the stream
		   list; accepts only append */
		let stream_count = streams.len();

		/* assemble the poll set: the listeners, the explicit streams, and
		   every consuming I/O socket */
		let elapsed_ms = last_tick.elapsed().as_millis() as u64;
		let wait_ms = tick_ms.saturating_sub(elapsed_ms).min(u16::MAX as u64);
		let ready = {
			let table = socket_table.borrow();
			let mut borrowed_handles: Vec<BorrowedFd> = Vec::with_capacity(io_handles.len());
			for &handle in io_handles.iter() {
				let raw = table.raw_fd(handle).expect("handle without socket");
				/* the table outlives the poll set within this block */
				borrowed_handles.push(unsafe { BorrowedFd::borrow_raw(raw) });
			}
			let mut fds: Vec<PollFd> = Vec::with_capacity(2 + streams.len() + io_handles.len());
			fds.push(PollFd::new(&listener, PollFlags::POLLIN));
			fds.push(PollFd::new(&udp, PollFlags::POLLIN));
			for connection in streams.iter() {
				fds.push(PollFd::new(&connection.stream, PollFlags::POLLIN));
			}
			for borrowed in borrowed_handles.iter() {
				fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
			}

			match poll(&mut fds, wait_ms as nix::libc::c_int) {
				Ok(_) => {}
				Err(nix::errno::Errno::EINTR) => continue,
				Err(err) => return Err(err).context("polling the socket set"),
			}

			fds.iter()
				.map(|fd| {
					fd.revents()
						.map_or(false, |revents| {
							revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
						})
				})
				.collect::<Vec<bool>>()
		};

		/* new explicit TCP connections */
		if ready[0] {
			loop {
				match listener.accept() {
					Ok((stream, SocketAddr::V4(peer))) => {
						stream.set_nonblocking(false)?;
						info!(logger, "tcp connection accepted"; "peer" => %peer);
						streams.push(TcpConnection {
							stream,
							peer,
							session: None,
						});
					}
					Ok((_, SocketAddr::V6(peer))) => {
						warn!(logger, "dropping ipv6 peer"; "peer" => %peer);
					}
					Err(err) if err.kind() == ErrorKind::WouldBlock => break,
					Err(err) => {
						warn!(logger, "accept failed"; "error" => %err);
						break;
					}
				}
			}
		}

		/* unsolicited UDP requests: List_Identity and friends */
		if ready[1] {
			let mut buffer = [0u8; 1500];
			loop {
				match udp.recv_from(&mut buffer) {
					Ok((length, SocketAddr::V4(peer))) => {
						if let Some(reply) =
							enip::handle_udp_frame(&mut rt, &buffer[..length], peer)
						{
							let _ = udp.send_to(&reply, peer);
						}
					}
					Ok((_, SocketAddr::V6(_))) => {}
					Err(err) if err.kind() == ErrorKind::WouldBlock => break,
					Err(err) => {
						warn!(logger, "udp receive failed"; "error" => %err);
						break;
					}
				}
			}
		}

		/* explicit TCP traffic */
		let mut dropped: Vec<usize> = Vec::new();
		for index in 0..stream_count {
			if !ready[2 + index] {
				continue;
			}
			let connection = &mut streams[index];
			match network::read_frame(connection, buffer_bound, logger) {
				Ok(Some(frame)) => {
					let action = enip::handle_tcp_frame(
						&mut rt,
						&mut sessions,
						&mut connection.session,
						&frame,
						connection.peer,
					);
					match action {
						TcpAction::Reply(reply) => {
							network::send_reply(connection, &reply, logger)
						}
						TcpAction::Close => dropped.push(index),
						TcpAction::None => {}
					}
				}
				Ok(None) => {}
				Err(err) => {
					info!(logger, "tcp connection gone";
						"peer" => %connection.peer, "error" => %err);
					if let Some(handle) = connection.session.take() {
						sessions.unregister(handle);
						connection::close_connections_for_session(&mut rt, handle);
					}
					dropped.push(index);
				}
			}
		}
		for index in dropped.into_iter().rev() {
			streams.remove(index);
		}

		/* consuming I/O datagrams */
		let mut datagrams: Vec<(Vec<u8>, SocketAddrV4)> = Vec::new();
		for (offset, &handle) in io_handles.iter().enumerate() {
			if !ready[2 + stream_count + offset] {
				continue;
			}
			let mut buffer = [0u8; 1500];
			loop {
				match socket_table.borrow().recv_from(handle, &mut buffer) {
					Ok((length, from)) => datagrams.push((buffer[..length].to_vec(), from)),
					Err(err) if err.kind() == ErrorKind::WouldBlock => break,
					Err(_) => break,
				}
			}
		}
		for (datagram, from) in datagrams {
			match cpf::parse_connected_packet(&datagram) {
				Ok(Some(packet)) => {
					connection::handle_received_connected_data(&mut rt, &packet, from)
				}
				Ok(None) => {}
				Err(err) => {
					warn!(logger, "undecodable connected datagram";
						"from" => %from, "error" => %err);
				}
			}
		}

		/* demo wiring: consumed output data reappears on the input assembly */
		if mirror_pending.take() {
			if let Some((output, input)) = mirror_pair {
				let data = assembly::data(&rt.registry, output as u16).map(|d| d.to_vec());
				if let Some(data) = data {
					if let Some(attribute) = rt
						.registry
						.attribute_mut(ObjectAddr::new(ASSEMBLY_CLASS, input as u16), 3)
					{
						if let AttrValue::ByteArray(buffer) = &mut attribute.value {
							if buffer.len() == data.len() {
								buffer.copy_from_slice(&data);
							}
						}
					}
				}
			}
		}

		/* the millisecond tick: connection timers, session inactivity and
		   deferred NV writes */
		let elapsed = last_tick.elapsed().as_millis() as u64;
		if elapsed >= tick_ms {
			rt.manage(elapsed);

			let mut to_close = sessions.manage(elapsed);
			to_close.extend(rt.take_sessions_to_close());
			for handle in to_close {
				sessions.unregister(handle);
				connection::close_connections_for_session(&mut rt, handle);
				if let Some(index) = streams.iter().position(|c| c.session == Some(handle)) {
					info!(logger, "closing tcp stream for expired session";
						"handle" => handle);
					streams.remove(index);
				}
			}

			if rt.take_nv_dirty() {
				let snapshot = nvdata::collect(&rt);
				if let Err(err) = nvdata::store(&config.nv_dir, &snapshot, logger) {
					warn!(logger, "storing nv data failed"; "error" => format!("{:#}", err));
				}
			}

			last_tick = Instant::now();
		}
	}
}
