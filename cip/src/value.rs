use std::io::{self, Cursor, Read};

use cipwire::{CipEpath, CipShortString, CipString, CipStringI, MessageWriter, ReadFrom, Size};

use crate::status::GeneralStatus;

/// One IANA TLS cipher suite identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CipherSuiteId {
	pub iana_first_byte: u8,
	pub iana_second_byte: u8,
}

/// A pre-shared key as configured through EtherNet/IP Security attribute 5.
/// The key material never leaves the device: reads of the attribute encode an
/// empty set regardless of the stored contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreSharedKey {
	pub identity: Vec<u8>,
	pub key: Vec<u8>,
}

/// A reference to a certificate: its verification status plus the EPATH of
/// the File Object instance holding it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateReference {
	pub status: u8,
	pub path: Option<CipEpath>,
}

/// The interface configuration struct of TCP/IP Interface attribute 5. All
/// addresses are host byte order here; the codec emits them little-endian as
/// UDINTs per the object definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfiguration {
	pub ip_address: u32,
	pub network_mask: u32,
	pub gateway: u32,
	pub name_server: u32,
	pub name_server_2: u32,
	pub domain_name: CipString,
}

fn write_short_epath(path: &Option<CipEpath>, out: &mut MessageWriter) -> io::Result<()> {
	match path {
		Some(epath) => {
			out.push_u8(epath.word_count())?;
			epath.encode_padded(out)
		}
		None => out.push_u8(0),
	}
}

fn short_epath_size(path: &Option<CipEpath>) -> usize {
	match path {
		Some(epath) => 1 + epath.word_count() as usize * 2,
		None => 1,
	}
}

fn read_short_epath<T: Read>(source: &mut T) -> io::Result<Option<CipEpath>> {
	let path = cipwire::PaddedPath::read_from(source)?;
	if path.epath == CipEpath::default() {
		Ok(None)
	} else {
		Ok(Some(path.epath))
	}
}

/// The typed storage behind one attribute slot. Encoding and decoding
/// dispatch on the variant, one per CIP data type the device carries.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
	Bool(bool),
	Usint(u8),
	Uint(u16),
	Udint(u32),
	Ulint(u64),
	Sint(i8),
	Int(i16),
	Dint(i32),
	Lint(i64),
	Byte(u8),
	Word(u16),
	Dword(u32),
	Lword(u64),
	Real(f32),
	Lreal(f64),
	ShortString(CipShortString),
	String(CipString),
	StringI(CipStringI),
	/// Raw octets without a length prefix; the length is fixed by the
	/// binding (assembly buffers, MAC addresses of odd sizes).
	ByteArray(Vec<u8>),
	/// An EPATH attribute in its 16-bit-path-size form.
	Epath(CipEpath),
	/// An EPATH with a USINT path size, as the security objects encode paths.
	ShortEpath(Option<CipEpath>),
	/// The Identity revision pair.
	Revision { major: u8, minor: u8 },
	MacAddress([u8; 6]),
	InterfaceConfiguration(InterfaceConfiguration),
	CipherSuites(Vec<CipherSuiteId>),
	PreSharedKeys(Vec<PreSharedKey>),
	PathList(Vec<CipEpath>),
	Certificate(CertificateReference),
	/// The Certificate Management class certificate list, recomputed by a
	/// pre-get hook walking the instance chain.
	CertificateList(Vec<(CipShortString, CipEpath)>),
	/// A zero-filled region reserved in Get_Attributes_All replies for table
	/// holes that have no real backing storage.
	Dummy(usize),
}

impl AttrValue {
	/// Encode the value onto the outgoing message.
	pub fn encode(&self, out: &mut MessageWriter) -> io::Result<()> {
		match self {
			AttrValue::Bool(v) => out.push(v),
			AttrValue::Usint(v) | AttrValue::Byte(v) => out.push_u8(*v),
			AttrValue::Uint(v) | AttrValue::Word(v) => out.push_u16_le(*v),
			AttrValue::Udint(v) | AttrValue::Dword(v) => out.push_u32_le(*v),
			AttrValue::Ulint(v) | AttrValue::Lword(v) => out.push_u64_le(*v),
			AttrValue::Sint(v) => out.push(v),
			AttrValue::Int(v) => out.push(v),
			AttrValue::Dint(v) => out.push(v),
			AttrValue::Lint(v) => out.push(v),
			AttrValue::Real(v) => out.push(v),
			AttrValue::Lreal(v) => out.push(v),
			AttrValue::ShortString(v) => out.push(v),
			AttrValue::String(v) => out.push(v),
			AttrValue::StringI(v) => out.push(v),
			AttrValue::ByteArray(v) => out.push_bytes(v),
			AttrValue::Epath(v) => out.push(v),
			AttrValue::ShortEpath(v) => write_short_epath(v, out),
			AttrValue::Revision { major, minor } => {
				out.push_u8(*major)?;
				out.push_u8(*minor)
			}
			AttrValue::MacAddress(v) => out.push_bytes(v),
			AttrValue::InterfaceConfiguration(v) => {
				out.push_u32_le(v.ip_address)?;
				out.push_u32_le(v.network_mask)?;
				out.push_u32_le(v.gateway)?;
				out.push_u32_le(v.name_server)?;
				out.push_u32_le(v.name_server_2)?;
				out.push(&v.domain_name)
			}
			AttrValue::CipherSuites(suites) => {
				out.push_u8(suites.len() as u8)?;
				for suite in suites.iter() {
					out.push_u8(suite.iana_first_byte)?;
					out.push_u8(suite.iana_second_byte)?;
				}
				Ok(())
			}
			/* The PSK set is write-only: reads always see zero entries. */
			AttrValue::PreSharedKeys(_) => out.push_u8(0),
			AttrValue::PathList(paths) => {
				out.push_u8(paths.len() as u8)?;
				for path in paths.iter() {
					write_short_epath(&Some(*path), out)?;
				}
				Ok(())
			}
			AttrValue::Certificate(certificate) => {
				out.push_u8(certificate.status)?;
				write_short_epath(&certificate.path, out)
			}
			AttrValue::CertificateList(entries) => {
				out.push_u8(entries.len() as u8)?;
				for (name, path) in entries.iter() {
					out.push(name)?;
					write_short_epath(&Some(*path), out)?;
				}
				Ok(())
			}
			AttrValue::Dummy(len) => {
				for _ in 0..*len {
					out.push_u8(0)?;
				}
				Ok(())
			}
		}
	}

	/// The number of octets `encode` will emit.
	pub fn encoded_size(&self) -> usize {
		match self {
			AttrValue::Bool(_)
			| AttrValue::Usint(_)
			| AttrValue::Byte(_)
			| AttrValue::Sint(_) => 1,
			AttrValue::Uint(_) | AttrValue::Word(_) | AttrValue::Int(_) => 2,
			AttrValue::Udint(_)
			| AttrValue::Dword(_)
			| AttrValue::Dint(_)
			| AttrValue::Real(_) => 4,
			AttrValue::Ulint(_)
			| AttrValue::Lword(_)
			| AttrValue::Lint(_)
			| AttrValue::Lreal(_) => 8,
			AttrValue::ShortString(v) => v.size(),
			AttrValue::String(v) => v.size(),
			AttrValue::StringI(v) => v.size(),
			AttrValue::ByteArray(v) => v.len(),
			AttrValue::Epath(v) => v.size(),
			AttrValue::ShortEpath(v) => short_epath_size(v),
			AttrValue::Revision { .. } => 2,
			AttrValue::MacAddress(_) => 6,
			AttrValue::InterfaceConfiguration(v) => 20 + v.domain_name.size(),
			AttrValue::CipherSuites(suites) => 1 + suites.len() * 2,
			AttrValue::PreSharedKeys(_) => 1,
			AttrValue::PathList(paths) => {
				1 + paths
					.iter()
					.map(|p| short_epath_size(&Some(*p)))
					.sum::<usize>()
			}
			AttrValue::Certificate(c) => 1 + short_epath_size(&c.path),
			AttrValue::CertificateList(entries) => {
				1 + entries
					.iter()
					.map(|(name, path)| name.size() + short_epath_size(&Some(*path)))
					.sum::<usize>()
			}
			AttrValue::Dummy(len) => *len,
		}
	}

	/// Decode a value of the same shape from the request data, replacing the
	/// stored one. A failure is reported as the general status that the set
	/// service answers with; the stored value is left untouched.
	pub fn decode_from(&mut self, data: &mut Cursor<&[u8]>) -> Result<(), GeneralStatus> {
		fn read<T: ReadFrom>(data: &mut Cursor<&[u8]>) -> Result<T, GeneralStatus> {
			T::read_from(data).map_err(|e| match e.kind() {
				io::ErrorKind::UnexpectedEof => GeneralStatus::NotEnoughData,
				_ => GeneralStatus::InvalidAttributeValue,
			})
		}

		match self {
			AttrValue::Bool(v) => *v = read(data)?,
			AttrValue::Usint(v) | AttrValue::Byte(v) => *v = read(data)?,
			AttrValue::Uint(v) | AttrValue::Word(v) => *v = read(data)?,
			AttrValue::Udint(v) | AttrValue::Dword(v) => *v = read(data)?,
			AttrValue::Ulint(v) | AttrValue::Lword(v) => *v = read(data)?,
			AttrValue::Sint(v) => *v = read(data)?,
			AttrValue::Int(v) => *v = read(data)?,
			AttrValue::Dint(v) => *v = read(data)?,
			AttrValue::Lint(v) => *v = read(data)?,
			AttrValue::Real(v) => *v = read(data)?,
			AttrValue::Lreal(v) => *v = read(data)?,
			AttrValue::ShortString(v) => *v = read(data)?,
			AttrValue::String(v) => *v = read(data)?,
			AttrValue::ByteArray(v) => {
				let remaining = data.get_ref().len() - data.position() as usize;
				if remaining < v.len() {
					return Err(GeneralStatus::NotEnoughData);
				}
				if remaining > v.len() {
					return Err(GeneralStatus::TooMuchData);
				}
				data.read_exact(v).map_err(|_| GeneralStatus::NotEnoughData)?;
			}
			AttrValue::ShortEpath(v) => {
				*v = read_short_epath(data).map_err(|e| match e.kind() {
					io::ErrorKind::UnexpectedEof => GeneralStatus::NotEnoughData,
					_ => GeneralStatus::PathSegmentError,
				})?;
			}
			AttrValue::CipherSuites(suites) => {
				let count: u8 = read(data)?;
				let mut decoded = Vec::with_capacity(count as usize);
				for _ in 0..count {
					decoded.push(CipherSuiteId {
						iana_first_byte: read(data)?,
						iana_second_byte: read(data)?,
					});
				}
				*suites = decoded;
			}
			AttrValue::Certificate(certificate) => {
				let status: u8 = read(data)?;
				let path = read_short_epath(data).map_err(|e| match e.kind() {
					io::ErrorKind::UnexpectedEof => GeneralStatus::NotEnoughData,
					_ => GeneralStatus::PathSegmentError,
				})?;
				certificate.status = status;
				certificate.path = path;
			}
			AttrValue::PathList(paths) => {
				let count: u8 = read(data)?;
				let mut decoded = Vec::with_capacity(count as usize);
				for _ in 0..count {
					match read_short_epath(data) {
						Ok(Some(path)) => decoded.push(path),
						Ok(None) => {}
						Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
							return Err(GeneralStatus::NotEnoughData)
						}
						Err(_) => return Err(GeneralStatus::PathSegmentError),
					}
				}
				*paths = decoded;
			}
			/* The remaining shapes have no generic set encoding. */
			_ => return Err(GeneralStatus::AttributeNotSetable),
		}
		Ok(())
	}
}
