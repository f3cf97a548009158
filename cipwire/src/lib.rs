mod macros;

pub mod epath;
pub mod message;

pub use epath::{CipEpath, PaddedPath};
pub use message::MessageWriter;

use std::io::{self, Read, Write};

/* CIP elementary data type aliases, named as in Vol. 1 Appendix C. */
pub type CipOctet = u8;
pub type CipBool = bool;
pub type CipByte = u8;
pub type CipWord = u16;
pub type CipDword = u32;
pub type CipLword = u64;
pub type CipUsint = u8;
pub type CipUint = u16;
pub type CipUdint = u32;
pub type CipUlint = u64;
pub type CipSint = i8;
pub type CipInt = i16;
pub type CipDint = i32;
pub type CipLint = i64;
pub type CipReal = f32;
pub type CipLreal = f64;

/// A trait for reading a CIP-encoded value from a source. All multi-byte
/// values on the CIP wire are little-endian.
pub trait ReadFrom {
	fn read_from<T: Read>(source: &mut T) -> io::Result<Self>
	where
		Self: Sized;
}

/// A trait for writing a value in its CIP wire encoding.
pub trait WriteTo {
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()>;
}

/// A trait for determining the encoded size of a value in octets.
pub trait Size {
	fn size(&self) -> usize;
}

macro_rules! le_int_impl {
	($($ty:ty),+) => {
		$(
			impl ReadFrom for $ty {
				fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
					let mut buf = [0u8; std::mem::size_of::<$ty>()];
					source.read_exact(&mut buf)?;
					Ok(<$ty>::from_le_bytes(buf))
				}
			}

			impl WriteTo for $ty {
				fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
					target.write_all(&self.to_le_bytes())
				}
			}

			impl Size for $ty {
				fn size(&self) -> usize {
					std::mem::size_of::<$ty>()
				}
			}
		)+
	};
}

le_int_impl!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl ReadFrom for bool {
	fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
		Ok(u8::read_from(source)? != 0)
	}
}

impl WriteTo for bool {
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
		(*self as u8).write_to(target)
	}
}

impl Size for bool {
	fn size(&self) -> usize {
		1
	}
}

impl<const SIZE: usize> ReadFrom for [u8; SIZE] {
	fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
		let mut buf = [0u8; SIZE];
		source.read_exact(&mut buf)?;
		Ok(buf)
	}
}

impl<const SIZE: usize> WriteTo for [u8; SIZE] {
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
		target.write_all(self)
	}
}

impl<const SIZE: usize> Size for [u8; SIZE] {
	fn size(&self) -> usize {
		SIZE
	}
}

/// A SHORT_STRING: one length octet followed by that many character octets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipShortString(pub Vec<u8>);

impl CipShortString {
	pub fn from_str(s: &str) -> Self {
		CipShortString(s.as_bytes().to_vec())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl ReadFrom for CipShortString {
	fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
		let length = u8::read_from(source)? as usize;
		let mut buf = vec![0u8; length];
		source.read_exact(&mut buf)?;
		Ok(CipShortString(buf))
	}
}

impl WriteTo for CipShortString {
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
		(self.0.len() as u8).write_to(target)?;
		target.write_all(&self.0)
	}
}

impl Size for CipShortString {
	fn size(&self) -> usize {
		1 + self.0.len()
	}
}

/// A STRING: two length octets, the character octets, and a pad octet
/// whenever the character count is odd so the total length stays even.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipString(pub Vec<u8>);

impl CipString {
	pub fn from_str(s: &str) -> Self {
		CipString(s.as_bytes().to_vec())
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl ReadFrom for CipString {
	fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
		let length = u16::read_from(source)? as usize;
		let mut buf = vec![0u8; length];
		source.read_exact(&mut buf)?;
		if length & 0x01 != 0 {
			let _pad = u8::read_from(source)?;
		}
		Ok(CipString(buf))
	}
}

impl WriteTo for CipString {
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
		(self.0.len() as u16).write_to(target)?;
		target.write_all(&self.0)?;
		if self.0.len() & 0x01 != 0 {
			0u8.write_to(target)?;
		}
		Ok(())
	}
}

impl Size for CipString {
	fn size(&self) -> usize {
		2 + self.0.len() + (self.0.len() & 0x01)
	}
}

/// The basic string forms a STRINGI entry may nest. The wire tag is the EPATH
/// data type code of the nested form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipStringIContent {
	String(CipString),
	ShortString(CipShortString),
}

impl CipStringIContent {
	/// The EPATH type code identifying the nested string form.
	pub fn type_code(&self) -> u8 {
		match self {
			CipStringIContent::String(_) => 0xD0,
			CipStringIContent::ShortString(_) => 0xDA,
		}
	}
}

/// One internationalised string of a STRINGI: a three-octet ISO 639-2
/// language code, the nested string form tag, the character set, and the
/// string itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipStringIEntry {
	pub language: [u8; 3],
	pub character_set: u16,
	pub content: CipStringIContent,
}

/// A STRINGI: a count octet followed by that many internationalised strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipStringI(pub Vec<CipStringIEntry>);

impl ReadFrom for CipStringIEntry {
	fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
		let language = <[u8; 3]>::read_from(source)?;
		let type_code = u8::read_from(source)?;
		let character_set = u16::read_from(source)?;
		let content = match type_code {
			0xD0 => CipStringIContent::String(CipString::read_from(source)?),
			0xDA => CipStringIContent::ShortString(CipShortString::read_from(source)?),
			code => {
				return Err(io::Error::new(
					io::ErrorKind::InvalidData,
					format!("unsupported STRINGI string form 0x{:02X}", code),
				))
			}
		};

		Ok(CipStringIEntry {
			language,
			character_set,
			content,
		})
	}
}

impl WriteTo for CipStringIEntry {
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
		self.language.write_to(target)?;
		self.content.type_code().write_to(target)?;
		self.character_set.write_to(target)?;
		match &self.content {
			CipStringIContent::String(s) => s.write_to(target),
			CipStringIContent::ShortString(s) => s.write_to(target),
		}
	}
}

impl Size for CipStringIEntry {
	fn size(&self) -> usize {
		let content_size = match &self.content {
			CipStringIContent::String(s) => s.size(),
			CipStringIContent::ShortString(s) => s.size(),
		};
		3 + 1 + 2 + content_size
	}
}

impl ReadFrom for CipStringI {
	fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
		let count = u8::read_from(source)?;
		let mut entries = Vec::with_capacity(count as usize);
		for _ in 0..count {
			entries.push(CipStringIEntry::read_from(source)?);
		}
		Ok(CipStringI(entries))
	}
}

impl WriteTo for CipStringI {
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
		(self.0.len() as u8).write_to(target)?;
		for entry in self.0.iter() {
			entry.write_to(target)?;
		}
		Ok(())
	}
}

impl Size for CipStringI {
	fn size(&self) -> usize {
		1 + self.0.iter().map(Size::size).sum::<usize>()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Cursor;

	fn roundtrip<T: ReadFrom + WriteTo + Size + PartialEq + std::fmt::Debug>(value: T) {
		let mut buf = Vec::new();
		value.write_to(&mut buf).unwrap();
		assert_eq!(buf.len(), value.size());
		let decoded = T::read_from(&mut Cursor::new(&buf)).unwrap();
		assert_eq!(decoded, value);
	}

	#[test]
	fn test_primitive_roundtrip() {
		roundtrip(0xA5u8);
		roundtrip(0xBEEFu16);
		roundtrip(0xDEADBEEFu32);
		roundtrip(0x0123_4567_89AB_CDEFu64);
		roundtrip(-2i8);
		roundtrip(-2i16);
		roundtrip(-2i32);
		roundtrip(-2i64);
		roundtrip(1.5f32);
		roundtrip(1.5f64);
		roundtrip(true);
	}

	#[test]
	fn test_uint_is_little_endian() {
		let mut buf = Vec::new();
		0x1234u16.write_to(&mut buf).unwrap();
		assert_eq!(buf, vec![0x34, 0x12]);
	}

	#[test]
	fn test_short_string_roundtrip() {
		roundtrip(CipShortString::from_str("adapter"));
		roundtrip(CipShortString::default());
	}

	#[test]
	fn test_string_odd_length_gets_pad_byte() {
		let s = CipString::from_str("abc");
		let mut buf = Vec::new();
		s.write_to(&mut buf).unwrap();
		assert_eq!(buf, vec![0x03, 0x00, b'a', b'b', b'c', 0x00]);

		let decoded = CipString::read_from(&mut Cursor::new(&buf)).unwrap();
		assert_eq!(decoded, s);
	}

	#[test]
	fn test_string_even_length_has_no_pad() {
		let s = CipString::from_str("abcd");
		let mut buf = Vec::new();
		s.write_to(&mut buf).unwrap();
		assert_eq!(buf.len(), 6);
		roundtrip(s);
	}

	#[test]
	fn test_string_i_roundtrip() {
		roundtrip(CipStringI(vec![CipStringIEntry {
			language: *b"eng",
			character_set: 4,
			content: CipStringIContent::ShortString(CipShortString::from_str("adapter")),
		}]));
	}

	#[test]
	fn test_truncated_string_is_unexpected_eof() {
		let buf = [0x05u8, b'a', b'b'];
		let err = CipShortString::read_from(&mut Cursor::new(&buf[..])).unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
	}
}
