use std::io::{self, Read, Write};

use crate::{ReadFrom, Size, WriteTo};

/* Padded logical segment selectors, Vol. 1 Appendix C-1.4.2. */
const SEGMENT_CLASS_8BIT: u8 = 0x20;
const SEGMENT_CLASS_16BIT: u8 = 0x21;
const SEGMENT_INSTANCE_8BIT: u8 = 0x24;
const SEGMENT_INSTANCE_16BIT: u8 = 0x25;
const SEGMENT_MEMBER_8BIT: u8 = 0x28;
const SEGMENT_MEMBER_16BIT: u8 = 0x29;
const SEGMENT_ATTRIBUTE_8BIT: u8 = 0x30;
const SEGMENT_ATTRIBUTE_16BIT: u8 = 0x31;
const SEGMENT_PRODUCTION_INHIBIT_TIME: u8 = 0x43;
const SEGMENT_SIMPLE_DATA: u8 = 0x80;
const SEGMENT_RESERVED_BASE: u8 = 0xE0;

/// A decoded application path: the class/instance/attribute triple. Elements
/// that were absent from the wire path decode as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CipEpath {
	pub class_id: u16,
	pub instance_number: u16,
	pub attribute_number: u16,
}

/// The full result of decoding a padded request path. Member segments and
/// production inhibit time segments are consumed but not retained; an inline
/// data segment is kept for configuration payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaddedPath {
	pub epath: CipEpath,
	pub data_segment: Option<Vec<u8>>,
}

impl CipEpath {
	pub fn new(class_id: u16, instance_number: u16, attribute_number: u16) -> Self {
		CipEpath {
			class_id,
			instance_number,
			attribute_number,
		}
	}

	/// The number of 16-bit words the padded encoding of this path occupies.
	/// Elements are emitted in class/instance/attribute order; a zero element
	/// is omitted unless a later element is present.
	pub fn word_count(&self) -> u8 {
		fn element_words(value: u16) -> u8 {
			if value < 256 {
				1
			} else {
				2
			}
		}

		let mut words = element_words(self.class_id);
		if self.instance_number != 0 || self.attribute_number != 0 {
			words += element_words(self.instance_number);
		}
		if self.attribute_number != 0 {
			words += element_words(self.attribute_number);
		}
		words
	}

	/// Write the padded segments, without any leading path size.
	pub fn encode_padded<T: Write>(&self, target: &mut T) -> io::Result<()> {
		fn element<T: Write>(target: &mut T, selector_8bit: u8, value: u16) -> io::Result<()> {
			if value < 256 {
				selector_8bit.write_to(target)?;
				(value as u8).write_to(target)
			} else {
				(selector_8bit | 0x01).write_to(target)?;
				0u8.write_to(target)?; /* pad */
				value.write_to(target)
			}
		}

		element(target, SEGMENT_CLASS_8BIT, self.class_id)?;
		if self.instance_number != 0 || self.attribute_number != 0 {
			element(target, SEGMENT_INSTANCE_8BIT, self.instance_number)?;
		}
		if self.attribute_number != 0 {
			element(target, SEGMENT_ATTRIBUTE_8BIT, self.attribute_number)?;
		}
		Ok(())
	}
}

impl WriteTo for CipEpath {
	/// The attribute encoding of an EPATH value: a 16-bit path size in words
	/// followed by the padded segments.
	fn write_to<T: Write>(&self, target: &mut T) -> io::Result<()> {
		(self.word_count() as u16).write_to(target)?;
		self.encode_padded(target)
	}
}

impl Size for CipEpath {
	fn size(&self) -> usize {
		2 + self.word_count() as usize * 2
	}
}

impl PaddedPath {
	/// Decode a padded request path: one path size octet in 16-bit words,
	/// then that many words of segments. An unknown or reserved segment
	/// selector is `InvalidData`; running out of input is `UnexpectedEof`.
	/// After the loop the decoded word count must equal the declared size.
	pub fn read_from<T: Read>(source: &mut T) -> io::Result<Self> {
		let path_size = u8::read_from(source)?;
		Self::read_segments(source, path_size)
	}

	/// Decode `path_size` words of padded segments, the size octet having
	/// already been consumed by the caller.
	pub fn read_segments<T: Read>(source: &mut T, path_size: u8) -> io::Result<Self> {
		let mut path = PaddedPath::default();
		let mut decoded_words = 0u32;

		while decoded_words < path_size as u32 {
			let selector = u8::read_from(source)?;
			if selector >= SEGMENT_RESERVED_BASE {
				return Err(io::Error::new(
					io::ErrorKind::InvalidData,
					format!("reserved path segment selector 0x{:02X}", selector),
				));
			}

			match selector {
				SEGMENT_CLASS_8BIT => {
					path.epath.class_id = u8::read_from(source)? as u16;
					decoded_words += 1;
				}
				SEGMENT_CLASS_16BIT => {
					let _pad = u8::read_from(source)?;
					path.epath.class_id = u16::read_from(source)?;
					decoded_words += 2;
				}
				SEGMENT_INSTANCE_8BIT => {
					path.epath.instance_number = u8::read_from(source)? as u16;
					decoded_words += 1;
				}
				SEGMENT_INSTANCE_16BIT => {
					let _pad = u8::read_from(source)?;
					path.epath.instance_number = u16::read_from(source)?;
					decoded_words += 2;
				}
				SEGMENT_ATTRIBUTE_8BIT => {
					path.epath.attribute_number = u8::read_from(source)? as u16;
					decoded_words += 1;
				}
				SEGMENT_ATTRIBUTE_16BIT => {
					let _pad = u8::read_from(source)?;
					path.epath.attribute_number = u16::read_from(source)?;
					decoded_words += 2;
				}
				SEGMENT_MEMBER_8BIT => {
					let _member = u8::read_from(source)?;
					decoded_words += 1;
				}
				SEGMENT_MEMBER_16BIT => {
					let _pad = u8::read_from(source)?;
					let _member = u16::read_from(source)?;
					decoded_words += 2;
				}
				SEGMENT_SIMPLE_DATA => {
					let data_words = u8::read_from(source)?;
					let mut data = vec![0u8; data_words as usize * 2];
					source.read_exact(&mut data)?;
					path.data_segment = Some(data);
					decoded_words += 1 + data_words as u32;
				}
				SEGMENT_PRODUCTION_INHIBIT_TIME => {
					let _inhibit_ms = u8::read_from(source)?;
					decoded_words += 1;
				}
				_ => {
					return Err(io::Error::new(
						io::ErrorKind::InvalidData,
						format!("unknown path segment selector 0x{:02X}", selector),
					));
				}
			}
		}

		if decoded_words != path_size as u32 {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!(
					"path declared {} words but decoded {}",
					path_size, decoded_words
				),
			));
		}

		Ok(path)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Cursor;

	fn encode(path: &CipEpath) -> Vec<u8> {
		let mut buf = vec![path.word_count()];
		path.encode_padded(&mut buf).unwrap();
		buf
	}

	#[test]
	fn test_epath_roundtrip() {
		let triples = [
			(0x01u16, 0x01u16, 0x01u16),
			(0x04, 0x97, 0x03),
			(0x5F, 0x0105, 0),
			(0x0201, 0x01, 0x0300),
			(0x01, 0, 0),
			(0x01, 0, 0x07),
		];
		for (class_id, instance, attribute) in triples {
			let path = CipEpath::new(class_id, instance, attribute);
			let buf = encode(&path);
			let decoded = PaddedPath::read_from(&mut Cursor::new(&buf)).unwrap();
			assert_eq!(decoded.epath, path, "triple {:?}", (class_id, instance, attribute));
		}
	}

	#[test]
	fn test_identity_attribute_path_bytes() {
		let path = CipEpath::new(0x01, 0x01, 0x01);
		assert_eq!(encode(&path), vec![0x03, 0x20, 0x01, 0x24, 0x01, 0x30, 0x01]);
	}

	#[test]
	fn test_wide_elements_use_padded_16bit_form() {
		let path = CipEpath::new(0x0201, 0x01, 0);
		assert_eq!(encode(&path), vec![0x03, 0x21, 0x00, 0x01, 0x02, 0x24, 0x01]);
	}

	#[test]
	fn test_data_segment_is_retained() {
		/* class 4, instance 151, data segment of two words */
		let buf = [0x05u8, 0x20, 0x04, 0x24, 0x97, 0x80, 0x02, 0xAA, 0xBB, 0xCC, 0xDD];
		let decoded = PaddedPath::read_from(&mut Cursor::new(&buf[..])).unwrap();
		assert_eq!(decoded.epath, CipEpath::new(4, 151, 0));
		assert_eq!(decoded.data_segment, Some(vec![0xAA, 0xBB, 0xCC, 0xDD]));
	}

	#[test]
	fn test_member_segment_is_consumed_but_dropped() {
		let buf = [0x03u8, 0x20, 0x04, 0x24, 0x97, 0x28, 0x01];
		let decoded = PaddedPath::read_from(&mut Cursor::new(&buf[..])).unwrap();
		assert_eq!(decoded.epath, CipEpath::new(4, 151, 0));
	}

	#[test]
	fn test_reserved_selector_is_invalid_data() {
		let buf = [0x01u8, 0xE0, 0x00];
		let err = PaddedPath::read_from(&mut Cursor::new(&buf[..])).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidData);
	}

	#[test]
	fn test_unknown_selector_is_invalid_data() {
		let buf = [0x01u8, 0x42, 0x00];
		let err = PaddedPath::read_from(&mut Cursor::new(&buf[..])).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidData);
	}

	#[test]
	fn test_word_count_mismatch_fails() {
		/* declares three words but encodes two */
		let buf = [0x03u8, 0x20, 0x04, 0x24, 0x97];
		assert!(PaddedPath::read_from(&mut Cursor::new(&buf[..])).is_err());
	}

	#[test]
	fn test_truncated_path_is_unexpected_eof() {
		let buf = [0x02u8, 0x20, 0x04, 0x24];
		let err = PaddedPath::read_from(&mut Cursor::new(&buf[..])).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
	}
}
