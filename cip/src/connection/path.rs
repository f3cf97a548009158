use crate::connection::{Connection, ConnectionType};
use crate::message::Request;
use crate::object::{ObjectAddr, Registry};
use crate::runtime::DeviceIdentity;
use crate::status::{extended_status, GeneralStatus};
use crate::MESSAGE_ROUTER_CLASS;

const SEGMENT_ELECTRONIC_KEY: u8 = 0x34;
const SEGMENT_PRODUCTION_INHIBIT_TIME: u8 = 0x43;
const SEGMENT_SIMPLE_DATA: u8 = 0x80;
/// Class codes at and above this are reserved; an unknown class below it is
/// an application path problem instead of a segment problem.
const RESERVED_CLASS_RANGE: u16 = 0xC8;

type PathError = (GeneralStatus, Vec<u16>);

fn failure(extended: u16) -> PathError {
	(GeneralStatus::ConnectionFailure, vec![extended])
}

/// Parse the Forward_Open connection path into the staging connection:
/// optional electronic key, optional production inhibit time, class id,
/// configuration connection point, the consumed/produced connection points
/// matching the two connection types, and trailing data segments. The bytes
/// consumed must equal the declared path size exactly.
pub fn parse_connection_path(
	connection: &mut Connection,
	request: &mut Request<'_>,
	registry: &Registry,
	device: &DeviceIdentity,
) -> Result<(), PathError> {
	let start = request.data.position() as usize;
	let all: &[u8] = *request.data.get_ref();
	if start >= all.len() {
		return Err((GeneralStatus::NotEnoughData, Vec::new()));
	}

	let path_size_words = all[start] as usize;
	let declared_bytes = path_size_words * 2;
	let available = all.len() - start - 1;
	if declared_bytes > available {
		return Err((GeneralStatus::NotEnoughData, Vec::new()));
	}
	if declared_bytes < available {
		return Err((GeneralStatus::TooMuchData, Vec::new()));
	}

	let bytes = &all[start + 1..];
	let mut offset = 0usize;
	let mut remaining_words = path_size_words as i32;

	let need = |offset: usize, count: usize| -> Result<(), PathError> {
		if offset + count > bytes.len() {
			Err((GeneralStatus::NotEnoughData, Vec::new()))
		} else {
			Ok(())
		}
	};

	if remaining_words > 0 {
		/* electronic key */
		if bytes[offset] == SEGMENT_ELECTRONIC_KEY {
			if remaining_words < 5 {
				return Err((GeneralStatus::NotEnoughData, Vec::new()));
			}
			need(offset, 10)?;
			let key_format = bytes[offset + 1];
			let vendor_id = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]);
			let device_type = u16::from_le_bytes([bytes[offset + 4], bytes[offset + 5]]);
			let product_code = u16::from_le_bytes([bytes[offset + 6], bytes[offset + 7]]);
			let major_revision = bytes[offset + 8];
			let minor_revision = bytes[offset + 9];
			offset += 10;
			remaining_words -= 5;

			check_electronic_key(
				device,
				key_format,
				vendor_id,
				device_type,
				product_code,
				major_revision,
				minor_revision,
			)
			.map_err(failure)?;
		}

		/* production inhibit time ahead of the class, non-cyclic triggers only */
		if remaining_words > 0
			&& bytes[offset] == SEGMENT_PRODUCTION_INHIBIT_TIME
			&& !connection.transport_trigger.is_cyclic()
		{
			need(offset, 2)?;
			connection.production_inhibit_time_ms = Some(bytes[offset + 1] as u16);
			offset += 2;
			remaining_words -= 1;
		}

		/* class id */
		if remaining_words <= 0 || bytes[offset] & 0xFC != 0x20 {
			return Err(failure(extended_status::INVALID_SEGMENT_TYPE_IN_PATH));
		}
		let (class_id, words) = read_padded_logical(bytes, &mut offset, &need)?;
		remaining_words -= words;
		connection.connection_path_class = class_id;
		if registry.class(class_id).is_none() {
			return Err(failure(if class_id >= RESERVED_CLASS_RANGE {
				extended_status::INVALID_SEGMENT_TYPE_IN_PATH
			} else {
				extended_status::INCONSISTENT_APPLICATION_PATH_COMBO
			}));
		}

		/* configuration connection point */
		if remaining_words > 0 && bytes[offset] & 0xFC == 0x24 {
			let (config_point, words) = read_padded_logical(bytes, &mut offset, &need)?;
			remaining_words -= words;
			if registry
				.instance(ObjectAddr::new(class_id, config_point as u16))
				.is_none()
			{
				return Err(failure(extended_status::INVALID_SEGMENT_TYPE_IN_PATH));
			}
			connection.config_point = Some(config_point as u32);
		}

		if connection.transport_trigger.transport_class() == 3 {
			/* explicit messaging: the only valid end point is Message Router
			   instance 1, with nothing after it */
			if remaining_words > 0
				|| class_id != MESSAGE_ROUTER_CLASS
				|| connection.config_point != Some(1)
			{
				return Err(failure(extended_status::INCONSISTENT_APPLICATION_PATH_COMBO));
			}
		} else {
			let consuming = connection.o_to_t_parameters.connection_type;
			let producing = connection.t_to_o_parameters.connection_type;
			let encoded_paths: &[bool] = match (consuming, producing) {
				(ConnectionType::Null, ConnectionType::Null) => &[],
				(ConnectionType::Null, _) => &[false],
				(_, ConnectionType::Null) => &[true],
				(_, _) => &[true, false],
			};

			for &is_consuming in encoded_paths {
				if remaining_words <= 0
					|| !(bytes[offset] & 0xFC == 0x24 || bytes[offset] & 0xFC == 0x2C)
				{
					return Err(failure(extended_status::INVALID_SEGMENT_TYPE_IN_PATH));
				}
				let (point, words) = read_padded_logical(bytes, &mut offset, &need)?;
				remaining_words -= words;
				if registry
					.instance(ObjectAddr::new(class_id, point as u16))
					.is_none()
				{
					return Err(failure(
						extended_status::INCONSISTENT_APPLICATION_PATH_COMBO,
					));
				}
				if is_consuming {
					connection.consuming_point = Some(point as u32);
				} else {
					connection.producing_point = Some(point as u32);
				}
			}

			/* trailing segments: inline configuration data, or a late
			   production inhibit time */
			while remaining_words > 0 {
				match bytes[offset] {
					SEGMENT_SIMPLE_DATA => {
						need(offset, 2)?;
						let data_words = bytes[offset + 1] as usize;
						need(offset + 2, data_words * 2)?;
						connection.config_data =
							Some(bytes[offset + 2..offset + 2 + data_words * 2].to_vec());
						offset += 2 + data_words * 2;
						remaining_words -= 1 + data_words as i32;
					}
					SEGMENT_PRODUCTION_INHIBIT_TIME
						if !connection.transport_trigger.is_cyclic() =>
					{
						need(offset, 2)?;
						connection.production_inhibit_time_ms = Some(bytes[offset + 1] as u16);
						offset += 2;
						remaining_words -= 1;
					}
					_ => {
						/* the extended word carries the 16-bit-word offset of
						   the offending segment within the connection path */
						let error_offset = (path_size_words as i32 - remaining_words) as u16;
						return Err((GeneralStatus::PathSegmentError, vec![error_offset]));
					}
				}
			}
		}
	}

	request.data.set_position((start + 1 + declared_bytes) as u64);
	Ok(())
}

/// Read one padded logical value: low bits of the selector give the 8-bit or
/// the padded 16-bit form.
fn read_padded_logical(
	bytes: &[u8],
	offset: &mut usize,
	need: &dyn Fn(usize, usize) -> Result<(), PathError>,
) -> Result<(u16, i32), PathError> {
	match bytes[*offset] & 0x03 {
		0 => {
			need(*offset, 2)?;
			let value = bytes[*offset + 1] as u16;
			*offset += 2;
			Ok((value, 1))
		}
		1 => {
			need(*offset, 4)?;
			let value = u16::from_le_bytes([bytes[*offset + 2], bytes[*offset + 3]]);
			*offset += 4;
			Ok((value, 2))
		}
		_ => Err(failure(extended_status::INVALID_SEGMENT_TYPE_IN_PATH)),
	}
}

/// Electronic key check, Vol. 1 3-5.5.1.1. The compatibility bit in the
/// major revision flips from exact matching to emulation matching.
fn check_electronic_key(
	device: &DeviceIdentity,
	key_format: u8,
	vendor_id: u16,
	device_type: u16,
	product_code: u16,
	major_revision: u8,
	minor_revision: u8,
) -> Result<(), u16> {
	let compatibility = major_revision & 0x80 != 0;
	let major_revision = major_revision & 0x7F;

	if key_format != 4 {
		return Err(extended_status::INVALID_SEGMENT_TYPE_IN_PATH);
	}

	if (vendor_id != device.vendor_id && vendor_id != 0)
		|| (product_code != device.product_code && product_code != 0)
	{
		return Err(extended_status::VENDOR_ID_OR_PRODUCT_CODE_ERROR);
	}

	if device_type != device.device_type && device_type != 0 {
		return Err(extended_status::DEVICE_TYPE_ERROR);
	}

	if !compatibility {
		/* an all-zero revision matches anything */
		if major_revision == 0 {
			return Ok(());
		}
		if major_revision != device.revision_major
			|| (minor_revision != device.revision_minor && minor_revision != 0)
		{
			return Err(extended_status::REVISION_MISMATCH);
		}
		Ok(())
	} else {
		if major_revision == device.revision_major
			&& minor_revision > 0
			&& minor_revision <= device.revision_minor
		{
			Ok(())
		} else {
			Err(extended_status::REVISION_MISMATCH)
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::connection::{NetworkConnectionParameters, TransportTrigger};
	use crate::runtime::test_support::test_runtime;

	fn staging_io_connection() -> Connection {
		Connection {
			transport_trigger: TransportTrigger(0x01),
			o_to_t_parameters: NetworkConnectionParameters::from_word(0x4000 | 34),
			t_to_o_parameters: NetworkConnectionParameters::from_word(0x2000 | 34),
			..Connection::default()
		}
	}

	fn parse(path: &[u8], connection: &mut Connection) -> Result<(), PathError> {
		let rt = test_runtime();
		let mut request = Request::internal(
			0x54,
			cipwire::CipEpath::new(0x06, 1, 0),
			path,
			"10.0.0.2:44818".parse().unwrap(),
		);
		parse_connection_path(connection, &mut request, &rt.registry, &rt.device)
	}

	#[test]
	fn test_exclusive_owner_path() {
		let mut connection = staging_io_connection();
		/* class 4, config 151, consuming 150, producing 100 */
		let path = [0x04, 0x20, 0x04, 0x24, 0x97, 0x2C, 0x96, 0x2C, 0x64];
		parse(&path, &mut connection).unwrap();
		assert_eq!(connection.connection_path_class, 0x04);
		assert_eq!(connection.config_point, Some(151));
		assert_eq!(connection.consuming_point, Some(150));
		assert_eq!(connection.producing_point, Some(100));
	}

	#[test]
	fn test_produce_only_path_fills_producing_point() {
		let mut connection = staging_io_connection();
		connection.o_to_t_parameters.connection_type = ConnectionType::Null;
		let path = [0x03, 0x20, 0x04, 0x24, 0x97, 0x2C, 0x64];
		parse(&path, &mut connection).unwrap();
		assert_eq!(connection.consuming_point, None);
		assert_eq!(connection.producing_point, Some(100));
	}

	#[test]
	fn test_unknown_class_in_reserved_range() {
		let mut connection = staging_io_connection();
		let path = [0x01, 0x20, 0xC9];
		let (status, extended) = parse(&path, &mut connection).unwrap_err();
		assert_eq!(status, GeneralStatus::ConnectionFailure);
		assert_eq!(extended, vec![extended_status::INVALID_SEGMENT_TYPE_IN_PATH]);
	}

	#[test]
	fn test_path_size_mismatch() {
		let mut connection = staging_io_connection();
		/* declares 5 words but carries 4 */
		let path = [0x05, 0x20, 0x04, 0x24, 0x97, 0x2C, 0x96, 0x2C, 0x64];
		let (status, _) = parse(&path, &mut connection).unwrap_err();
		assert_eq!(status, GeneralStatus::NotEnoughData);

		let mut connection = staging_io_connection();
		let path = [0x03, 0x20, 0x04, 0x24, 0x97, 0x2C, 0x96, 0x2C, 0x64];
		let (status, _) = parse(&path, &mut connection).unwrap_err();
		assert_eq!(status, GeneralStatus::TooMuchData);
	}

	#[test]
	fn test_data_segment_captures_configuration() {
		let mut connection = staging_io_connection();
		let path = [
			0x07, 0x20, 0x04, 0x24, 0x97, 0x2C, 0x96, 0x2C, 0x64, 0x80, 0x02, 0x01, 0x02,
			0x03, 0x04,
		];
		parse(&path, &mut connection).unwrap();
		assert_eq!(connection.config_data, Some(vec![1, 2, 3, 4]));
	}

	#[test]
	fn test_trailing_garbage_reports_word_offset() {
		let mut connection = staging_io_connection();
		let path = [0x05, 0x20, 0x04, 0x24, 0x97, 0x2C, 0x96, 0x2C, 0x64, 0x91, 0x00];
		let (status, extended) = parse(&path, &mut connection).unwrap_err();
		assert_eq!(status, GeneralStatus::PathSegmentError);
		assert_eq!(extended, vec![4]);
	}

	#[test]
	fn test_class3_path_must_end_at_message_router() {
		let mut connection = Connection {
			transport_trigger: TransportTrigger(0x83),
			..Connection::default()
		};
		let path = [0x02, 0x20, 0x02, 0x24, 0x01];
		parse(&path, &mut connection).unwrap();

		let mut connection = Connection {
			transport_trigger: TransportTrigger(0x83),
			..Connection::default()
		};
		let path = [0x02, 0x20, 0x02, 0x24, 0x02];
		/* message router has no instance 2 */
		assert!(parse(&path, &mut connection).is_err());
	}

	#[test]
	fn test_electronic_key_compatibility_bit() {
		let device = DeviceIdentity {
			vendor_id: 1,
			device_type: 0x0C,
			product_code: 65001,
			revision_major: 2,
			revision_minor: 3,
			..DeviceIdentity::default()
		};

		/* exact match */
		assert!(check_electronic_key(&device, 4, 1, 0x0C, 65001, 2, 3).is_ok());
		/* minor zero wildcard */
		assert!(check_electronic_key(&device, 4, 1, 0x0C, 65001, 2, 0).is_ok());
		/* compat bit: minor below device minor is acceptable */
		assert!(check_electronic_key(&device, 4, 1, 0x0C, 65001, 2 | 0x80, 2).is_ok());
		/* compat bit: minor zero is not */
		assert_eq!(
			check_electronic_key(&device, 4, 1, 0x0C, 65001, 2 | 0x80, 0),
			Err(extended_status::REVISION_MISMATCH)
		);
		/* wrong vendor */
		assert_eq!(
			check_electronic_key(&device, 4, 7, 0x0C, 65001, 2, 3),
			Err(extended_status::VENDOR_ID_OR_PRODUCT_CODE_ERROR)
		);
		/* wrong device type */
		assert_eq!(
			check_electronic_key(&device, 4, 1, 0x0E, 65001, 2, 3),
			Err(extended_status::DEVICE_TYPE_ERROR)
		);
	}
}
