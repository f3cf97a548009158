use crate::connection::{
	Connection, ConnectionManager, ConnectionState, ConnectionType, InstanceType,
};
use crate::status::extended_status;

/// A connection point in the request either names the slot's assembly or was
/// absent from the path, in which case the slot's pre-wired value applies.
fn point_matches(requested: Option<u32>, slot_point: u32) -> bool {
	requested.map_or(true, |point| point == slot_point)
}

impl ConnectionManager {
	/// Find the application slot and free connection for an I/O
	/// Forward_Open, trying exclusive owner, then input only, then listen
	/// only. On success the staging connection's instance type is set and
	/// the arena index of the reserved slot member returned; on failure the
	/// extended status describing why.
	pub fn find_io_slot(&self, connection: &mut Connection) -> Result<usize, u16> {
		if let Some(result) = self.find_exclusive_owner(connection) {
			connection.instance_type = InstanceType::IoExclusiveOwner;
			return result;
		}
		if let Some(result) = self.find_input_only(connection) {
			connection.instance_type = InstanceType::IoInputOnly;
			return result;
		}
		if let Some(result) = self.find_listen_only(connection) {
			connection.instance_type = InstanceType::IoListenOnly;
			return result;
		}
		Err(extended_status::INCONSISTENT_APPLICATION_PATH_COMBO)
	}

	/// Exclusive owner slots require the full triple. A second owner for an
	/// already-consumed output point is an ownership conflict.
	fn find_exclusive_owner(&self, connection: &Connection) -> Option<Result<usize, u16>> {
		for slot in self.exclusive_owner_slots.iter() {
			if connection.consuming_point != Some(slot.output)
				|| connection.producing_point != Some(slot.input)
				|| connection.config_point != Some(slot.config)
			{
				continue;
			}

			if self.connected_output_assembly(slot.output).is_some() {
				return Some(Err(extended_status::OWNERSHIP_CONFLICT));
			}

			return Some(match self.free_member(slot.members.as_slice()) {
				Some(index) => Ok(index),
				None => Err(extended_status::TARGET_OBJECT_OUT_OF_CONNECTIONS),
			});
		}
		None
	}

	/// Input only slots match on the output point; the input and
	/// configuration points must then agree with the pre-wired triple.
	fn find_input_only(&self, connection: &Connection) -> Option<Result<usize, u16>> {
		for slot in self.input_only_slots.iter() {
			if connection.consuming_point != Some(slot.output) {
				continue;
			}
			if !point_matches(connection.producing_point, slot.input) {
				return Some(Err(extended_status::INVALID_PRODUCING_APPLICATION_PATH));
			}
			if !point_matches(connection.config_point, slot.config) {
				return Some(Err(
					extended_status::INCONSISTENT_APPLICATION_PATH_COMBO,
				));
			}

			return Some(match self.free_member(slot.members.as_slice()) {
				Some(index) => Ok(index),
				None => Err(extended_status::TARGET_OBJECT_OUT_OF_CONNECTIONS),
			});
		}
		None
	}

	/// Listen only connections must be multicast consumers of an input point
	/// somebody else already produces. The output point may be absent from
	/// the path; the slot's heartbeat assembly stands in for it.
	fn find_listen_only(&self, connection: &Connection) -> Option<Result<usize, u16>> {
		if connection.t_to_o_parameters.connection_type != ConnectionType::Multicast {
			return Some(Err(
				extended_status::NON_LISTEN_ONLY_CONNECTION_NOT_OPENED,
			));
		}

		for slot in self.listen_only_slots.iter() {
			if !point_matches(connection.consuming_point, slot.output) {
				continue;
			}
			if !point_matches(connection.producing_point, slot.input) {
				return Some(Err(extended_status::INVALID_PRODUCING_APPLICATION_PATH));
			}
			if !point_matches(connection.config_point, slot.config) {
				return Some(Err(
					extended_status::INCONSISTENT_APPLICATION_PATH_COMBO,
				));
			}

			if self.existing_producer_multicast(slot.input).is_none() {
				return Some(Err(
					extended_status::NON_LISTEN_ONLY_CONNECTION_NOT_OPENED,
				));
			}

			return Some(match self.free_member(slot.members.as_slice()) {
				Some(index) => Ok(index),
				None => Err(extended_status::TARGET_OBJECT_OUT_OF_CONNECTIONS),
			});
		}
		None
	}

	fn free_member(&self, members: &[usize]) -> Option<usize> {
		members
			.iter()
			.copied()
			.find(|&i| self.pool[i].state == ConnectionState::NonExistent)
	}
}
