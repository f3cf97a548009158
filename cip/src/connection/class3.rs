use crate::connection::{general_connection_configuration, Connection, InstanceType};
use crate::runtime::CipRuntime;
use crate::status::{extended_status, GeneralStatus};

/// Establish a Class 3 explicit messaging connection from the parsed
/// Forward_Open data. No sockets are opened; the traffic stays on the TCP
/// session the open arrived on, and the produced connection id remains the
/// one the originator requested.
pub fn establish(
	rt: &mut CipRuntime,
	staging: &Connection,
) -> Result<usize, (GeneralStatus, Vec<u16>)> {
	let Some(index) = rt.connections.free_explicit_member() else {
		return Err((
			GeneralStatus::ConnectionFailure,
			vec![extended_status::NO_MORE_CONNECTIONS_AVAILABLE],
		));
	};

	let mut connection = staging.clone();
	let requested_produced_id = connection.produced_connection_id;
	general_connection_configuration(rt, &mut connection);
	connection.produced_connection_id = requested_produced_id;
	connection.instance_type = InstanceType::Explicit;
	connection.sockets = [None, None];

	rt.connections.pool[index] = connection;
	rt.connections.add_active(index);
	Ok(index)
}

#[cfg(test)]
mod test {
	use crate::connection::ConnectionState;
	use crate::runtime::test_support::{forward_open_class3, test_runtime};
	use crate::status::GeneralStatus;

	#[test]
	fn test_class3_open_and_close() {
		let mut rt = test_runtime();

		let response = forward_open_class3(&mut rt, 0x0101);
		assert_eq!(response.general_status, GeneralStatus::Success);
		assert_eq!(rt.connections.active_count(), 1);

		/* the explicit connection holds no sockets */
		let index = rt.connections.active[0];
		assert_eq!(rt.connections.pool[index].sockets, [None, None]);
		assert_eq!(
			rt.connections.pool[index].state,
			ConnectionState::Established
		);
	}

	#[test]
	fn test_explicit_pool_exhaustion() {
		let mut rt = test_runtime();
		let pool_size = rt.connections.explicit_members.len();

		for serial in 0..pool_size as u16 {
			let response = forward_open_class3(&mut rt, 0x0200 + serial);
			assert_eq!(response.general_status, GeneralStatus::Success);
		}

		let response = forward_open_class3(&mut rt, 0x0300);
		assert_eq!(response.general_status, GeneralStatus::ConnectionFailure);
		assert_eq!(response.additional_status, vec![0x0113]);
	}
}
