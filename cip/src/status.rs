use cipwire::int_enum;

int_enum! {
	/// CIP general status codes, Vol. 1 Appendix B.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum GeneralStatus: u8 {
		Success = 0x00,
		ConnectionFailure = 0x01,
		ResourceUnavailable = 0x02,
		PathSegmentError = 0x04,
		PathDestinationUnknown = 0x05,
		PartialTransfer = 0x06,
		ServiceNotSupported = 0x08,
		InvalidAttributeValue = 0x09,
		AttributeListError = 0x0A,
		ObjectStateConflict = 0x0C,
		AttributeNotSetable = 0x0E,
		PrivilegeViolation = 0x0F,
		NotEnoughData = 0x13,
		AttributeNotSupported = 0x14,
		TooMuchData = 0x15,
		ObjectDoesNotExist = 0x16,
		InvalidParameter = 0x20,
		AttributeNotGettable = 0x2C,
		InstanceNotDeletable = 0x2D,
		/// Object-specific: certificate verification failed (Vol. 8 5-5.8.1),
		/// shares the code with CIP Security "no orphan objects" (Vol. 8 5-3.7.4).
		VerificationFailed = 0xD0,
	}
}

/// Extended status words carried with `ConnectionFailure` replies of the
/// connection manager, Vol. 1 Table 3-5.33.
pub mod extended_status {
	pub const CONNECTION_IN_USE: u16 = 0x0100;
	pub const TRANSPORT_TRIGGER_NOT_SUPPORTED: u16 = 0x0103;
	pub const OWNERSHIP_CONFLICT: u16 = 0x0106;
	pub const TARGET_CONNECTION_NOT_FOUND: u16 = 0x0107;
	pub const RPI_NOT_SUPPORTED: u16 = 0x0111;
	pub const RPI_VALUES_NOT_ACCEPTABLE: u16 = 0x0112;
	pub const NO_MORE_CONNECTIONS_AVAILABLE: u16 = 0x0113;
	pub const VENDOR_ID_OR_PRODUCT_CODE_ERROR: u16 = 0x0114;
	pub const DEVICE_TYPE_ERROR: u16 = 0x0115;
	pub const REVISION_MISMATCH: u16 = 0x0116;
	pub const NON_LISTEN_ONLY_CONNECTION_NOT_OPENED: u16 = 0x0119;
	pub const TARGET_OBJECT_OUT_OF_CONNECTIONS: u16 = 0x011A;
	pub const INVALID_O_TO_T_CONNECTION_TYPE: u16 = 0x0123;
	pub const INVALID_T_TO_O_CONNECTION_TYPE: u16 = 0x0124;
	pub const INVALID_O_TO_T_CONNECTION_SIZE: u16 = 0x0127;
	pub const INVALID_T_TO_O_CONNECTION_SIZE: u16 = 0x0128;
	pub const INVALID_CONFIGURATION_APPLICATION_PATH: u16 = 0x0129;
	pub const INVALID_CONSUMING_APPLICATION_PATH: u16 = 0x012A;
	pub const INVALID_PRODUCING_APPLICATION_PATH: u16 = 0x012B;
	pub const INCONSISTENT_APPLICATION_PATH_COMBO: u16 = 0x012F;
	pub const MISMATCHED_T_TO_O_FIX_VAR: u16 = 0x0135;
	pub const MISMATCHED_T_TO_O_PRIORITY: u16 = 0x0136;
	pub const MISMATCHED_TRANSPORT_CLASS: u16 = 0x0137;
	pub const MISMATCHED_T_TO_O_PRODUCTION_TRIGGER: u16 = 0x0138;
	pub const MISMATCHED_T_TO_O_PRODUCTION_INHIBIT_TIME: u16 = 0x0139;
	pub const INVALID_SEGMENT_TYPE_IN_PATH: u16 = 0x0315;
}
