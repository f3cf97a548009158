pub mod connection;
pub mod cpf;
pub mod message;
pub mod object;
pub mod objects;
pub mod runtime;
pub mod security;
pub mod services;
pub mod status;
pub mod value;

pub use message::{Request, Response};
pub use object::{Attribute, AttributeFlags, CipClass, CipInstance, ObjectAddr, Registry};
pub use runtime::{
	Application, CertificateStore, CipRuntime, DeviceIdentity, InterfaceSettings, SocketDriver,
	SocketHandle, StackConfig,
};
pub use status::GeneralStatus;
pub use value::AttrValue;

/* Class codes of the objects this stack carries. */
pub const IDENTITY_CLASS: u16 = 0x01;
pub const MESSAGE_ROUTER_CLASS: u16 = 0x02;
pub const ASSEMBLY_CLASS: u16 = 0x04;
pub const CONNECTION_MANAGER_CLASS: u16 = 0x06;
pub const FILE_CLASS: u16 = 0x37;
pub const QOS_CLASS: u16 = 0x48;
pub const CIP_SECURITY_CLASS: u16 = 0x5D;
pub const EIP_SECURITY_CLASS: u16 = 0x5E;
pub const CERTIFICATE_MANAGEMENT_CLASS: u16 = 0x5F;
pub const TCP_IP_INTERFACE_CLASS: u16 = 0xF5;
pub const ETHERNET_LINK_CLASS: u16 = 0xF6;
