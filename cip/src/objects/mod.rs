pub mod assembly;
pub mod ethernetlink;
pub mod file;
pub mod identity;
pub mod messagerouter;
pub mod qos;
pub mod tcpip;
