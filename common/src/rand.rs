use std::fs::File;
use std::io::{self, Read};

pub fn rand_bytes(buf: &mut [u8]) -> io::Result<()> {
	let mut file = File::open("/dev/urandom")?;
	file.read_exact(buf)
}

pub fn rand_u16() -> io::Result<u16> {
	let mut buf = [0; 2];
	rand_bytes(&mut buf)?;

	Ok(u16::from_le_bytes(buf))
}

pub fn rand_u32() -> io::Result<u32> {
	let mut buf = [0; 4];
	rand_bytes(&mut buf)?;

	Ok(u32::from_le_bytes(buf))
}
