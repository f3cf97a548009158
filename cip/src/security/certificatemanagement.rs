use slog::{info, warn};

use cipwire::{CipEpath, CipShortString, ReadFrom};

use crate::message::{Request, Response};
use crate::object::{AttributeFlags, CipClass, ObjectAddr};
use crate::objects::file;
use crate::runtime::{CipRuntime, CsrFields};
use crate::services;
use crate::status::GeneralStatus;
use crate::value::{AttrValue, CertificateReference};
use crate::{CERTIFICATE_MANAGEMENT_CLASS, FILE_CLASS};

pub const SERVICE_CREATE_CSR: u8 = 0x4B;
pub const SERVICE_VERIFY_CERTIFICATE: u8 = 0x4C;

/* Instance state values, Vol. 8 5-5.4.2. */
pub const STATE_NON_EXISTENT: u8 = 0;
pub const STATE_CREATED: u8 = 1;
pub const STATE_CONFIGURING: u8 = 2;
pub const STATE_VERIFIED: u8 = 3;
pub const STATE_INVALID: u8 = 4;

/* Certificate state values of attributes 3 and 4. */
pub const CERTIFICATE_NOT_VERIFIED: u8 = 0;
pub const CERTIFICATE_VERIFIED: u8 = 1;
pub const CERTIFICATE_INVALID: u8 = 2;

/* Class attribute 8 capability flags: push and pull model. */
const CAPABILITY_PUSH_MODEL: u32 = 0x01;
const CAPABILITY_PULL_MODEL: u32 = 0x02;
/* Class attribute 10: PEM encoding supported. */
const ENCODING_FLAG_PEM: u32 = 0x01;

const DEFAULT_DEVICE_CERTIFICATE_INSTANCE: u16 = 1;

/// Create the Certificate Management object. Instance 1 is the static,
/// non-deletable default device certificate; further instances come and go
/// through the class Create and Delete services.
pub fn init(rt: &mut CipRuntime) {
	let device_file = file::create_file_instance(
		&mut rt.registry,
		"Default Device Certificate",
		Vec::new(),
	);
	let ca_file =
		file::create_file_instance(&mut rt.registry, "Default CA Certificate", Vec::new());

	let mut class =
		CipClass::new(CERTIFICATE_MANAGEMENT_CLASS, "certificate management", 1, 5, 10);

	class.insert_class_attribute(
		8,
		AttrValue::Dword(CAPABILITY_PUSH_MODEL | CAPABILITY_PULL_MODEL),
		AttributeFlags::GETABLE_SINGLE,
	);
	class.insert_class_attribute(
		9,
		AttrValue::CertificateList(Vec::new()),
		AttributeFlags::GETABLE_SINGLE.union(AttributeFlags::PRE_GET),
	);
	class.insert_class_attribute(
		10,
		AttrValue::Dword(ENCODING_FLAG_PEM),
		AttributeFlags::GETABLE_SINGLE,
	);

	class.add_instance(DEFAULT_DEVICE_CERTIFICATE_INSTANCE);
	bind_instance_attributes(
		&mut class,
		DEFAULT_DEVICE_CERTIFICATE_INSTANCE,
		CipShortString::from_str("Default Device Certificate"),
		CertificateReference {
			status: CERTIFICATE_NOT_VERIFIED,
			path: Some(CipEpath::new(FILE_CLASS, device_file, 0)),
		},
		CertificateReference {
			status: CERTIFICATE_NOT_VERIFIED,
			path: Some(CipEpath::new(FILE_CLASS, ca_file, 0)),
		},
	);

	class.insert_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);
	class.insert_service(
		services::GET_ATTRIBUTE_ALL,
		services::get_attribute_all,
		"GetAttributeAll",
	);
	class.insert_service(
		services::SET_ATTRIBUTE_SINGLE,
		services::set_attribute_single,
		"SetAttributeSingle",
	);
	class.insert_service(services::DELETE, services::delete, "Delete");
	class.insert_service(SERVICE_CREATE_CSR, create_csr, "CreateCSR");
	class.insert_service(
		SERVICE_VERIFY_CERTIFICATE,
		verify_certificate,
		"VerifyCertificate",
	);
	class.insert_class_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);
	class.insert_class_service(
		services::GET_ATTRIBUTE_ALL,
		services::get_attribute_all,
		"GetAttributeAll",
	);
	class.insert_class_service(services::CREATE, services::create, "Create");

	class.hooks.pre_get = Some(pre_get);
	class.hooks.pre_create = Some(pre_create);
	class.hooks.post_create = Some(post_create);
	class.hooks.pre_delete = Some(pre_delete);

	rt.registry.register(class);
}

fn bind_instance_attributes(
	class: &mut CipClass,
	instance_number: u16,
	name: CipShortString,
	device_certificate: CertificateReference,
	ca_certificate: CertificateReference,
) {
	class.insert_attribute(
		instance_number,
		1,
		AttrValue::ShortString(name),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		instance_number,
		2,
		AttrValue::Usint(STATE_CREATED),
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
	class.insert_attribute(
		instance_number,
		3,
		AttrValue::Certificate(device_certificate),
		AttributeFlags::SET_AND_GETABLE,
	);
	class.insert_attribute(
		instance_number,
		4,
		AttrValue::Certificate(ca_certificate),
		AttributeFlags::SET_AND_GETABLE,
	);
	class.insert_attribute(
		instance_number,
		5,
		AttrValue::Usint(0), /* PEM */
		AttributeFlags::GETABLE_SINGLE_AND_ALL,
	);
}

/// Recompute the class certificate list (class attribute 9) by walking the
/// instance chain and emitting each instance's name and EPATH.
fn pre_get(rt: &mut CipRuntime, addr: ObjectAddr, attribute_number: u16, _service: u8) {
	if addr.instance_number != 0 || attribute_number != 9 {
		return;
	}

	let entries: Vec<(CipShortString, CipEpath)> = rt
		.registry
		.class(CERTIFICATE_MANAGEMENT_CLASS)
		.map(|class| {
			class
				.instances
				.iter()
				.map(|instance| {
					let name = match instance.attribute(1).map(|a| &a.value) {
						Some(AttrValue::ShortString(name)) => name.clone(),
						_ => CipShortString::default(),
					};
					(
						name,
						CipEpath::new(
							CERTIFICATE_MANAGEMENT_CLASS,
							instance.instance_number,
							0,
						),
					)
				})
				.collect()
		})
		.unwrap_or_default();

	rt.set_attr_value(
		CERTIFICATE_MANAGEMENT_CLASS,
		0,
		9,
		AttrValue::CertificateList(entries),
	);
}

/// Create carries the new instance's name as a ShortString; the declared
/// length must fit inside the remaining payload.
fn pre_create(
	_rt: &mut CipRuntime,
	_addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) -> bool {
	let remaining = request.remaining();
	if remaining == 0 {
		response.set_status(GeneralStatus::NotEnoughData);
		return false;
	}

	let declared = request.data.get_ref()[request.data.position() as usize] as usize;
	if declared + 1 > remaining {
		response.set_status(GeneralStatus::NotEnoughData);
		return false;
	}
	true
}

/// Bind the fresh instance's attributes and append the allocated instance
/// number to the reply.
fn post_create(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) -> bool {
	let name = CipShortString::read_from(&mut request.data).unwrap_or_default();

	if let Some(class) = rt.registry.class_mut(CERTIFICATE_MANAGEMENT_CLASS) {
		bind_instance_attributes(
			class,
			addr.instance_number,
			name,
			CertificateReference::default(),
			CertificateReference::default(),
		);
	}

	let _ = response.message.push_u16_le(addr.instance_number);
	info!(rt.logger, "certificate management instance created";
		"instance" => addr.instance_number);
	true
}

/// The static instance 1 never goes away; dynamically created instances do.
fn pre_delete(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	_request: &mut Request<'_>,
	response: &mut Response,
) -> bool {
	let deletable = addr.instance_number != DEFAULT_DEVICE_CERTIFICATE_INSTANCE
		&& rt
			.registry
			.instance(addr)
			.map(|instance| instance.dynamic)
			.unwrap_or(false);
	if !deletable {
		response.set_status(GeneralStatus::InstanceNotDeletable);
	}
	deletable
}

/// Create_CSR: eight ShortString subject fields; a non-empty country must be
/// a two-character ISO code. The CSR materialises as a File Object instance
/// whose EPATH the reply carries, and the instance enters Configuring.
fn create_csr(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	if addr.instance_number == DEFAULT_DEVICE_CERTIFICATE_INSTANCE {
		response.set_status(GeneralStatus::ObjectStateConflict);
		return;
	}

	let mut strings: Vec<CipShortString> = Vec::with_capacity(8);
	for _ in 0..8 {
		match CipShortString::read_from(&mut request.data) {
			Ok(string) => strings.push(string),
			Err(_) => {
				response.set_status(GeneralStatus::NotEnoughData);
				return;
			}
		}
	}

	/* the country field is an ISO 3166 code or empty */
	if strings[5].len() != 2 && !strings[5].is_empty() {
		response.set_status(GeneralStatus::InvalidParameter);
		return;
	}

	let fields = CsrFields {
		common_name: strings[0].clone(),
		organization: strings[1].clone(),
		organizational_unit: strings[2].clone(),
		locality: strings[3].clone(),
		state: strings[4].clone(),
		country: strings[5].clone(),
		email: strings[6].clone(),
		serial_number: strings[7].clone(),
	};

	let csr = rt.certificates.generate_csr(&fields);
	let file_instance = file::create_file_instance(&mut rt.registry, "CSR", csr);
	let path = CipEpath::new(FILE_CLASS, file_instance, 0);

	let _ = response.message.push_u8(path.word_count());
	let _ = path.encode_padded(&mut response.message);

	rt.set_attr_value(
		CERTIFICATE_MANAGEMENT_CLASS,
		addr.instance_number,
		2,
		AttrValue::Usint(STATE_CONFIGURING),
	);
	info!(rt.logger, "CSR created"; "file_instance" => file_instance);
}

/// Verify_Certificate: verify the indicated certificate and every one
/// reached from it through the chain; update the certificate status fields
/// and the instance state accordingly.
fn verify_certificate(
	rt: &mut CipRuntime,
	addr: ObjectAddr,
	request: &mut Request<'_>,
	response: &mut Response,
) {
	response.start(request.service, GeneralStatus::Success);

	let Ok(selector) = u8::read_from(&mut request.data) else {
		response.set_status(GeneralStatus::NotEnoughData);
		return;
	};
	/* 0 selects the device certificate, 1 the CA certificate */
	if selector > 1 {
		response.set_status(GeneralStatus::InvalidParameter);
		return;
	}

	/* verifying the device certificate walks up through the CA */
	let attribute_numbers: &[u16] = if selector == 0 { &[3, 4] } else { &[4] };

	let mut all_verified = true;
	for &attribute_number in attribute_numbers {
		let path = match rt.registry.value(addr, attribute_number) {
			Some(AttrValue::Certificate(certificate)) => certificate.path,
			_ => None,
		};
		let verified = match path {
			Some(path) => rt.certificates.verify_certificate(&path),
			None => false,
		};

		let status = if verified {
			CERTIFICATE_VERIFIED
		} else {
			CERTIFICATE_INVALID
		};
		if let Some(AttrValue::Certificate(certificate)) =
			rt.registry.attribute_mut(addr, attribute_number).map(|a| &mut a.value)
		{
			certificate.status = status;
		}
		all_verified &= verified;
	}

	let both_verified = [3u16, 4].iter().all(|&number| {
		matches!(
			rt.registry.value(addr, number),
			Some(AttrValue::Certificate(certificate))
				if certificate.status == CERTIFICATE_VERIFIED
		)
	});

	if !all_verified {
		warn!(rt.logger, "certificate verification failed";
			"instance" => addr.instance_number);
		rt.set_attr_value(
			CERTIFICATE_MANAGEMENT_CLASS,
			addr.instance_number,
			2,
			AttrValue::Usint(STATE_INVALID),
		);
		response.set_status(GeneralStatus::VerificationFailed);
	} else if both_verified {
		rt.set_attr_value(
			CERTIFICATE_MANAGEMENT_CLASS,
			addr.instance_number,
			2,
			AttrValue::Usint(STATE_VERIFIED),
		);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::runtime::test_support::{explicit_request, test_runtime};

	fn create_instance(rt: &mut CipRuntime, name: &str) -> u16 {
		let mut bytes = vec![services::CREATE, 0x01, 0x20, 0x5F];
		bytes.push(name.len() as u8);
		bytes.extend_from_slice(name.as_bytes());
		let response = explicit_request(rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::Success);
		u16::from_le_bytes([
			response.message.as_slice()[0],
			response.message.as_slice()[1],
		])
	}

	#[test]
	fn test_create_allocates_smallest_free_instance() {
		let mut rt = test_runtime();
		let first = create_instance(&mut rt, "controller 1");
		let second = create_instance(&mut rt, "controller 2");
		assert_eq!(first, 2);
		assert_eq!(second, 3);
	}

	#[test]
	fn test_create_with_truncated_name_is_refused() {
		let mut rt = test_runtime();
		/* declares 10 name characters, delivers 2 */
		let bytes = vec![services::CREATE, 0x01, 0x20, 0x5F, 0x0A, b'h', b'i'];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::NotEnoughData);
	}

	#[test]
	fn test_instance_one_is_not_deletable() {
		let mut rt = test_runtime();
		let bytes = [services::DELETE, 0x02, 0x20, 0x5F, 0x24, 0x01];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::InstanceNotDeletable);
	}

	#[test]
	fn test_dynamic_instance_delete() {
		let mut rt = test_runtime();
		let instance = create_instance(&mut rt, "scrap");
		let bytes = [services::DELETE, 0x02, 0x20, 0x5F, 0x24, instance as u8];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::Success);

		/* gone now */
		let bytes = [0x0E, 0x03, 0x20, 0x5F, 0x24, instance as u8, 0x30, 0x01];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::PathDestinationUnknown);
	}

	#[test]
	fn test_create_csr_rejects_instance_one_and_bad_country() {
		let mut rt = test_runtime();

		let bytes = [SERVICE_CREATE_CSR, 0x02, 0x20, 0x5F, 0x24, 0x01];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::ObjectStateConflict);

		let instance = create_instance(&mut rt, "plc");
		let mut bytes = vec![SERVICE_CREATE_CSR, 0x02, 0x20, 0x5F, 0x24, instance as u8];
		/* seven empty fields with a bad one-character country in between */
		for field in 0..8u8 {
			if field == 5 {
				bytes.extend_from_slice(&[0x01, b'A']);
			} else {
				bytes.push(0x00);
			}
		}
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::InvalidParameter);
	}

	#[test]
	fn test_create_csr_returns_file_path_and_configures() {
		let mut rt = test_runtime();
		let instance = create_instance(&mut rt, "plc");

		let mut bytes = vec![SERVICE_CREATE_CSR, 0x02, 0x20, 0x5F, 0x24, instance as u8];
		bytes.extend_from_slice(&[0x02, b'i', b'o']); /* common name */
		for _ in 0..4 {
			bytes.push(0x00);
		}
		bytes.extend_from_slice(&[0x02, b'A', b'T']); /* country */
		bytes.push(0x00); /* email */
		bytes.push(0x00); /* serial */
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::Success);

		/* the reply is the EPATH of a file object instance */
		let body = response.message.as_slice();
		assert_eq!(body[0], 0x02);
		assert_eq!(body[1..3], [0x20, 0x37]);

		let state = rt.attr_u8(CERTIFICATE_MANAGEMENT_CLASS, instance, 2);
		assert_eq!(state, Some(STATE_CONFIGURING));
	}

	#[test]
	fn test_certificate_list_walks_instances() {
		let mut rt = test_runtime();
		create_instance(&mut rt, "plc");

		let bytes = [0x0E, 0x03, 0x20, 0x5F, 0x24, 0x00, 0x30, 0x09];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::Success);
		/* two instances: the static one and the created one */
		assert_eq!(response.message.as_slice()[0], 2);
	}

	#[test]
	fn test_verify_certificate_updates_status() {
		let mut rt = test_runtime();

		let bytes = [
			SERVICE_VERIFY_CERTIFICATE,
			0x02,
			0x20,
			0x5F,
			0x24,
			0x01,
			0x00,
		];
		let response = explicit_request(&mut rt, &bytes);
		assert_eq!(response.general_status, GeneralStatus::Success);

		let state = rt.attr_u8(CERTIFICATE_MANAGEMENT_CLASS, 1, 2);
		assert_eq!(state, Some(STATE_VERIFIED));
	}
}
