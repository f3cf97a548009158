use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::message::{Request, Response};
use crate::value::AttrValue;

bitflags! {
	/// Access and callback flags of one attribute slot.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct AttributeFlags: u16 {
		const GETABLE_ALL = 0x01;
		const GETABLE_SINGLE = 0x02;
		const SETABLE = 0x04;
		/// Part of Get_Attributes_All as a fixed zero-filled region only.
		const GETABLE_ALL_DUMMY = 0x08;
		const PRE_GET = 0x10;
		const POST_GET = 0x20;
		const PRE_SET = 0x40;
		const POST_SET = 0x80;
		/// The attribute persists; a successful set marks NV storage dirty.
		const NV_DATA = 0x100;
	}
}

impl AttributeFlags {
	pub const GETABLE_SINGLE_AND_ALL: AttributeFlags =
		AttributeFlags::GETABLE_SINGLE.union(AttributeFlags::GETABLE_ALL);
	pub const SET_AND_GETABLE: AttributeFlags =
		AttributeFlags::GETABLE_SINGLE_AND_ALL.union(AttributeFlags::SETABLE);
}

/// One attribute slot: number, flags and the owned, typed value.
#[derive(Debug, Clone)]
pub struct Attribute {
	pub number: u16,
	pub flags: AttributeFlags,
	pub value: AttrValue,
}

/// Addresses one object in the registry. Instance 0 addresses the class
/// itself (its class attributes and class services).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAddr {
	pub class_code: u16,
	pub instance_number: u16,
}

impl ObjectAddr {
	pub fn new(class_code: u16, instance_number: u16) -> Self {
		ObjectAddr {
			class_code,
			instance_number,
		}
	}
}

pub type ServiceFn =
	fn(&mut crate::runtime::CipRuntime, ObjectAddr, &mut Request<'_>, &mut Response);

/// A service descriptor of a class.
#[derive(Clone, Copy)]
pub struct Service {
	pub code: u8,
	pub name: &'static str,
	pub function: ServiceFn,
}

impl std::fmt::Debug for Service {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Service")
			.field("code", &self.code)
			.field("name", &self.name)
			.finish()
	}
}

/// A get/set hook runs around the encode or decode of a single attribute.
pub type GetSetHookFn =
	fn(&mut crate::runtime::CipRuntime, ObjectAddr, attribute_number: u16, service: u8);

/// A lifecycle hook runs around Create, Delete and Reset. Pre hooks return
/// false to refuse the operation after setting a response status.
pub type LifecycleHookFn =
	fn(&mut crate::runtime::CipRuntime, ObjectAddr, &mut Request<'_>, &mut Response) -> bool;

/// The optional handler record a class supplies at registration. Absent hooks
/// short-circuit without indirection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassHooks {
	pub pre_get: Option<GetSetHookFn>,
	pub post_get: Option<GetSetHookFn>,
	pub pre_set: Option<GetSetHookFn>,
	pub post_set: Option<GetSetHookFn>,
	pub pre_create: Option<LifecycleHookFn>,
	pub post_create: Option<LifecycleHookFn>,
	pub pre_delete: Option<LifecycleHookFn>,
	pub post_delete: Option<LifecycleHookFn>,
	pub pre_reset: Option<LifecycleHookFn>,
	pub post_reset: Option<LifecycleHookFn>,
}

/// One object instance: its number, attribute slots and an optional marker
/// for dynamically created instances, which are the only deletable ones.
#[derive(Debug, Clone)]
pub struct CipInstance {
	pub instance_number: u16,
	pub attributes: Vec<Attribute>,
	pub dynamic: bool,
}

impl CipInstance {
	pub fn attribute(&self, number: u16) -> Option<&Attribute> {
		self.attributes.iter().find(|a| a.number == number)
	}

	pub fn attribute_mut(&mut self, number: u16) -> Option<&mut Attribute> {
		self.attributes.iter_mut().find(|a| a.number == number)
	}
}

fn mask_len(highest_attribute_number: u16) -> usize {
	(highest_attribute_number as usize + 1).div_ceil(8)
}

fn mask_set(mask: &mut [u8], attribute_number: u16) {
	mask[attribute_number as usize / 8] |= 1 << (attribute_number % 8);
}

fn mask_get(mask: &[u8], attribute_number: u16) -> bool {
	mask.get(attribute_number as usize / 8)
		.is_some_and(|byte| byte & (1 << (attribute_number % 8)) != 0)
}

/// The per-level attribute bitmaps: get-single, set and get-all, indexed by
/// attribute number.
#[derive(Debug, Clone, Default)]
pub struct AttributeMasks {
	get_single: Vec<u8>,
	set: Vec<u8>,
	get_all: Vec<u8>,
}

impl AttributeMasks {
	fn new(highest_attribute_number: u16) -> Self {
		let len = mask_len(highest_attribute_number);
		AttributeMasks {
			get_single: vec![0; len],
			set: vec![0; len],
			get_all: vec![0; len],
		}
	}

	fn insert(&mut self, attribute_number: u16, flags: AttributeFlags) {
		if flags.contains(AttributeFlags::GETABLE_SINGLE) {
			mask_set(&mut self.get_single, attribute_number);
		}
		if flags.contains(AttributeFlags::SETABLE) {
			mask_set(&mut self.set, attribute_number);
		}
		if flags.intersects(AttributeFlags::GETABLE_ALL | AttributeFlags::GETABLE_ALL_DUMMY) {
			mask_set(&mut self.get_all, attribute_number);
		}
	}

	pub fn is_gettable(&self, attribute_number: u16) -> bool {
		mask_get(&self.get_single, attribute_number)
	}

	pub fn is_setable(&self, attribute_number: u16) -> bool {
		mask_get(&self.set, attribute_number)
	}

	pub fn is_gettable_all(&self, attribute_number: u16) -> bool {
		mask_get(&self.get_all, attribute_number)
	}
}

/// A CIP class: identity, the class-level attribute set (what instance 0
/// answers with), its instances, and the two service tables.
#[derive(Debug)]
pub struct CipClass {
	pub code: u16,
	pub name: &'static str,
	pub revision: u16,
	pub max_instance: u16,
	pub highest_attribute_number: u16,
	pub highest_class_attribute_number: u16,
	pub class_attributes: Vec<Attribute>,
	pub instances: Vec<CipInstance>,
	pub services: Vec<Service>,
	pub class_services: Vec<Service>,
	pub hooks: ClassHooks,
	pub instance_masks: AttributeMasks,
	pub class_masks: AttributeMasks,
}

impl CipClass {
	/// Create a class with the standard class attributes 1-3 and 6-7
	/// (revision, max instance, instance count, highest class and instance
	/// attribute numbers) plus the dummy optional-attribute-list hole.
	/// `highest_class_attribute_number` is at least 7; classes with their own
	/// class attributes declare a higher bound and bind them afterwards.
	pub fn new(
		code: u16,
		name: &'static str,
		revision: u16,
		highest_attribute_number: u16,
		highest_class_attribute_number: u16,
	) -> Self {
		debug_assert!(highest_class_attribute_number >= 7);
		let mut class = CipClass {
			code,
			name,
			revision,
			max_instance: 0,
			highest_attribute_number,
			highest_class_attribute_number,
			class_attributes: Vec::new(),
			instances: Vec::new(),
			services: Vec::new(),
			class_services: Vec::new(),
			hooks: ClassHooks::default(),
			instance_masks: AttributeMasks::new(highest_attribute_number),
			class_masks: AttributeMasks::new(highest_class_attribute_number),
		};

		class.insert_class_attribute(
			1,
			AttrValue::Uint(revision),
			AttributeFlags::GETABLE_SINGLE_AND_ALL,
		);
		class.insert_class_attribute(
			2,
			AttrValue::Uint(0),
			AttributeFlags::GETABLE_SINGLE_AND_ALL,
		);
		class.insert_class_attribute(
			3,
			AttrValue::Uint(0),
			AttributeFlags::GETABLE_SINGLE_AND_ALL,
		);
		/* optional attribute list, reserved as a zero hole */
		class.insert_class_attribute(4, AttrValue::Dummy(2), AttributeFlags::GETABLE_ALL_DUMMY);
		class.insert_class_attribute(5, AttrValue::Uint(0), AttributeFlags::empty());
		class.insert_class_attribute(
			6,
			AttrValue::Uint(class.highest_class_attribute_number),
			AttributeFlags::GETABLE_SINGLE,
		);
		class.insert_class_attribute(
			7,
			AttrValue::Uint(highest_attribute_number),
			AttributeFlags::GETABLE_SINGLE,
		);

		class
	}

	pub fn number_of_instances(&self) -> u16 {
		self.instances.len() as u16
	}

	pub fn instance(&self, instance_number: u16) -> Option<&CipInstance> {
		self.instances
			.iter()
			.find(|i| i.instance_number == instance_number)
	}

	pub fn instance_mut(&mut self, instance_number: u16) -> Option<&mut CipInstance> {
		self.instances
			.iter_mut()
			.find(|i| i.instance_number == instance_number)
	}

	/// Append `count` fresh instances, each taking the smallest unused
	/// positive instance number. Returns the first new number.
	pub fn add_instances(&mut self, count: u16) -> u16 {
		let mut first_new = 0;
		for _ in 0..count {
			let mut instance_number = 1u16;
			while self
				.instances
				.iter()
				.any(|i| i.instance_number == instance_number)
			{
				instance_number += 1;
			}
			if first_new == 0 {
				first_new = instance_number;
			}
			self.instances.push(CipInstance {
				instance_number,
				attributes: Vec::new(),
				dynamic: false,
			});
		}
		self.recompute_max_instance();
		first_new
	}

	/// Add (or find) the instance with the given number.
	pub fn add_instance(&mut self, instance_number: u16) -> &mut CipInstance {
		if self.instance(instance_number).is_none() {
			self.instances.push(CipInstance {
				instance_number,
				attributes: Vec::new(),
				dynamic: false,
			});
			self.recompute_max_instance();
		}
		self.instance_mut(instance_number).unwrap()
	}

	/// Detach and drop an instance. The caller has already decided the
	/// instance is deletable.
	pub fn remove_instance(&mut self, instance_number: u16) {
		self.instances.retain(|i| i.instance_number != instance_number);
		self.recompute_max_instance();
	}

	pub fn recompute_max_instance(&mut self) {
		self.max_instance = self
			.instances
			.iter()
			.map(|i| i.instance_number)
			.max()
			.unwrap_or(0);
	}

	/// Bind an attribute slot to an instance, updating the class bitmaps.
	/// Binding past the declared highest attribute number is a programming
	/// error in the device image.
	pub fn insert_attribute(
		&mut self,
		instance_number: u16,
		attribute_number: u16,
		value: AttrValue,
		flags: AttributeFlags,
	) {
		assert!(
			attribute_number <= self.highest_attribute_number,
			"attribute {} above declared highest {} for class {:#04x} '{}'",
			attribute_number,
			self.highest_attribute_number,
			self.code,
			self.name,
		);
		self.instance_masks.insert(attribute_number, flags);
		let instance = self
			.instance_mut(instance_number)
			.expect("attribute bound to missing instance");
		instance.attributes.push(Attribute {
			number: attribute_number,
			flags,
			value,
		});
	}

	pub fn insert_class_attribute(
		&mut self,
		attribute_number: u16,
		value: AttrValue,
		flags: AttributeFlags,
	) {
		assert!(attribute_number <= self.highest_class_attribute_number);
		self.class_masks.insert(attribute_number, flags);
		self.class_attributes.push(Attribute {
			number: attribute_number,
			flags,
			value,
		});
	}

	pub fn insert_service(&mut self, code: u8, function: ServiceFn, name: &'static str) {
		self.services.push(Service {
			code,
			name,
			function,
		});
	}

	pub fn insert_class_service(&mut self, code: u8, function: ServiceFn, name: &'static str) {
		self.class_services.push(Service {
			code,
			name,
			function,
		});
	}

	/// The service table and attribute set the addressed instance level uses.
	pub fn service(&self, instance_number: u16, code: u8) -> Option<&Service> {
		let table = if instance_number == 0 {
			&self.class_services
		} else {
			&self.services
		};
		table.iter().find(|s| s.code == code)
	}

	pub fn masks(&self, instance_number: u16) -> &AttributeMasks {
		if instance_number == 0 {
			&self.class_masks
		} else {
			&self.instance_masks
		}
	}

	/// Refresh the live counters mirrored by class attributes 2 and 3.
	pub fn refresh_class_counters(&mut self) {
		let max_instance = self.max_instance;
		let number_of_instances = self.number_of_instances();
		if let Some(attribute) = self.class_attributes.iter_mut().find(|a| a.number == 2) {
			attribute.value = AttrValue::Uint(max_instance);
		}
		if let Some(attribute) = self.class_attributes.iter_mut().find(|a| a.number == 3) {
			attribute.value = AttrValue::Uint(number_of_instances);
		}
	}
}

/// The process-wide object registry, keyed by class code. Classes register
/// here at creation; registering the same class code twice is a programming
/// error.
#[derive(Debug, Default)]
pub struct Registry {
	classes: BTreeMap<u16, CipClass>,
}

impl Registry {
	pub fn new() -> Self {
		Registry::default()
	}

	pub fn register(&mut self, class: CipClass) {
		assert!(
			!self.classes.contains_key(&class.code),
			"class {:#04x} registered twice",
			class.code
		);
		self.classes.insert(class.code, class);
	}

	pub fn class(&self, class_code: u16) -> Option<&CipClass> {
		self.classes.get(&class_code)
	}

	pub fn class_count(&self) -> usize {
		self.classes.len()
	}

	pub fn class_mut(&mut self, class_code: u16) -> Option<&mut CipClass> {
		self.classes.get_mut(&class_code)
	}

	pub fn instance(&self, addr: ObjectAddr) -> Option<&CipInstance> {
		self.class(addr.class_code)?.instance(addr.instance_number)
	}

	/// Look up one attribute slot; instance 0 resolves to the class
	/// attributes.
	pub fn attribute(&self, addr: ObjectAddr, attribute_number: u16) -> Option<&Attribute> {
		let class = self.class(addr.class_code)?;
		if addr.instance_number == 0 {
			class
				.class_attributes
				.iter()
				.find(|a| a.number == attribute_number)
		} else {
			class.instance(addr.instance_number)?.attribute(attribute_number)
		}
	}

	pub fn attribute_mut(
		&mut self,
		addr: ObjectAddr,
		attribute_number: u16,
	) -> Option<&mut Attribute> {
		let class = self.class_mut(addr.class_code)?;
		if addr.instance_number == 0 {
			class
				.class_attributes
				.iter_mut()
				.find(|a| a.number == attribute_number)
		} else {
			class
				.instance_mut(addr.instance_number)?
				.attribute_mut(attribute_number)
		}
	}

	/// Typed accessors for attribute values the stack itself reads back.
	pub fn value(&self, addr: ObjectAddr, attribute_number: u16) -> Option<&AttrValue> {
		self.attribute(addr, attribute_number).map(|a| &a.value)
	}

	pub fn get_u8(&self, addr: ObjectAddr, attribute_number: u16) -> Option<u8> {
		match self.value(addr, attribute_number)? {
			AttrValue::Usint(v) | AttrValue::Byte(v) => Some(*v),
			_ => None,
		}
	}

	pub fn get_u16(&self, addr: ObjectAddr, attribute_number: u16) -> Option<u16> {
		match self.value(addr, attribute_number)? {
			AttrValue::Uint(v) | AttrValue::Word(v) => Some(*v),
			_ => None,
		}
	}

	pub fn get_u32(&self, addr: ObjectAddr, attribute_number: u16) -> Option<u32> {
		match self.value(addr, attribute_number)? {
			AttrValue::Udint(v) | AttrValue::Dword(v) => Some(*v),
			_ => None,
		}
	}

	pub fn set_value(&mut self, addr: ObjectAddr, attribute_number: u16, value: AttrValue) {
		if let Some(attribute) = self.attribute_mut(addr, attribute_number) {
			attribute.value = value;
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_add_instances_picks_smallest_free_number() {
		let mut class = CipClass::new(0x04, "assembly", 2, 4, 7);
		class.add_instance(100);
		class.add_instance(150);
		let first = class.add_instances(1);
		assert_eq!(first, 1);
		let second = class.add_instances(1);
		assert_eq!(second, 2);
		assert_eq!(class.max_instance, 150);
		assert_eq!(class.number_of_instances(), 4);
	}

	#[test]
	fn test_remove_instance_recomputes_max() {
		let mut class = CipClass::new(0x5F, "certificate management", 1, 5, 10);
		class.add_instance(1);
		class.add_instance(2);
		class.add_instance(3);
		class.remove_instance(3);
		assert_eq!(class.max_instance, 2);
		assert_eq!(class.number_of_instances(), 2);
	}

	#[test]
	fn test_masks_follow_flags() {
		let mut class = CipClass::new(0xF5, "TCP/IP interface", 4, 13, 7);
		class.add_instance(1);
		class.insert_attribute(1, 1, AttrValue::Dword(1), AttributeFlags::GETABLE_SINGLE_AND_ALL);
		class.insert_attribute(
			1,
			13,
			AttrValue::Uint(120),
			AttributeFlags::GETABLE_SINGLE | AttributeFlags::SETABLE,
		);
		class.insert_attribute(1, 7, AttrValue::Dummy(6), AttributeFlags::GETABLE_ALL_DUMMY);

		let masks = class.masks(1);
		assert!(masks.is_gettable(1));
		assert!(masks.is_gettable_all(1));
		assert!(!masks.is_setable(1));
		assert!(masks.is_setable(13));
		assert!(!masks.is_gettable_all(13));
		assert!(masks.is_gettable_all(7));
		assert!(!masks.is_gettable(7));
	}

	#[test]
	#[should_panic]
	fn test_duplicate_class_registration_panics() {
		let mut registry = Registry::new();
		registry.register(CipClass::new(0x01, "identity", 1, 7, 7));
		registry.register(CipClass::new(0x01, "identity again", 1, 7, 7));
	}

	#[test]
	#[should_panic]
	fn test_attribute_above_highest_panics() {
		let mut class = CipClass::new(0x48, "QoS", 1, 8, 7);
		class.add_instance(1);
		class.insert_attribute(1, 9, AttrValue::Usint(0), AttributeFlags::GETABLE_SINGLE);
	}
}
