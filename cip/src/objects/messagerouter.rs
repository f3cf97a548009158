use crate::object::{CipClass, Registry};
use crate::services;
use crate::MESSAGE_ROUTER_CLASS;

/// Create the Message Router object. Instance 1 carries no attributes of its
/// own here; it exists as the end point Class 3 explicit connections bind to.
pub fn init(registry: &mut Registry) {
	let mut class = CipClass::new(MESSAGE_ROUTER_CLASS, "message router", 1, 0, 7);
	class.add_instance(1);

	class.insert_class_service(
		services::GET_ATTRIBUTE_SINGLE,
		services::get_attribute_single,
		"GetAttributeSingle",
	);

	registry.register(class);
}
