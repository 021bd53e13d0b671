pub mod managed_instance;
pub mod usage_event;
