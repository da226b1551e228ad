pub mod extent;
pub mod format;
pub mod resource_state;
