pub mod device;
pub mod instance;
