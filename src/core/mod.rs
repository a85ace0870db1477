pub mod command;
pub mod device_base;
pub mod keywords;
pub mod operator_command;
pub mod queue;
pub mod transport;
