pub mod log_types;
pub mod log_config;
pub mod log_block;
pub mod log;
