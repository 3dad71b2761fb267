pub mod param_types;
pub mod param;
