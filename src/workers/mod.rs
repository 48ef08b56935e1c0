pub mod args;
pub mod endpoint;
