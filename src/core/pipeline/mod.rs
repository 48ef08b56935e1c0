pub mod frame;
pub mod receiver;
pub mod sender;
