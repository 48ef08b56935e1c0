pub mod config;
pub mod connection;
pub mod engine;
pub mod history;
pub mod pipeline;
pub mod signal;
pub mod transfer;
