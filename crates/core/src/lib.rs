pub mod command;
pub mod config;
pub mod error;
pub mod locking;
pub mod markers;
pub mod process;
pub mod request;
pub mod types;
