//! Request execution pipeline.
//!
//! Ties the core building blocks together: the [`executor`] runs one request
//! end to end, the [`dispatcher`] schedules many, and [`service`] is the
//! entry point used by the API layer.

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod locking;
pub mod service;
pub mod store;
