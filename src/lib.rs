//! dnsgate - DNS forwarding core of a transparent proxy.
//!
//! Intercepted queries are answered from a cache or forwarded to the
//! upstream chosen for them over UDP, TCP, or UDP with TCP fallback.

pub mod anyfrom;
pub mod cache;
pub mod config;
pub mod context;
pub mod controller;
pub mod dial;
pub mod dns;
pub mod error;
pub mod forwarder;
pub mod pool;
pub mod server;
pub mod stats;
pub mod stream;
pub mod task_pool;
pub mod timeout;
pub mod upstream;

pub use error::{Error, ForwardError, Result};
