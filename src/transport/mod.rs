// src/transport/mod.rs
//! Reference transport
//!
//! - **HttpSender**: plain HTTP/1.1 POST to `{host}/i` over the hyper client

pub mod http_sender;

pub use http_sender::{classify_status, HttpSender, COLLECTOR_PATH};
