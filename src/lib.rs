//! Hyperpipe
//!
//! An embeddable HTTP/1.1 client engine: pipelined requests over a bounded pool of
//! reusable connections, with transparent retries, redirects, Basic authentication and
//! `Expect: 100-continue`.
//!
//! The engine is driven by its callers. Requests are submitted under an execution
//! context, and the context is pumped to move bytes; see [`client`] for the details.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod body;
pub use body::Body;
pub mod client;
pub use client::Client;
pub mod message;
pub use message::{Request, Response};

/// A boxed error which can be sent between threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
