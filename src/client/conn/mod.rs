//! Client connection types.
//!
//! A client connection is composed of a transport, a stream, and a connection, which
//! each serve a different purpose in the connection lifecycle.
//!
//! ## Transport
//!
//! The transport establishes a stream to a remote server. Transports implement the
//! [`Transport`] trait, effectively making them a service which accepts an [`Endpoint`]
//! and returns a [`ByteStream`]. [`TcpTransport`] is the default.
//!
//! ## Stream
//!
//! A [`ByteStream`] shuffles bytes back and forth without ever blocking. When it cannot
//! make progress it reports the readiness it is waiting for.
//!
//! ## Connection
//!
//! The connection speaks HTTP/1.1 over a stream. It queues requests, pipelines them onto
//! the stream, and matches responses to them in order. It is a plain state machine which
//! is advanced by the pump of the execution context it is bound to.

pub(crate) mod connection;
pub(crate) mod dns;
pub mod stream;
pub mod transport;

pub(crate) use self::connection::{Connection, Settings, Tick};
pub use self::stream::{ByteStream, Interest, Progress};
pub use self::transport::tcp::{TcpConfig, TcpTransport};
pub use self::transport::{Endpoint, Transport};
