//! A user-space implementation of the Transmission Control Protocol (TCP) over
//! IPv4, based on [RFC 793] and [RFC 9293].
//!
//! The [protocol] module holds the pure state machine: header codecs, the
//! transmission control block, listeners, and `TIME_WAIT` records. The [net]
//! module drives it: inbound frames are demultiplexed to their connection,
//! timers fire on a background thread, and segments leave through a
//! [net::transport::Transport] supplied by the embedder.
//!
//! This project is experimental and not intended for production use.
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793
//! [RFC 9293]: https://www.rfc-editor.org/rfc/rfc9293

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod log;

pub mod config;
pub use config::Config;

pub mod stats;
pub use stats::StatsSnapshot;

pub mod protocol;

pub mod net;
pub use net::{Stack, TcpListener, TcpStream};

pub mod error;
pub use error::{Error, HeaderError, ParseError, Result};
