//! Provides networking functionality for the Transmission Control Protocol:
//! demultiplexing, timers, and the [std::net]-like surface, on top of a
//! pluggable [transport::Transport].
//!
//! [std::net]: https://doc.rust-lang.org/std/net/index.html

pub mod demux;
pub mod loopback;
pub mod timers;
pub mod transport;

mod connection;
mod interface;
mod stack;

pub use interface::{TcpListener, TcpStream};
pub use stack::{CongestionFactory, Stack};
