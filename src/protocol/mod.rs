//! Networking primitives for [TCP] over [IPv4].
//!
//! This module implements components for the Transmission Control Protocol over
//! IPv4, including IPv4/TCP header definitions, packet parsing/serialization,
//! TCP segment construction, and the protocol state machine. Nothing here
//! performs I/O or reads the clock: every operation takes the current time and
//! leaves the segments to transmit in an outbox.
//!
//! [TCP]:  https://www.rfc-editor.org/rfc/rfc793
//! [IPv4]: https://www.rfc-editor.org/rfc/rfc791

pub mod congestion;
pub mod context;
pub mod fsm;
pub mod headers;
pub mod isn;
pub mod listener;
pub mod reassembly;
pub mod seq;
pub mod tcb;
pub mod time_wait;
pub mod timer;

pub mod socket;
pub use socket::{Socket, SocketAddr};

pub mod segment;
pub use segment::TcpSegment;
