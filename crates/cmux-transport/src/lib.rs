//! Byte-stream transports for the cmux multiplexer.
//!
//! The engine only needs a non-blocking `Read + Write` stream with a pollable
//! file descriptor. This crate provides:
//! - [`SerialStream`] over a serial tty (the usual modem link)
//! - [`SerialStream`] over Unix domain sockets (tests, local bridging)
//! - [`poll`] readiness helpers built on `poll(2)`

pub mod error;
pub mod poll;
pub mod traits;
pub mod tty;
pub mod uds;

pub use error::{Result, TransportError};
pub use poll::{poll, Interest, PollFd, Readiness};
pub use traits::{SerialStream, Transport};
pub use tty::{SerialConfig, SerialPort};
pub use uds::UnixDomainSocket;
