//! GSM 07.10 / 3GPP 27.010 serial multiplexer.
//!
//! Runs several logical channels over one serial link (typically a cellular
//! modem), using the basic-option framing.
//!
//! # Crate Structure
//!
//! - [`transport`]: non-blocking serial tty and Unix socket streams
//! - [`frame`]: frame codec, CRC-8 and incremental receive/transmit buffers
//! - [`mux`]: the multiplexer engine and its threaded runtime (behind the
//!   `mux` feature, on by default)

/// Re-export transport types.
pub mod transport {
    pub use cmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use cmux_frame::*;
}

/// Re-export multiplexer types (requires `mux` feature).
#[cfg(feature = "mux")]
pub mod mux {
    pub use cmux_mux::*;
}
