//! GSM 07.10 / 3GPP 27.010 multiplexer engine.
//!
//! Several logical channels share one byte-stream transport:
//! - [`Engine`] is the protocol state machine: establishment with T1
//!   retransmission, simultaneous-open arbitration, the channel pool and
//!   fair transmit notifications. It is synchronous and never blocks.
//! - [`Mux`] runs an engine on a scheduler thread and exposes blocking
//!   opens and [`MuxChannel`] handles.
//!
//! ```no_run
//! use cmux_mux::{Mux, MuxConfig, NoEvents};
//! use cmux_transport::{SerialConfig, SerialPort};
//!
//! let port = SerialPort::open("/dev/ttyUSB0", &SerialConfig::default())?;
//! let mux = Mux::start(port, MuxConfig::default(), NoEvents)?;
//! mux.open_control_channel()?;
//! let channel = mux.open_channel(1)?;
//! channel.write(b"AT\r")?;
//! # Ok::<(), cmux_mux::MuxError>(())
//! ```

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod mux;
pub mod pool;
pub mod tx;

pub use channel::MuxChannel;
pub use config::MuxConfig;
pub use dispatch::TxDispatcher;
pub use engine::{ChannelReadiness, Engine, Handoff};
pub use error::{MuxError, Result};
pub use events::{MuxEvent, MuxEvents, NoEvents};
pub use mux::Mux;
pub use pool::{ChannelPool, CHANNEL_CAPACITY};
pub use tx::{Activity, TxState};
