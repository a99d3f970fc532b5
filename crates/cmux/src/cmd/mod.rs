use clap::{Args, Subcommand, ValueEnum};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cmux_mux::MuxConfig;
use cmux_transport::{SerialConfig, SerialPort, SerialStream, UnixDomainSocket};

use crate::exit::{transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod frame;
pub mod listen;
pub mod open;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open the control channel and data channels as initiator.
    Open(OpenArgs),
    /// Answer a peer as responder and print what it does.
    Listen(ListenArgs),
    /// Encode or decode a single frame.
    Frame(FrameArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Open(args) => open::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Frame(args) => frame::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Link and timer settings shared by `open` and `listen`.
#[derive(Args, Debug)]
pub struct LinkArgs {
    /// Serial line speed.
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
    /// Acknowledgement timer (e.g. 300ms, 1s).
    #[arg(long, default_value = "300ms")]
    pub t1: String,
    /// Retransmissions before an establishment fails.
    #[arg(long, default_value_t = 3)]
    pub retransmits: u32,
}

impl LinkArgs {
    pub fn mux_config(&self) -> CliResult<MuxConfig> {
        Ok(MuxConfig {
            t1: parse_duration(&self.t1)?,
            retransmits: self.retransmits,
            ..MuxConfig::default()
        })
    }
}

#[derive(Args, Debug)]
pub struct OpenArgs {
    /// Serial device or Unix socket to connect to.
    pub path: PathBuf,
    #[command(flatten)]
    pub link: LinkArgs,
    /// Data channels to open (comma-separated DLCIs).
    #[arg(long, value_delimiter = ',', default_value = "1")]
    pub channels: Vec<u8>,
    /// Send this string on every opened channel.
    #[arg(long)]
    pub send: Option<String>,
    /// How long to wait for replies after sending (e.g. 2s, 500ms).
    #[arg(long, default_value = "1s", requires = "send")]
    pub wait: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Serial device to answer on.
    #[arg(required_unless_present = "bind", conflicts_with = "bind")]
    pub path: Option<PathBuf>,
    /// Bind a Unix socket and answer the first connection instead.
    #[arg(long, value_name = "SOCKET")]
    pub bind: Option<PathBuf>,
    #[command(flatten)]
    pub link: LinkArgs,
    /// Write received data back on the channel it arrived on.
    #[arg(long)]
    pub echo: bool,
    /// Exit after N events.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum FrameKindArg {
    Sabm,
    Ua,
    Dm,
    Disc,
    Uih,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum RoleArg {
    Initiator,
    Responder,
}

#[derive(Args, Debug)]
pub struct FrameArgs {
    /// Decode this hex string instead of encoding.
    #[arg(long, value_name = "HEX", conflicts_with_all = ["kind", "data"])]
    pub decode: Option<String>,
    /// Frame type to encode.
    #[arg(long, value_enum, default_value = "sabm")]
    pub kind: FrameKindArg,
    /// Target DLCI.
    #[arg(long, default_value_t = 0)]
    pub dlci: u8,
    /// Side sending the frame.
    #[arg(long, value_enum, default_value = "initiator")]
    pub role: RoleArg,
    /// UIH payload.
    #[arg(long)]
    pub data: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Open `path` as a Unix socket if it is one, otherwise as a serial device.
pub fn open_transport(path: &Path, baud: u32) -> CliResult<SerialStream> {
    let is_socket = std::fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false);

    if is_socket {
        UnixDomainSocket::connect(path).map_err(|err| transport_error("connect failed", err))
    } else {
        SerialPort::open(path, &SerialConfig { baud_rate: baud })
            .map_err(|err| transport_error("open failed", err))
    }
}

pub fn parse_duration(raw: &str) -> CliResult<Duration> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(CliError::new(USAGE, "duration cannot be empty"));
    }

    let (number, millis) = if let Some(v) = value.strip_suffix("ms") {
        (v, true)
    } else if let Some(v) = value.strip_suffix('s') {
        (v, false)
    } else {
        (value, false)
    };

    let amount = number
        .trim()
        .parse::<u64>()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {raw}")))?;
    if amount == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(amount)
    } else {
        Duration::from_secs(amount)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert_eq!(parse_duration("0ms").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("soon").unwrap_err().code, USAGE);
    }
}
