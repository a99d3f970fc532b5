use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cmux_mux::{Mux, MuxChannel, MuxEvents};
use cmux_transport::{SerialConfig, SerialPort, UnixDomainSocket};
use tracing::{debug, warn};

use crate::cmd::ListenArgs;
use crate::exit::{mux_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_event, EventReport, OutputFormat};

const TICK: Duration = Duration::from_millis(100);

enum Observed {
    ControlOpened,
    ChannelOpened(MuxChannel),
    Data { dlci: u8, payload: Vec<u8> },
    Closed(u8),
}

/// Forwards scheduler callbacks to the printing thread.
struct Forwarder {
    tx: Sender<Observed>,
}

impl MuxEvents for Forwarder {
    fn on_control_channel_open(&self) {
        let _ = self.tx.send(Observed::ControlOpened);
    }

    fn on_channel_open(&self, channel: MuxChannel, _dlci: u8) {
        let _ = self.tx.send(Observed::ChannelOpened(channel));
    }
}

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.link.mux_config()?;

    // The socket file is removed when `listener` drops at the end of the run.
    let listener = args
        .bind
        .as_ref()
        .map(UnixDomainSocket::bind)
        .transpose()
        .map_err(|err| transport_error("bind failed", err))?;
    let stream = match (&listener, &args.path) {
        (Some(listener), _) => listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?,
        (None, Some(path)) => SerialPort::open(
            path,
            &SerialConfig {
                baud_rate: args.link.baud,
            },
        )
        .map_err(|err| transport_error("open failed", err))?,
        (None, None) => {
            return Err(CliError::new(
                USAGE,
                "either a device path or --bind is required",
            ))
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let (tx, rx) = mpsc::channel();
    let mux = Mux::start(stream, config, Forwarder { tx: tx.clone() })
        .map_err(|err| mux_error("start failed", err))?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let observed = match rx.recv_timeout(TICK) {
            Ok(observed) => observed,
            Err(RecvTimeoutError::Timeout) => {
                if let Some(reason) = mux
                    .terminated()
                    .map_err(|err| mux_error("session lost", err))?
                {
                    debug!(%reason, "session ended");
                    print_event(&EventReport::new("terminated", None), format);
                    return Ok(SUCCESS);
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let report = match observed {
            Observed::ControlOpened => EventReport::new("control-open", Some(0)),
            Observed::ChannelOpened(channel) => {
                let dlci = channel.dlci();
                spawn_reader(channel, tx.clone(), args.echo)?;
                EventReport::new("channel-open", Some(dlci))
            }
            Observed::Data { dlci, payload } => EventReport::data(dlci, &payload),
            Observed::Closed(dlci) => EventReport::new("channel-closed", Some(dlci)),
        };
        print_event(&report, format);
        printed = printed.saturating_add(1);

        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    mux.shutdown()
        .map_err(|err| mux_error("shutdown failed", err))?;
    Ok(SUCCESS)
}

/// Pump one channel's inbound bytes to the printing thread until the session
/// ends.
fn spawn_reader(mut channel: MuxChannel, tx: Sender<Observed>, echo: bool) -> CliResult<()> {
    let dlci = channel.dlci();
    thread::Builder::new()
        .name(format!("cmux-dlci-{dlci}"))
        .spawn(move || {
            let mut buf = [0u8; 512];
            loop {
                let n = match Read::read(&mut channel, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        warn!(dlci, error = %err, "channel read failed");
                        break;
                    }
                };
                if echo {
                    if let Err(err) = channel.write_all(&buf[..n]) {
                        warn!(dlci, error = %err, "echo failed");
                        break;
                    }
                }
                let payload = buf[..n].to_vec();
                if tx.send(Observed::Data { dlci, payload }).is_err() {
                    return;
                }
            }
            let _ = tx.send(Observed::Closed(dlci));
        })
        .map(|_| ())
        .map_err(|err| CliError::new(INTERNAL, format!("reader thread failed: {err}")))
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
