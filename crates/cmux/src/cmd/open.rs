use std::io::Write;
use std::time::Instant;

use cmux_frame::{channel_name, Role, CONTROL_DLCI};
use cmux_mux::{Mux, MuxChannel, MuxError, NoEvents};
use tracing::{info, warn};

use crate::cmd::{open_transport, parse_duration, OpenArgs};
use crate::exit::{io_error, mux_error, mux_error_code, CliResult, SUCCESS};
use crate::output::{payload_preview, print_open_report, ChannelReport, OutputFormat};

pub fn run(args: OpenArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.link.mux_config()?;
    let wait = parse_duration(&args.wait)?;
    let stream = open_transport(&args.path, args.link.baud)?;

    let mux = Mux::start(stream, config, NoEvents).map_err(|err| mux_error("start failed", err))?;
    mux.open_control_channel()
        .map_err(|err| mux_error("control channel failed", err))?;
    info!(device = ?args.path, "control channel open");

    let mut reports = vec![ChannelReport {
        dlci: CONTROL_DLCI,
        channel_name: channel_name(CONTROL_DLCI),
        status: "open",
        error: None,
        response: None,
    }];
    let mut opened = Vec::new();
    let mut code = SUCCESS;

    for &dlci in &args.channels {
        match mux.open_channel(dlci) {
            Ok(channel) => {
                reports.push(ChannelReport {
                    dlci,
                    channel_name: channel_name(dlci),
                    status: "open",
                    error: None,
                    response: None,
                });
                opened.push((reports.len() - 1, channel));
            }
            Err(err) => {
                warn!(dlci, error = %err, "channel open failed");
                if code == SUCCESS {
                    code = mux_error_code(&err);
                }
                reports.push(ChannelReport {
                    dlci,
                    channel_name: channel_name(dlci),
                    status: status_for(&err),
                    error: Some(err.to_string()),
                    response: None,
                });
            }
        }
    }

    if let Some(data) = &args.send {
        for (_, channel) in &mut opened {
            channel
                .write_all(data.as_bytes())
                .map_err(|err| io_error("send failed", err))?;
        }

        let deadline = Instant::now() + wait;
        for (index, channel) in &opened {
            let reply = collect_reply(channel, deadline)?;
            if !reply.is_empty() {
                reports[*index].response = Some(payload_preview(&reply));
            }
        }
    }

    let role = match mux.role().map_err(|err| mux_error("session lost", err))? {
        Some(Role::Responder) => "responder",
        _ => "initiator",
    };
    print_open_report(&args.path.display().to_string(), role, &reports, format);

    mux.shutdown()
        .map_err(|err| mux_error("shutdown failed", err))?;
    Ok(code)
}

fn status_for(err: &MuxError) -> &'static str {
    match err {
        MuxError::Rejected(_) => "rejected",
        MuxError::Timeout { .. } => "timeout",
        MuxError::ResourceExhausted => "exhausted",
        MuxError::AlreadySatisfied(_) | MuxError::ChannelInUse(_) => "already-open",
        _ => "error",
    }
}

/// Everything the peer sends on `channel` until `deadline`.
fn collect_reply(channel: &MuxChannel, deadline: Instant) -> CliResult<Vec<u8>> {
    let mut reply = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(reply);
        }
        match channel.read_timeout(&mut buf, Some(remaining)) {
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(MuxError::WouldBlock) | Err(MuxError::Terminated(_)) => return Ok(reply),
            Err(err) => return Err(mux_error("receive failed", err)),
        }
    }
}
