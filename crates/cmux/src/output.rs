use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use cmux_frame::{channel_name, Frame};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Outcome of one establishment attempt.
#[derive(Debug, Serialize)]
pub struct ChannelReport {
    pub dlci: u8,
    pub channel_name: &'static str,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

#[derive(Serialize)]
struct OpenOutput<'a> {
    device: &'a str,
    role: &'a str,
    channels: &'a [ChannelReport],
    timestamp: String,
}

pub fn print_open_report(device: &str, role: &str, reports: &[ChannelReport], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = OpenOutput {
                device,
                role,
                channels: reports,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["DLCI", "CHANNEL", "STATUS", "DETAIL"]);
            for report in reports {
                table.add_row(vec![
                    report.dlci.to_string(),
                    report.channel_name.to_string(),
                    report.status.to_string(),
                    report
                        .error
                        .clone()
                        .or_else(|| report.response.clone())
                        .unwrap_or_default(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for report in reports {
                let detail = report
                    .error
                    .as_deref()
                    .or(report.response.as_deref())
                    .unwrap_or("");
                println!(
                    "dlci={} ({}) status={} {}",
                    report.dlci, report.channel_name, report.status, detail
                );
            }
        }
    }
}

/// Something observed while listening.
#[derive(Debug, Serialize)]
pub struct EventReport {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dlci: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl EventReport {
    pub fn new(event: &'static str, dlci: Option<u8>) -> Self {
        Self {
            event,
            dlci,
            payload_size: None,
            payload: None,
        }
    }

    pub fn data(dlci: u8, payload: &[u8]) -> Self {
        Self {
            event: "data",
            dlci: Some(dlci),
            payload_size: Some(payload.len()),
            payload: Some(payload_preview(payload)),
        }
    }
}

#[derive(Serialize)]
struct EventOutput<'a> {
    #[serde(flatten)]
    report: &'a EventReport,
    timestamp: String,
}

pub fn print_event(report: &EventReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = EventOutput {
                report,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["EVENT", "DLCI", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    report.event.to_string(),
                    report.dlci.map(|d| d.to_string()).unwrap_or_default(),
                    report
                        .payload_size
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                    report.payload.clone().unwrap_or_default(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let mut line = format!("event={}", report.event);
            if let Some(dlci) = report.dlci {
                line.push_str(&format!(" dlci={dlci}"));
            }
            if let (Some(size), Some(payload)) = (report.payload_size, &report.payload) {
                line.push_str(&format!(" size={size} payload={payload}"));
            }
            println!("{line}");
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    kind: &'a str,
    dlci: u8,
    channel_name: &'a str,
    command_response: bool,
    poll_final: bool,
    payload_size: usize,
    payload: String,
    hex: String,
}

pub fn print_frame(frame: &Frame, wire: &[u8], format: OutputFormat) {
    let out = FrameOutput {
        kind: frame.kind.name(),
        dlci: frame.dlci(),
        channel_name: channel_name(frame.dlci()),
        command_response: frame.address.command_response(),
        poll_final: frame.poll_final,
        payload_size: frame.payload.len(),
        payload: payload_preview(frame.payload.as_ref()),
        hex: hex(wire),
    };

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "DLCI", "C/R", "P/F", "SIZE", "HEX"])
                .add_row(vec![
                    out.kind.to_string(),
                    format!("{} ({})", out.dlci, out.channel_name),
                    u8::from(out.command_response).to_string(),
                    u8::from(out.poll_final).to_string(),
                    out.payload_size.to_string(),
                    out.hex.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} dlci={} ({}) cr={} pf={} size={} hex={}",
                out.kind,
                out.dlci,
                out.channel_name,
                u8::from(out.command_response),
                u8::from(out.poll_final),
                out.payload_size,
                out.hex
            );
        }
    }
}

/// Space-separated upper-case hex.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
