use cmux_frame::{decode_frame, is_valid_dlci, FrameKind, FrameWriter, Role, CONTROL_DLCI};

use crate::cmd::{FrameArgs, FrameKindArg, RoleArg};
use crate::exit::{frame_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: FrameArgs, format: OutputFormat) -> CliResult<i32> {
    let wire = match &args.decode {
        Some(hex) => parse_hex(hex)?,
        None => encode(&args)?,
    };

    let frame = decode_frame(&wire).map_err(|err| frame_error("decode failed", err))?;
    print_frame(&frame, &wire, format);
    Ok(SUCCESS)
}

fn encode(args: &FrameArgs) -> CliResult<Vec<u8>> {
    if args.dlci != CONTROL_DLCI && !is_valid_dlci(args.dlci) {
        return Err(CliError::new(USAGE, format!("invalid DLCI: {}", args.dlci)));
    }
    let kind = match args.kind {
        FrameKindArg::Sabm => FrameKind::Sabm,
        FrameKindArg::Ua => FrameKind::Ua,
        FrameKindArg::Dm => FrameKind::Dm,
        FrameKindArg::Disc => FrameKind::Disc,
        FrameKindArg::Uih => FrameKind::Uih,
    };
    let role = match args.role {
        RoleArg::Initiator => Role::Initiator,
        RoleArg::Responder => Role::Responder,
    };
    if args.data.is_some() && kind != FrameKind::Uih {
        return Err(CliError::new(USAGE, "--data only applies to UIH frames"));
    }

    let mut writer = FrameWriter::new();
    let loaded = match kind {
        FrameKind::Sabm | FrameKind::Disc => writer.load_request(args.dlci, kind, role),
        FrameKind::Ua | FrameKind::Dm => writer.load_response(args.dlci, kind, role),
        FrameKind::Uih => writer.load_data(
            args.dlci,
            role,
            args.data.as_deref().unwrap_or_default().as_bytes(),
        ),
    };
    loaded.map_err(|err| frame_error("encode failed", err))?;
    Ok(writer.frame().to_vec())
}

/// Parse hex octets, ignoring whitespace and an optional `0x` prefix per octet.
pub fn parse_hex(raw: &str) -> CliResult<Vec<u8>> {
    let digits: String = raw
        .split_whitespace()
        .map(|token| token.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(CliError::new(
            DATA_INVALID,
            format!("hex input must be whole octets: {raw}"),
        ));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| CliError::new(DATA_INVALID, format!("invalid hex octet in: {raw}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(kind: FrameKindArg, dlci: u8, role: RoleArg, data: Option<&str>) -> FrameArgs {
        FrameArgs {
            decode: None,
            kind,
            dlci,
            role,
            data: data.map(str::to_string),
        }
    }

    #[test]
    fn encodes_control_channel_sabm() {
        let wire = encode(&args(FrameKindArg::Sabm, 0, RoleArg::Initiator, None)).unwrap();
        assert_eq!(wire, [0xF9, 0x03, 0x3F, 0x01, 0x1C, 0xF9]);
    }

    #[test]
    fn encodes_responder_dm() {
        let wire = encode(&args(FrameKindArg::Dm, 1, RoleArg::Responder, None)).unwrap();
        assert_eq!(wire, [0xF9, 0x07, 0x1F, 0x01, 0xF4, 0xF9]);
    }

    #[test]
    fn rejects_data_on_non_uih() {
        let err = encode(&args(FrameKindArg::Ua, 0, RoleArg::Responder, Some("x"))).unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn oversized_payload_is_invalid_data() {
        let big = "x".repeat(128);
        let err =
            encode(&args(FrameKindArg::Uih, 1, RoleArg::Initiator, Some(&big))).unwrap_err();
        assert_eq!(err.code, DATA_INVALID);
    }

    #[test]
    fn parses_spaced_and_prefixed_hex() {
        assert_eq!(parse_hex("F9 03 73 01 D7 F9").unwrap(), [0xF9, 0x03, 0x73, 0x01, 0xD7, 0xF9]);
        assert_eq!(parse_hex("0xF9 0x03").unwrap(), [0xF9, 0x03]);
        assert_eq!(parse_hex("f903").unwrap(), [0xF9, 0x03]);
        assert_eq!(parse_hex("F9 0").unwrap_err().code, DATA_INVALID);
        assert_eq!(parse_hex("zz").unwrap_err().code, DATA_INVALID);
    }
}
