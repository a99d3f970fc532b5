//! DLCI (Data Link Connection Identifier) numbering.
//!
//! DLCI 0 carries the multiplexer control channel. DLCIs 1-63 are data
//! channels opened on demand by either side.

/// The multiplexer control channel.
pub const CONTROL_DLCI: u8 = 0;

/// First data channel DLCI.
pub const MIN_DLCI: u8 = 1;

/// Last data channel DLCI (six address bits).
pub const MAX_DLCI: u8 = 63;

/// Returns true if `dlci` can be opened as a data channel.
pub fn is_valid_dlci(dlci: u8) -> bool {
    (MIN_DLCI..=MAX_DLCI).contains(&dlci)
}

/// Returns a human-readable name for a DLCI.
pub fn channel_name(dlci: u8) -> &'static str {
    match dlci {
        CONTROL_DLCI => "CONTROL",
        MIN_DLCI..=MAX_DLCI => "DATA",
        _ => "INVALID",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlci_range() {
        assert!(!is_valid_dlci(CONTROL_DLCI));
        assert!(is_valid_dlci(1));
        assert!(is_valid_dlci(63));
        assert!(!is_valid_dlci(64));
    }

    #[test]
    fn names() {
        assert_eq!(channel_name(0), "CONTROL");
        assert_eq!(channel_name(7), "DATA");
        assert_eq!(channel_name(200), "INVALID");
    }
}
