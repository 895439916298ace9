//! Reserved message kind ids.
//!
//! Two kinds belong to the connection itself and never reach a message
//! catalog. Every other `u32` is available to catalogs.

/// Carries an oversized payload opaquely.
pub const LARGE_MESSAGE_WRAPPER: u32 = 0;

/// Carries a count of data frames the sender has received.
pub const ACKNOWLEDGEMENT: u32 = u32::MAX;

/// Returns a human-readable name for a kind id.
pub fn kind_name(kind_id: u32) -> &'static str {
    match kind_id {
        LARGE_MESSAGE_WRAPPER => "LARGE_MESSAGE_WRAPPER",
        ACKNOWLEDGEMENT => "ACKNOWLEDGEMENT",
        _ => "CATALOG",
    }
}

/// Returns true if the kind id is reserved for control messages.
pub fn is_reserved(kind_id: u32) -> bool {
    matches!(kind_id, LARGE_MESSAGE_WRAPPER | ACKNOWLEDGEMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_kinds() {
        assert!(is_reserved(LARGE_MESSAGE_WRAPPER));
        assert!(is_reserved(ACKNOWLEDGEMENT));
        assert!(!is_reserved(1));
        assert_eq!(kind_name(7), "CATALOG");
        assert_eq!(kind_name(ACKNOWLEDGEMENT), "ACKNOWLEDGEMENT");
    }
}
