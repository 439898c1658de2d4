//! Session ticket generation

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;

/// Bytes of entropy behind every ticket
const TICKET_BYTES: usize = 32;

/// Generate a 256-bit random ticket id, URL-safe base64 without padding.
///
/// Tickets are bearer credentials; the only defense against guessing is
/// this entropy, so the size is not configurable.
pub fn generate_ticket() -> String {
    let mut bytes = [0u8; TICKET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tickets_are_43_urlsafe_chars() {
        let ticket = generate_ticket();
        // 32 bytes in unpadded base64
        assert_eq!(ticket.len(), 43);
        assert!(ticket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn tickets_do_not_repeat() {
        let tickets: HashSet<String> = (0..1000).map(|_| generate_ticket()).collect();
        assert_eq!(tickets.len(), 1000);
    }
}
