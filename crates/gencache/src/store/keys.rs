//! Volatile-tier key layout

pub fn conversation(conversation_id: &str) -> String {
    format!("conv:hot:{}", conversation_id)
}

pub fn prompt(request_hash: &str) -> String {
    format!("prompt:{}", request_hash)
}

pub fn session(session_id: &str) -> String {
    format!("sessions:{}", session_id)
}

/// Pre-authentication working set of a guest.
pub fn guest(guest_id: &str) -> String {
    format!("guest:{}", guest_id)
}

/// Ledger `source` for a guest migration.
pub fn guest_ledger_source(guest_id: &str) -> String {
    guest(guest_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(conversation("c1"), "conv:hot:c1");
        assert_eq!(prompt("ab"), "prompt:ab");
        assert_eq!(session("s"), "sessions:s");
        assert_eq!(guest("g"), "guest:g");
    }
}
