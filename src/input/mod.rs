//! Keyboard bindings
//!
//! The front-end forwards raw key names (DOM `KeyboardEvent.key` values);
//! only the two global shortcuts are bound here. Keys typed into a text
//! field never reach the daemon.

use crate::coordinator::Intent;

/// Space: start or stop scene narration
const TOGGLE_KEYS: &[&str] = &[" ", "Space", "Spacebar"];

/// Escape: stop guidance or abandon calibration
const CANCEL_KEYS: &[&str] = &["Escape", "Esc"];

/// Map a key name to its intent, if bound
pub fn intent_for_key(key: &str) -> Option<Intent> {
    if TOGGLE_KEYS.contains(&key) {
        Some(Intent::TogglePrimary)
    } else if CANCEL_KEYS.contains(&key) {
        Some(Intent::Cancel)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_toggles() {
        assert_eq!(intent_for_key(" "), Some(Intent::TogglePrimary));
        assert_eq!(intent_for_key("Space"), Some(Intent::TogglePrimary));
    }

    #[test]
    fn test_escape_cancels() {
        assert_eq!(intent_for_key("Escape"), Some(Intent::Cancel));
        assert_eq!(intent_for_key("Esc"), Some(Intent::Cancel));
    }

    #[test]
    fn test_unbound_keys() {
        assert_eq!(intent_for_key("Enter"), None);
        assert_eq!(intent_for_key("space"), None);
        assert_eq!(intent_for_key(""), None);
    }
}
