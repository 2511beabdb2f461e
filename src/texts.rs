//! Display text lookup by message key.
//!
//! Text comes from an optional `texts.json` object in the state directory,
//! then from built-in defaults. A key found nowhere yields
//! [`TEXT_UNAVAILABLE`]; load errors are logged and never reach users.

use crate::state::load_state;
use std::collections::HashMap;
use std::path::Path;

pub const TEXT_UNAVAILABLE: &str = "Text unavailable.";

const DEFAULTS: &[(&str, &str)] = &[
    (
        "welcome",
        "Hello! This bot is part of a failover fleet. Use the menu below.",
    ),
    ("profile", "Your profile"),
    (
        "clone",
        "Send the credential of the new standby bot as your next message.",
    ),
    (
        "guide_create_clone",
        "To create a standby: register a new bot with @BotFather, copy its token, \
         tap \"Create standby\" and paste the token.",
    ),
    ("unknown", "Unknown command. Try /start."),
];

#[derive(Debug, Clone, Default)]
pub struct TextCatalog {
    overrides: HashMap<String, String>,
}

impl TextCatalog {
    /// Load overrides from `path`. Any failure falls back to the defaults.
    pub fn load(path: &Path) -> Self {
        match load_state::<HashMap<String, String>>(path) {
            Ok(Some(overrides)) => Self { overrides },
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!("text overrides ignored: {e}");
                Self::default()
            }
        }
    }

    pub fn get(&self, key: &str) -> &str {
        if let Some(text) = self.overrides.get(key) {
            return text;
        }
        DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .unwrap_or(TEXT_UNAVAILABLE)
    }
}
