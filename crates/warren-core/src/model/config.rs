// ── Tunnel configuration blob ──
//
// The coordinator treats configurations as opaque text: parsing, key
// handling, and wire semantics belong to the backend. The authoritative
// copy always lives in the config store; entities only cache it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque tunnel configuration document.
///
/// Contents typically include private key material, so `Debug` reports
/// only the size and the text is never logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelConfig {
    contents: String,
}

impl TunnelConfig {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    /// The raw configuration text.
    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn into_contents(self) -> String {
        self.contents
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelConfig(<{} bytes>)", self.contents.len())
    }
}

impl From<&str> for TunnelConfig {
    fn from(contents: &str) -> Self {
        Self::new(contents)
    }
}

impl From<String> for TunnelConfig {
    fn from(contents: String) -> Self {
        Self::new(contents)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_contents() {
        let config = TunnelConfig::new("PrivateKey = hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("bytes"));
    }

    #[test]
    fn equality_by_contents() {
        assert_eq!(TunnelConfig::from("a = b"), TunnelConfig::new("a = b"));
        assert_ne!(TunnelConfig::from("a = b"), TunnelConfig::new("a = c"));
    }
}
