//! Channel configuration and endpoint rendering.
//!
//! Generated channel definitions carry an endpoint template with
//! `{placeholder}` segments; the per-instance args map fills them in at
//! connect time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use lattice_core::backoff::{DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_DELAY_MS};

/// Configuration for one state channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// WebSocket base URL, e.g. `"ws://localhost:8000/ws"`.
    pub base_url: String,
    /// Endpoint template, e.g. `"projects/{project_id}/"`.
    pub endpoint: String,
    /// Values substituted into the endpoint template.
    pub args: HashMap<String, String>,
    /// Authentication token sent in the handshake.
    pub token: String,
    /// Optional WebSocket sub-protocols.
    pub protocols: Vec<String>,
    /// First reconnect delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub max_backoff_ms: u64,
}

impl ChannelConfig {
    /// Config with default backoff bounds and an empty args map.
    #[must_use]
    pub fn new(base_url: &str, endpoint: &str, token: &str) -> Self {
        Self {
            base_url: base_url.to_owned(),
            endpoint: endpoint.to_owned(),
            args: HashMap::new(),
            token: token.to_owned(),
            protocols: Vec::new(),
            initial_backoff_ms: DEFAULT_INITIAL_DELAY_MS,
            max_backoff_ms: DEFAULT_MAX_DELAY_MS,
        }
    }

    /// Set one endpoint argument.
    pub fn set_arg(&mut self, key: &str, value: impl ToString) {
        let _ = self.args.insert(key.to_owned(), value.to_string());
    }

    /// Render the final URL: base joined with the endpoint, every
    /// `{placeholder}` replaced from the args map.
    #[must_use]
    pub fn url(&self) -> String {
        let mut path = self.endpoint.clone();
        for (key, value) in &self.args {
            path = path.replace(&format!("{{{key}}}"), value);
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            format!("{base}/")
        } else {
            format!("{base}/{path}")
        }
    }
}
