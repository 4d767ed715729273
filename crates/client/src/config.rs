//! Client configuration.

use serde::{Deserialize, Serialize};

/// Settings of a `ReactiveClient`.
///
/// Deserializes from camelCase keys; missing keys take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Never create a transport; every handle is inert
    pub disabled: bool,
    /// Log dispatch summaries at `info`
    pub verbose: bool,
    /// Send mutations one at a time, in call order
    pub queue_mutations: bool,
    /// Identifier reported in logs
    pub client_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            verbose: false,
            queue_mutations: true,
            client_id: None,
        }
    }
}

impl ClientConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the client is disabled.
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Sets verbose dispatch logging.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets whether mutations go through the FIFO queue.
    pub fn queue_mutations(mut self, queue_mutations: bool) -> Self {
        self.queue_mutations = queue_mutations;
        self
    }

    /// Sets the client identifier.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}
