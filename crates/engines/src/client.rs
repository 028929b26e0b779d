use std::time::Duration;

use reqwest::Client;

/// Builds the shared HTTP client used by all engine clients.
///
/// Only connection establishment is bounded here. Each engine call runs
/// under the caller's own per-step deadline, which has to cover long
/// inference times that a blanket request timeout would cut short.
pub fn build_client(connect_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder().connect_timeout(connect_timeout).build()
}
