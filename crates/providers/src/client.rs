use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// Per-request budget for LLM calls. Generation can be slow, so this is
/// deliberately generous; the orchestrator has its own tighter deadlines.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Build the shared HTTP client. Proxy settings come from the standard
/// HTTPS_PROXY / HTTP_PROXY environment variables via reqwest's defaults.
pub fn build_http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_http_client() {
        // reqwest::Client exposes no config inspection, so this only checks
        // that construction does not panic.
        let client = build_http_client(Duration::from_secs(30));
        drop(client);
    }
}
