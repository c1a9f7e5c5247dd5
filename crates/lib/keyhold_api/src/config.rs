//! API server configuration.

use keyhold_core::config::AuthConfig;

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// Externally reachable base URL, used to build `refresh_link`.
    pub public_base_url: String,
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable          | Default                      |
    /// |-------------------|------------------------------|
    /// | `BIND_ADDR`       | `127.0.0.1:3100`             |
    /// | `PUBLIC_BASE_URL` | `http://{BIND_ADDR}`         |
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3100".into());
        let public_base_url =
            std::env::var("PUBLIC_BASE_URL").unwrap_or_else(|_| format!("http://{bind_addr}"));
        Self {
            bind_addr,
            public_base_url,
        }
    }

    /// Absolute refresh endpoint advertised in token pairs.
    pub fn refresh_link(&self) -> String {
        AuthConfig::refresh_link_for(&self.public_base_url)
    }
}
