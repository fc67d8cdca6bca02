use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::config::DownloadConfig;
use crate::{Error, Result};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client used for media downloads.
///
/// Only the connect phase is bounded; a transfer may run as long as the
/// server keeps sending. Every request carries the configured user agent.
pub fn build_download_client(config: &DownloadConfig) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
    if config.connect_timeout_secs > 0 {
        builder = builder.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
    }

    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))
}
