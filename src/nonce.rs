//! Nonce minting and replay protection. Thin wrapper over the
//! [`Store`] trait's nonce methods plus the hourly purge loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::store::Store;

pub const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub async fn mint(store: &dyn Store) -> anyhow::Result<String> {
    store.mint_nonce().await
}

/// Consumes `nonce`; always returns a freshly minted replacement
/// alongside whether the supplied nonce was valid, so callers can hand
/// the replacement back even on a `badNonce` failure.
pub async fn consume(store: &dyn Store, nonce: &str) -> anyhow::Result<(bool, String)> {
    let valid = store.consume_nonce(nonce).await?;
    let replacement = store.mint_nonce().await?;
    Ok((valid, replacement))
}

/// Runs forever, purging expired nonces once an hour. A single failed
/// purge is logged and does not stop the loop.
pub async fn run_purge_loop(store: Arc<dyn Store>) {
    loop {
        tokio::time::sleep(PURGE_INTERVAL).await;
        match store.purge_expired_nonces().await {
            Ok(purged) if purged > 0 => info!("purged {purged} expired nonces"),
            Ok(_) => {}
            Err(err) => error!("nonce purge failed: {err}"),
        }
    }
}
