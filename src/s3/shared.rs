//! Process-wide store client
//!
//! The binary builds one [`S3Client`] at startup and installs it here; library
//! callers that construct their own client can ignore this module.

use super::S3Client;
use std::sync::{Arc, OnceLock};

static SHARED: OnceLock<Arc<S3Client>> = OnceLock::new();

/// Install the shared client. Returns the already-installed client if another
/// caller got there first.
pub fn install(client: S3Client) -> Arc<S3Client> {
    let client = Arc::new(client);
    match SHARED.set(Arc::clone(&client)) {
        Ok(()) => client,
        Err(_) => {
            tracing::warn!("Shared store client already installed, keeping the first one");
            SHARED.get().cloned().unwrap_or(client)
        }
    }
}

/// The shared client, if installed
pub fn get() -> Option<Arc<S3Client>> {
    SHARED.get().cloned()
}
