//! The admin Unix socket listener.
//!
//! Owner-only (mode 0600): whoever can open it is root on this box, so
//! connections are served with the local-admin peer identity. Transport
//! security comes from the filesystem, not TLS.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::service::{KeyService, Peer};
use crate::transport::serve_connection;

/// Bind the socket, replacing any stale file from a previous run, and
/// clamp it to owner-only access.
pub fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding Unix socket {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting {}", path.display()))?;
    }
    Ok(listener)
}

/// Accept loop mirroring the TLS listener, minus the handshake.
pub async fn serve(
    service: Arc<KeyService>,
    listener: UnixListener,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    tracing::info!("Unix socket listener ready");
    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Unix socket accept failed");
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };
        let service = service.clone();
        tracker.spawn(async move {
            serve_connection(service, stream, Peer::local_admin()).await;
        });
    }
    tracing::info!("Unix socket listener stopped");
}
