//! The authenticated TLS listener.
//!
//! Serves remote callers on `LISTEN_ADDR:LISTEN_PORT`. The server
//! certificate is mandatory; when `TLS_VALIDATE_CLIENT` is set, the
//! configured CA must have issued whatever client certificate a peer
//! presents.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::service::{KeyService, Peer};
use crate::transport::serve_connection;

/// Build the TLS acceptor from the configured PEM material.
pub fn make_acceptor(service: &KeyService) -> anyhow::Result<TlsAcceptor> {
    let config = service.config();
    let certs = load_certs(&config.tls_cert)?;
    let key = load_key(&config.tls_key)?;

    let builder = ServerConfig::builder().with_safe_defaults();
    let server_config = if config.tls_validate_client {
        let ca_path = config
            .tls_ca
            .as_ref()
            .context("client validation enabled without TLS_CA")?;
        let mut roots = RootCertStore::empty();
        for der in load_certs(ca_path)? {
            roots
                .add(&der)
                .with_context(|| format!("bad CA certificate in {}", ca_path.display()))?;
        }
        builder
            .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(roots)))
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Accept loop. Returns once the cancellation token fires; in-flight
/// connections keep running on the tracker.
pub async fn serve(
    service: Arc<KeyService>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    tracing::info!(addr = ?listener.local_addr().ok(), "TLS listener ready");
    loop {
        let (tcp, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "TLS accept failed");
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };
        let acceptor = acceptor.clone();
        let service = service.clone();
        tracker.spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(stream) => {
                    let peer = Peer::remote(addr.ip().to_string());
                    serve_connection(service, stream, peer).await;
                }
                Err(e) => {
                    tracing::debug!(peer = %addr, error = %e, "TLS handshake failed");
                }
            }
        });
    }
    tracing::info!("TLS listener stopped");
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<Certificate>> {
    let file =
        File::open(path).with_context(|| format!("opening certificate {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .with_context(|| format!("parsing certificate {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "{} contains no certificates", path.display());
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKey> {
    let file = File::open(path).with_context(|| format!("opening key {}", path.display()))?;
    let keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .with_context(|| format!("parsing key {}", path.display()))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .with_context(|| format!("{} contains no PKCS#8 private key", path.display()))
}
