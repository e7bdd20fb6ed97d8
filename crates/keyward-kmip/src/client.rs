//! Single-shot TLS dialer for the KMIP appliance.
//!
//! Every operation opens a fresh connection: configured server
//! addresses are tried in order until one TLS dial (TCP connect plus
//! handshake) succeeds. Once a connection is established, protocol
//! failures are reported to the caller rather than retried elsewhere;
//! the appliance answered, its answer stands.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerName, StreamOwned};

use keyward_ttlv::Item;

use crate::messages::{
    create_request, get_request, parse_create_response, parse_get_response, Credential,
};
use crate::{KmipError, Result};

/// Default TLS dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings, lifted from the server's sysconfig file.
#[derive(Debug, Clone, Default)]
pub struct KmipConfig {
    /// `host:port` entries tried in order.
    pub servers: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM file with the CA that issued the appliance certificate.
    pub ca_file: Option<PathBuf>,
    /// PEM client identity presented to the appliance.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub dial_timeout: Option<Duration>,
}

pub struct KmipClient {
    servers: Vec<String>,
    credential: Option<Credential>,
    tls: Arc<ClientConfig>,
    dial_timeout: Duration,
}

impl KmipClient {
    pub fn new(config: KmipConfig) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(KmipError::Config("no KMIP server addresses".into()));
        }
        let credential = match (&config.username, &config.password) {
            (Some(username), password) => Some(Credential {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            }),
            (None, Some(_)) => {
                return Err(KmipError::Config(
                    "KMIP password given without a username".into(),
                ))
            }
            (None, None) => None,
        };

        let mut roots = RootCertStore::empty();
        if let Some(ca_file) = &config.ca_file {
            for der in read_pem_certs(ca_file)? {
                roots
                    .add(&rustls::Certificate(der))
                    .map_err(|e| KmipError::Config(format!("bad CA certificate: {e}")))?;
            }
        }
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);
        let tls = match (&config.cert_file, &config.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let certs = read_pem_certs(cert_file)?
                    .into_iter()
                    .map(rustls::Certificate)
                    .collect();
                let key = read_pem_key(key_file)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| KmipError::Config(format!("bad client identity: {e}")))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(KmipError::Config(
                    "client certificate and key must be given together".into(),
                ))
            }
        };

        Ok(KmipClient {
            servers: config.servers,
            credential,
            tls: Arc::new(tls),
            dial_timeout: config.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT),
        })
    }

    /// Ask the appliance to create a 256-bit AES key. Returns the
    /// appliance-assigned unique identifier.
    pub fn create_key(&self) -> Result<String> {
        let resp = self.roundtrip(create_request(self.credential.as_ref()))?;
        parse_create_response(&resp)
    }

    /// Fetch the raw key material of `unique_id`.
    pub fn get_key(&self, unique_id: &str) -> Result<Vec<u8>> {
        let resp = self.roundtrip(get_request(self.credential.as_ref(), unique_id))?;
        parse_get_response(&resp)
    }

    fn roundtrip(&self, request: Item) -> Result<Item> {
        let mut stream = self.dial()?;
        stream
            .write_all(&request.to_vec())
            .map_err(|e| KmipError::Network(format!("sending request: {e}")))?;
        read_item(&mut stream)
    }

    /// Try each configured address until a TLS dial succeeds.
    fn dial(&self) -> Result<StreamOwned<ClientConnection, TcpStream>> {
        let mut last_err = KmipError::Config("no KMIP server addresses".into());
        for server in &self.servers {
            match self.dial_one(server) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "KMIP dial failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn dial_one(&self, server: &str) -> Result<StreamOwned<ClientConnection, TcpStream>> {
        let addr = server
            .to_socket_addrs()
            .map_err(|e| KmipError::Network(format!("resolving {server}: {e}")))?
            .next()
            .ok_or_else(|| KmipError::Network(format!("{server} resolves to no address")))?;
        let tcp = TcpStream::connect_timeout(&addr, self.dial_timeout)
            .map_err(|e| KmipError::Network(format!("connecting to {server}: {e}")))?;

        let host = server.rsplit_once(':').map(|(h, _)| h).unwrap_or(server);
        let name = ServerName::try_from(host)
            .map_err(|e| KmipError::Tls(format!("bad server name {host}: {e}")))?;
        let conn = ClientConnection::new(self.tls.clone(), name)
            .map_err(|e| KmipError::Tls(e.to_string()))?;
        let mut stream = StreamOwned::new(conn, tcp);
        // drive the handshake now so dial failures stay dial failures
        while stream.conn.is_handshaking() {
            stream
                .conn
                .complete_io(&mut stream.sock)
                .map_err(|e| KmipError::Tls(format!("handshake with {server}: {e}")))?;
        }
        Ok(stream)
    }
}

/// Read exactly one TTLV item off the stream: the 8-byte header first,
/// then the padded remainder it announces.
fn read_item<R: Read>(stream: &mut R) -> Result<Item> {
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .map_err(|e| KmipError::Network(format!("reading response header: {e}")))?;
    let declared = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let padded = declared + (8 - declared % 8) % 8;
    let mut body = vec![0u8; padded];
    stream
        .read_exact(&mut body)
        .map_err(|e| KmipError::Network(format!("reading response body: {e}")))?;

    let mut wire = Vec::with_capacity(8 + padded);
    wire.extend_from_slice(&header);
    wire.extend_from_slice(&body);
    let (item, _) = Item::decode(&wire)?;
    Ok(item)
}

fn read_pem_certs(path: &PathBuf) -> Result<Vec<Vec<u8>>> {
    let file = File::open(path)
        .map_err(|e| KmipError::Config(format!("opening {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| KmipError::Config(format!("parsing {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(KmipError::Config(format!(
            "{} contains no certificates",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_pem_key(path: &PathBuf) -> Result<rustls::PrivateKey> {
    let file = File::open(path)
        .map_err(|e| KmipError::Config(format!("opening {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| KmipError::Config(format!("parsing {}: {e}", path.display())))?;
    keys.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| KmipError::Config(format!("{} contains no private key", path.display())))
}

// ── Tests ─────────────────────────────────────────────────────────────
