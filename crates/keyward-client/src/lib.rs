//! Blocking client stub for the keyward RPC surface.
//!
//! Deliberately opens a fresh connection per call: no pooling, no
//! keep-alive. The callers are boot-time unlock scripts and the admin
//! tool, which make a handful of calls; simplicity beats throughput
//! here. No async runtime dependency on the client path.

use std::io::{BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerName, StreamOwned};
use serde::de::DeserializeOwned;

use keyward_proto::{
    read_message, write_message, Ack, AutoRetrieveKeyRequest, CreateKeyReply, CreateKeyRequest,
    EraseKeyRequest, ManualRetrieveKeyRequest, PingRequest, PollCommandReply, PollCommandRequest,
    ReloadRecordRequest, Reply, ReportAliveReply, ReportAliveRequest, Request, RetrieveKeyReply,
    RpcError, SaltReply, SaveCommandResultRequest, ShutdownRequest, DIAL_TIMEOUT_SECS,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot reach key server: {0}")]
    Unreachable(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// The server answered with an RPC-level error.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("invalid server response: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Where and how to reach the server.
enum Endpoint {
    /// TLS to `host:port`, trusting `tls` roots.
    Tls {
        address: String,
        tls: Arc<ClientConfig>,
    },
    /// The local admin Unix socket; filesystem permissions stand in for
    /// transport security.
    Unix { path: PathBuf },
}

pub struct KeywardClient {
    endpoint: Endpoint,
    dial_timeout: Duration,
}

impl KeywardClient {
    /// Connect over TLS. `ca_pem` supplies the CA bundle that issued
    /// the server certificate; `identity` optionally presents a client
    /// certificate/key PEM pair to servers that validate clients.
    pub fn tls(
        address: impl Into<String>,
        ca_pem: &[u8],
        identity: Option<(&[u8], &[u8])>,
    ) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for der in
            rustls_pemfile::certs(&mut &ca_pem[..]).map_err(|e| ClientError::Tls(e.to_string()))?
        {
            roots
                .add(&rustls::Certificate(der))
                .map_err(|e| ClientError::Tls(e.to_string()))?;
        }
        if roots.is_empty() {
            return Err(ClientError::Tls("CA bundle contains no certificates".into()));
        }
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);
        let config = match identity {
            Some((cert_pem, key_pem)) => {
                let certs = rustls_pemfile::certs(&mut &cert_pem[..])
                    .map_err(|e| ClientError::Tls(e.to_string()))?
                    .into_iter()
                    .map(rustls::Certificate)
                    .collect();
                let key = rustls_pemfile::pkcs8_private_keys(&mut &key_pem[..])
                    .map_err(|e| ClientError::Tls(e.to_string()))?
                    .into_iter()
                    .next()
                    .map(rustls::PrivateKey)
                    .ok_or_else(|| ClientError::Tls("identity PEM has no private key".into()))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| ClientError::Tls(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };
        Ok(KeywardClient {
            endpoint: Endpoint::Tls {
                address: address.into(),
                tls: Arc::new(config),
            },
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
        })
    }

    /// Connect through the local admin Unix socket.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        KeywardClient {
            endpoint: Endpoint::Unix { path: path.into() },
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    // ── Verbs ─────────────────────────────────────────────────────────

    pub fn get_salt(&self) -> Result<Vec<u8>> {
        let reply: SaltReply = self.call(Request::GetSalt)?;
        Ok(reply.salt)
    }

    pub fn ping(&self, password: &str) -> Result<()> {
        let _: Ack = self.call(Request::Ping(PingRequest {
            password: password.into(),
        }))?;
        Ok(())
    }

    pub fn create_key(&self, req: CreateKeyRequest) -> Result<CreateKeyReply> {
        self.call(Request::CreateKey(req))
    }

    pub fn auto_retrieve_key(&self, req: AutoRetrieveKeyRequest) -> Result<RetrieveKeyReply> {
        self.call(Request::AutoRetrieveKey(req))
    }

    pub fn manual_retrieve_key(&self, req: ManualRetrieveKeyRequest) -> Result<RetrieveKeyReply> {
        self.call(Request::ManualRetrieveKey(req))
    }

    /// Report that this host still holds the given keys. Returns the
    /// UUIDs the server rejected; the caller must unmount and forget
    /// those.
    pub fn report_alive(&self, req: ReportAliveRequest) -> Result<Vec<String>> {
        let reply: ReportAliveReply = self.call(Request::ReportAlive(req))?;
        Ok(reply.rejected_uuids)
    }

    pub fn erase_key(&self, req: EraseKeyRequest) -> Result<()> {
        let _: Ack = self.call(Request::EraseKey(req))?;
        Ok(())
    }

    pub fn poll_command(&self, uuid: &str) -> Result<PollCommandReply> {
        self.call(Request::PollCommand(PollCommandRequest { uuid: uuid.into() }))
    }

    pub fn save_command_result(&self, uuid: &str, result: &str) -> Result<()> {
        let _: Ack = self.call(Request::SaveCommandResult(SaveCommandResultRequest {
            uuid: uuid.into(),
            result: result.into(),
        }))?;
        Ok(())
    }

    pub fn reload_record(&self, password: &str, uuid: &str) -> Result<()> {
        let _: Ack = self.call(Request::ReloadRecord(ReloadRecordRequest {
            password: password.into(),
            uuid: uuid.into(),
        }))?;
        Ok(())
    }

    pub fn shutdown(&self, challenge: &str) -> Result<()> {
        let _: Ack = self.call(Request::Shutdown(ShutdownRequest {
            challenge: challenge.into(),
        }))?;
        Ok(())
    }

    // ── Plumbing ──────────────────────────────────────────────────────

    /// One connection, one request line, one reply line.
    fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        match &self.endpoint {
            Endpoint::Tls { address, tls } => {
                let stream = self.dial_tls(address, tls.clone())?;
                self.exchange(stream, request)
            }
            Endpoint::Unix { path } => {
                let stream = UnixStream::connect(path)
                    .map_err(|e| ClientError::Unreachable(format!("{}: {e}", path.display())))?;
                self.exchange(stream, request)
            }
        }
    }

    fn dial_tls(
        &self,
        address: &str,
        tls: Arc<ClientConfig>,
    ) -> Result<StreamOwned<ClientConnection, TcpStream>> {
        let addr = address
            .to_socket_addrs()
            .map_err(|e| ClientError::Unreachable(format!("resolving {address}: {e}")))?
            .next()
            .ok_or_else(|| ClientError::Unreachable(format!("{address} resolves to nothing")))?;
        let tcp = TcpStream::connect_timeout(&addr, self.dial_timeout)
            .map_err(|e| ClientError::Unreachable(format!("{address}: {e}")))?;
        let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
        let name =
            ServerName::try_from(host).map_err(|e| ClientError::Tls(format!("{host}: {e}")))?;
        let conn =
            ClientConnection::new(tls, name).map_err(|e| ClientError::Tls(e.to_string()))?;
        Ok(StreamOwned::new(conn, tcp))
    }

    fn exchange<S, T>(&self, mut stream: S, request: Request) -> Result<T>
    where
        S: Read + Write,
        T: DeserializeOwned,
    {
        write_message(&mut stream, &request)
            .map_err(|e| ClientError::Unreachable(e.to_string()))?;
        let mut reader = BufReader::new(stream);
        let reply: Reply<T> = read_message(&mut reader)
            .map_err(|e| ClientError::Decode(e.to_string()))?
            .ok_or_else(|| ClientError::Decode("connection closed before reply".into()))?;
        reply.into_result().map_err(ClientError::from)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_proto::ErrorCode;
    use std::io::Cursor;

    /// In-memory stream pairing a scripted reply with a capture buffer.
    struct FakeStream {
        reply: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reply.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn stub() -> KeywardClient {
        KeywardClient::unix("/nonexistent.sock")
    }

    #[test]
    fn exchange_sends_one_line_and_parses_ok_reply() {
        let stream = FakeStream {
            reply: Cursor::new(b"{\"ok\":{}}\n".to_vec()),
            written: Vec::new(),
        };
        let client = stub();
        let _: Ack = client
            .exchange(
                stream,
                Request::Ping(PingRequest {
                    password: "pw".into(),
                }),
            )
            .unwrap();
    }

    #[test]
    fn exchange_surfaces_rpc_errors() {
        let stream = FakeStream {
            reply: Cursor::new(
                b"{\"error\":{\"code\":\"bad_password\",\"message\":\"nope\"}}\n".to_vec(),
            ),
            written: Vec::new(),
        };
        let client = stub();
        let err = client
            .exchange::<_, Ack>(
                stream,
                Request::Ping(PingRequest {
                    password: "pw".into(),
                }),
            )
            .unwrap_err();
        match err {
            ClientError::Rpc(e) => assert_eq!(e.code, ErrorCode::BadPassword),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exchange_rejects_empty_reply() {
        let stream = FakeStream {
            reply: Cursor::new(Vec::new()),
            written: Vec::new(),
        };
        let client = stub();
        let err = client.exchange::<_, Ack>(stream, Request::GetSalt).unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[test]
    fn unix_endpoint_without_socket_is_unreachable() {
        let client = KeywardClient::unix("/definitely/not/there.sock");
        assert!(matches!(
            client.ping("pw"),
            Err(ClientError::Unreachable(_))
        ));
    }

    #[test]
    fn tls_requires_a_real_ca_bundle() {
        assert!(matches!(
            KeywardClient::tls("localhost:3737", b"not a pem", None),
            Err(ClientError::Tls(_))
        ));
    }
}
