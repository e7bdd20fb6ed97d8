//! RPC surface shared by the keyward server and its clients.
//!
//! Both transports (TLS and the local Unix socket) speak the same
//! envelope: one JSON request object per line, one JSON reply object per
//! line. The verb set is statically enumerated; binary payloads (salt,
//! key material) travel base64-encoded.

use std::collections::HashMap;
use std::io::{self, BufRead, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use keyward_keydb::PendingCommand;

/// Default TCP port of the TLS listener.
pub const DEFAULT_PORT: u16 = 3737;

/// Default path of the admin Unix socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/keyward/keyward.sock";

/// Dial timeout used by clients, in seconds.
pub const DIAL_TIMEOUT_SECS: u64 = 10;

/// Upper bound on a single request or reply line. Key material is tiny;
/// anything bigger than this is a confused or malicious peer.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

// ── Error codes ───────────────────────────────────────────────────────

/// Machine-readable error categories carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadPassword,
    NotInitialized,
    UnknownUuid,
    Corruption,
    Network,
    Tls,
    ProtocolMismatch,
    KmipFailure,
    ConfigInvalid,
    BadRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    pub fn bad_password() -> Self {
        RpcError::new(ErrorCode::BadPassword, "access password mismatch")
    }

    pub fn not_initialized() -> Self {
        RpcError::new(
            ErrorCode::NotInitialized,
            "server has no access password configured yet",
        )
    }

    pub fn unknown_uuid(uuid: &str) -> Self {
        RpcError::new(ErrorCode::UnknownUuid, format!("no record with uuid {uuid}"))
    }
}

impl From<keyward_keydb::Error> for RpcError {
    fn from(e: keyward_keydb::Error) -> Self {
        use keyward_keydb::Error::*;
        match &e {
            Corruption { .. } => RpcError::new(ErrorCode::Corruption, e.to_string()),
            UnknownUuid { uuid } => RpcError::unknown_uuid(uuid),
            Io { .. } => RpcError::new(ErrorCode::Internal, e.to_string()),
        }
    }
}

// ── Requests ──────────────────────────────────────────────────────────

/// Every inbound operation. The top-level JSON key selects the verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    GetSalt,
    Ping(PingRequest),
    CreateKey(CreateKeyRequest),
    AutoRetrieveKey(AutoRetrieveKeyRequest),
    ManualRetrieveKey(ManualRetrieveKeyRequest),
    ReportAlive(ReportAliveRequest),
    EraseKey(EraseKeyRequest),
    PollCommand(PollCommandRequest),
    SaveCommandResult(SaveCommandResultRequest),
    ReloadRecord(ReloadRecordRequest),
    Shutdown(ShutdownRequest),
}

impl Request {
    /// Verb name for logs.
    pub fn verb(&self) -> &'static str {
        match self {
            Request::GetSalt => "get_salt",
            Request::Ping(_) => "ping",
            Request::CreateKey(_) => "create_key",
            Request::AutoRetrieveKey(_) => "auto_retrieve_key",
            Request::ManualRetrieveKey(_) => "manual_retrieve_key",
            Request::ReportAlive(_) => "report_alive",
            Request::EraseKey(_) => "erase_key",
            Request::PollCommand(_) => "poll_command",
            Request::SaveCommandResult(_) => "save_command_result",
            Request::ReloadRecord(_) => "reload_record",
            Request::Shutdown(_) => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateKeyRequest {
    pub password: String,
    /// Client-chosen uuid (the block device's); generated when absent.
    #[serde(default)]
    pub uuid: Option<String>,
    pub mount_point: String,
    #[serde(default)]
    pub mount_options: Vec<String>,
    pub max_active: u32,
    pub alive_interval_sec: i64,
    pub alive_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRetrieveKeyRequest {
    pub uuids: Vec<String>,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualRetrieveKeyRequest {
    pub password: String,
    pub uuids: Vec<String>,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportAliveRequest {
    pub uuids: Vec<String>,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EraseKeyRequest {
    pub password: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollCommandRequest {
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveCommandResultRequest {
    pub uuid: String,
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadRecordRequest {
    pub password: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub challenge: String,
}

// ── Replies ───────────────────────────────────────────────────────────

/// The reply envelope: `{"ok": ...}` or `{"error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply<T> {
    #[serde(rename = "ok")]
    Ok(T),
    #[serde(rename = "error")]
    Err(RpcError),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, RpcError> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Err(e) => Err(e),
        }
    }
}

/// Reply payload for verbs that only succeed or fail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaltReply {
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateKeyReply {
    pub uuid: String,
    /// The fresh key material, handed back exactly once so the caller
    /// can format its device.
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
}

/// One granted key inside a retrieval reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantedKey {
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub alive_interval_sec: i64,
    pub alive_count: u32,
}

/// Outcome of AutoRetrieveKey / ManualRetrieveKey. The request is
/// partitioned: granted keys, uuids denied for capacity, uuids the
/// server has no record of. Denial is data, not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrieveKeyReply {
    #[serde(default)]
    pub granted: HashMap<String, GrantedKey>,
    #[serde(default)]
    pub rejected_uuids: Vec<String>,
    #[serde(default)]
    pub missing_uuids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportAliveReply {
    /// UUIDs whose server no longer counts the caller as a holder. The
    /// caller must unmount and forget those keys.
    #[serde(default)]
    pub rejected_uuids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollCommandReply {
    #[serde(default)]
    pub command: Option<PendingCommand>,
}

// ── Framing ───────────────────────────────────────────────────────────

/// Write one message as a single JSON line.
pub fn write_message<W: Write, T: Serialize>(w: &mut W, msg: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(msg).map_err(io::Error::other)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()
}

/// Read one JSON line. `Ok(None)` on clean EOF before any data.
pub fn read_message<R: BufRead, T: DeserializeOwned>(r: &mut R) -> io::Result<Option<T>> {
    let mut line = String::new();
    let n = r.by_ref().take(MAX_MESSAGE_BYTES as u64 + 1).read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_MESSAGE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message exceeds size limit",
        ));
    }
    let msg = serde_json::from_str(line.trim())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

// ── Base64 payloads ───────────────────────────────────────────────────

/// Serde adapter encoding byte fields as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
