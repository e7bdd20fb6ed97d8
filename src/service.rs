//! The RPC service: every verb handler over the shared record store.
//!
//! The store sits behind one mutex owned by the service; handlers lock,
//! decide, persist, unlock. KMIP round trips happen outside the lock on
//! a blocking task, working from a snapshot of the record. Liveness is
//! always computed against this server's clock; holder-supplied
//! timestamps are never trusted.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use tokio_util::sync::CancellationToken;

use keyward_crypto::{ct_equal, verify_password, KeyBuffer};
use keyward_keydb::{KeyDb, KeyRecord};
use keyward_kmip::{KmipClient, KmipError};
use keyward_proto::{
    Ack, AutoRetrieveKeyRequest, CreateKeyReply, CreateKeyRequest, ErrorCode, GrantedKey,
    ManualRetrieveKeyRequest, PollCommandReply, Reply, ReportAliveReply, ReportAliveRequest,
    Request, RetrieveKeyReply, RpcError, SaltReply,
};

use crate::config::ServerConfig;
use crate::mailer::Mailer;

/// Identity of the caller as the transport saw it.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Source IP; the key under which liveness is tracked.
    pub ip: String,
    /// True for connections over the owner-only Unix socket. Those
    /// callers are root by filesystem permission, so password checks
    /// that only guard against remote attackers are skipped. Checks
    /// that authorize key operations themselves are not.
    pub local_admin: bool,
}

impl Peer {
    pub fn remote(ip: impl Into<String>) -> Self {
        Peer {
            ip: ip.into(),
            local_admin: false,
        }
    }

    pub fn local_admin() -> Self {
        Peer {
            ip: "127.0.0.1".into(),
            local_admin: true,
        }
    }
}

pub struct KeyService {
    config: ServerConfig,
    db: Mutex<KeyDb>,
    kmip: Option<Arc<KmipClient>>,
    mailer: Mailer,
    admin_challenge: String,
    cancel: CancellationToken,
}

impl KeyService {
    /// Open the record store and mint the one-shot shutdown challenge.
    /// Refuses to start over a corrupt store.
    pub fn new(config: ServerConfig, mailer: Mailer) -> anyhow::Result<Arc<Self>> {
        let db = KeyDb::open_all(&config.keydb_dir)?;
        let kmip = match &config.kmip {
            Some(kmip_config) => Some(Arc::new(KmipClient::new(kmip_config.clone())?)),
            None => None,
        };
        let mut challenge = [0u8; 32];
        OsRng.fill_bytes(&mut challenge);
        let admin_challenge = hex::encode(challenge);
        tracing::info!(challenge = %admin_challenge, "admin shutdown challenge for this run");

        Ok(Arc::new(KeyService {
            config,
            db: Mutex::new(db),
            kmip,
            mailer,
            admin_challenge,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn admin_challenge(&self) -> &str {
        &self.admin_challenge
    }

    /// Cancelled when a Shutdown request has been accepted.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    // ── Dispatch ──────────────────────────────────────────────────────

    pub async fn handle(&self, peer: &Peer, request: Request) -> Reply<serde_json::Value> {
        let verb = request.verb();
        match self.dispatch(peer, request).await {
            Ok(value) => {
                tracing::debug!(verb, peer = %peer.ip, "request served");
                Reply::Ok(value)
            }
            Err(e) => {
                tracing::warn!(verb, peer = %peer.ip, error = %e, "request refused");
                Reply::Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        peer: &Peer,
        request: Request,
    ) -> Result<serde_json::Value, RpcError> {
        // Until the operator sets an access password, only Ping and
        // GetSalt answer (and both report the restricted state).
        if self.config.auth.is_none()
            && !matches!(request, Request::Ping(_) | Request::GetSalt)
        {
            return Err(RpcError::not_initialized());
        }

        match request {
            Request::GetSalt => {
                let auth = self.config.auth.as_ref().ok_or_else(RpcError::not_initialized)?;
                ok(SaltReply {
                    salt: auth.salt.to_vec(),
                })
            }
            Request::Ping(req) => {
                self.check_password(peer, &req.password)?;
                ok(Ack {})
            }
            Request::CreateKey(req) => self.create_key(req).await,
            Request::AutoRetrieveKey(req) => self.auto_retrieve_key(peer, req).await,
            Request::ManualRetrieveKey(req) => self.manual_retrieve_key(peer, req).await,
            Request::ReportAlive(req) => self.report_alive(peer, req),
            Request::EraseKey(req) => {
                self.check_password_always(&req.password)?;
                self.db.lock().unwrap().erase(&req.uuid)?;
                tracing::info!(uuid = %req.uuid, "record erased");
                // a KMIP-backed key is not deleted upstream; external
                // lifecycles belong to the appliance operator
                ok(Ack {})
            }
            Request::PollCommand(req) => {
                let now = self.now();
                let mut db = self.db.lock().unwrap();
                let rec = db
                    .get_by_uuid(&req.uuid)
                    .ok_or_else(|| RpcError::unknown_uuid(&req.uuid))?;
                let mut rec = rec.clone();
                let command = rec.poll_command(now, &peer.ip);
                db.upsert(rec)?;
                ok(PollCommandReply { command })
            }
            Request::SaveCommandResult(req) => {
                let now = self.now();
                let mut db = self.db.lock().unwrap();
                let rec = db
                    .get_by_uuid(&req.uuid)
                    .ok_or_else(|| RpcError::unknown_uuid(&req.uuid))?;
                let mut rec = rec.clone();
                if !rec.save_command_result(now, &peer.ip, &req.result) {
                    tracing::debug!(uuid = %req.uuid, peer = %peer.ip, "result with no outstanding command");
                }
                db.upsert(rec)?;
                ok(Ack {})
            }
            Request::ReloadRecord(req) => {
                self.check_password_always(&req.password)?;
                self.db.lock().unwrap().reload_one(&req.uuid)?;
                tracing::info!(uuid = %req.uuid, "record reloaded from disk");
                ok(Ack {})
            }
            Request::Shutdown(req) => {
                if !ct_equal(req.challenge.as_bytes(), self.admin_challenge.as_bytes()) {
                    return Err(RpcError::new(
                        ErrorCode::BadPassword,
                        "shutdown challenge mismatch",
                    ));
                }
                tracing::info!("shutdown requested with valid challenge");
                self.cancel.cancel();
                ok(Ack {})
            }
        }
    }

    // ── Authentication ────────────────────────────────────────────────

    /// Password check for verbs where the password guards against
    /// remote attackers only; the Unix socket's file permissions
    /// already prove local root.
    fn check_password(&self, peer: &Peer, password: &str) -> Result<(), RpcError> {
        let auth = self.config.auth.as_ref().ok_or_else(RpcError::not_initialized)?;
        if peer.local_admin {
            return Ok(());
        }
        if !verify_password(&auth.salt, &auth.hash, password) {
            return Err(RpcError::bad_password());
        }
        Ok(())
    }

    /// Password check for verbs that authorize key operations
    /// themselves (CreateKey, EraseKey, ReloadRecord). The Unix socket
    /// is no bypass here.
    fn check_password_always(&self, password: &str) -> Result<(), RpcError> {
        let auth = self.config.auth.as_ref().ok_or_else(RpcError::not_initialized)?;
        if !verify_password(&auth.salt, &auth.hash, password) {
            return Err(RpcError::bad_password());
        }
        Ok(())
    }

    // ── Key creation ──────────────────────────────────────────────────

    async fn create_key(&self, req: CreateKeyRequest) -> Result<serde_json::Value, RpcError> {
        self.check_password_always(&req.password)?;
        if req.max_active == 0 || req.alive_interval_sec <= 0 || req.alive_count == 0 {
            return Err(RpcError::new(
                ErrorCode::BadRequest,
                "max_active, alive_interval_sec and alive_count must be positive",
            ));
        }
        // a caller-supplied uuid names the record file on disk, so it
        // must be exactly the canonical 8-4-4-4-12 form, nothing
        // path-like
        let uuid = match &req.uuid {
            Some(uuid) if !uuid.is_empty() => match uuid::Uuid::parse_str(uuid) {
                Ok(parsed) if parsed.as_hyphenated().to_string() == *uuid => uuid.clone(),
                _ => {
                    return Err(RpcError::new(
                        ErrorCode::BadRequest,
                        format!("\"{uuid}\" is not a canonically formatted uuid"),
                    ))
                }
            },
            _ => uuid::Uuid::new_v4().to_string(),
        };
        if self.db.lock().unwrap().get_by_uuid(&uuid).is_some() {
            return Err(RpcError::new(
                ErrorCode::BadRequest,
                format!("a record with uuid {uuid} already exists"),
            ));
        }

        // Key material comes from the appliance when one is configured;
        // the record then carries only the external reference.
        let (key_material, external_id, fresh_key) = match &self.kmip {
            Some(kmip) => {
                let kmip = kmip.clone();
                let (external_id, key) = tokio::task::spawn_blocking(move || {
                    let id = kmip.create_key()?;
                    let key = kmip.get_key(&id)?;
                    Ok::<_, KmipError>((id, key))
                })
                .await
                .map_err(internal)?
                .map_err(kmip_error)?;
                (Vec::new(), Some(external_id), key)
            }
            None => {
                let key = KeyBuffer::generate();
                (key.as_slice().to_vec(), None, key.as_slice().to_vec())
            }
        };

        let record = KeyRecord {
            uuid: uuid.clone(),
            id: short_id(&req.mount_point, &uuid),
            creation_time: self.now(),
            key_material,
            external_id,
            mount_point: req.mount_point.clone(),
            mount_options: req.mount_options,
            max_active: req.max_active,
            alive_interval_sec: req.alive_interval_sec,
            alive_count: req.alive_count,
            ..KeyRecord::default()
        };
        self.db.lock().unwrap().upsert(record)?;
        tracing::info!(uuid = %uuid, mount_point = %req.mount_point, "record created");
        self.mailer.notify_creation(&uuid, &req.mount_point);
        ok(CreateKeyReply {
            uuid,
            key: fresh_key,
        })
    }

    // ── Key retrieval ─────────────────────────────────────────────────

    async fn auto_retrieve_key(
        &self,
        peer: &Peer,
        req: AutoRetrieveKeyRequest,
    ) -> Result<serde_json::Value, RpcError> {
        self.retrieve(peer, &req.uuids, &req.hostname, true).await
    }

    async fn manual_retrieve_key(
        &self,
        peer: &Peer,
        req: ManualRetrieveKeyRequest,
    ) -> Result<serde_json::Value, RpcError> {
        self.check_password(peer, &req.password)?;
        // the password overrides the holder cap; liveness bookkeeping
        // still happens
        self.retrieve(peer, &req.uuids, &req.hostname, false).await
    }

    async fn retrieve(
        &self,
        peer: &Peer,
        uuids: &[String],
        hostname: &str,
        enforce_capacity: bool,
    ) -> Result<serde_json::Value, RpcError> {
        let now = self.now();
        let mut reply = RetrieveKeyReply::default();
        let mut granted_records: Vec<KeyRecord> = Vec::new();
        {
            let mut db = self.db.lock().unwrap();
            for uuid in uuids {
                let Some(rec) = db.get_by_uuid(uuid) else {
                    reply.missing_uuids.push(uuid.clone());
                    continue;
                };
                let mut rec = rec.clone();
                rec.remove_dead_hosts(now);
                if enforce_capacity
                    && !rec.is_alive_holder(now, &peer.ip)
                    && rec.alive_holder_count() >= rec.max_active as usize
                {
                    reply.rejected_uuids.push(uuid.clone());
                    continue;
                }
                rec.record_retrieval(now, &peer.ip, hostname);
                db.upsert(rec.clone())?;
                granted_records.push(rec);
            }
        }

        // materialize KMIP-held keys outside the store lock
        let mut granted_uuids = Vec::new();
        for rec in granted_records {
            let key = self.materialize_key(&rec).await?;
            granted_uuids.push(rec.uuid.clone());
            reply.granted.insert(
                rec.uuid.clone(),
                GrantedKey {
                    key,
                    mount_point: rec.mount_point,
                    mount_options: rec.mount_options,
                    alive_interval_sec: rec.alive_interval_sec,
                    alive_count: rec.alive_count,
                },
            );
        }
        self.mailer.notify_retrieval(&granted_uuids, &peer.ip, hostname);
        ok(reply)
    }

    /// The key bytes for a granted record, fetching from the appliance
    /// when the record only references external material.
    async fn materialize_key(&self, rec: &KeyRecord) -> Result<Vec<u8>, RpcError> {
        let Some(external_id) = &rec.external_id else {
            return Ok(rec.key_material.clone());
        };
        let Some(kmip) = &self.kmip else {
            return Err(RpcError::new(
                ErrorCode::ConfigInvalid,
                format!(
                    "record {} is KMIP-backed but no KMIP server is configured",
                    rec.uuid
                ),
            ));
        };
        let kmip = kmip.clone();
        let external_id = external_id.clone();
        tokio::task::spawn_blocking(move || kmip.get_key(&external_id))
            .await
            .map_err(internal)?
            .map_err(kmip_error)
    }

    // ── Liveness reports ──────────────────────────────────────────────

    fn report_alive(
        &self,
        peer: &Peer,
        req: ReportAliveRequest,
    ) -> Result<serde_json::Value, RpcError> {
        let now = self.now();
        let mut reply = ReportAliveReply::default();
        let mut db = self.db.lock().unwrap();
        for uuid in &req.uuids {
            let Some(rec) = db.get_by_uuid(uuid) else {
                reply.rejected_uuids.push(uuid.clone());
                continue;
            };
            let mut rec = rec.clone();
            rec.remove_dead_hosts(now);
            // a dead or never-seen holder is told to let go of the key
            if !rec.alive_messages.contains_key(&peer.ip) {
                reply.rejected_uuids.push(uuid.clone());
                continue;
            }
            rec.record_alive(now, &peer.ip, &req.hostname);
            db.upsert(rec)?;
        }
        ok(reply)
    }
}

fn ok<T: serde::Serialize>(value: T) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(value).map_err(internal)
}

fn internal(e: impl std::fmt::Display) -> RpcError {
    RpcError::new(ErrorCode::Internal, e.to_string())
}

fn kmip_error(e: KmipError) -> RpcError {
    let code = match &e {
        KmipError::Network(_) => ErrorCode::Network,
        KmipError::Tls(_) => ErrorCode::Tls,
        KmipError::ProtocolMismatch(_) => ErrorCode::ProtocolMismatch,
        KmipError::Failure { .. } => ErrorCode::KmipFailure,
        KmipError::Config(_) => ErrorCode::ConfigInvalid,
    };
    RpcError::new(code, e.to_string())
}

/// Short human-friendly identifier: the mount point's base name, or a
/// uuid prefix when the mount point gives nothing usable.
fn short_id(mount_point: &str, uuid: &str) -> String {
    match mount_point.trim_end_matches('/').rsplit('/').next() {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => uuid.chars().take(8).collect(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthSecret;
    use keyward_keydb::PendingCommand;
    use keyward_proto::{EraseKeyRequest, PingRequest, PollCommandRequest, ReloadRecordRequest, SaveCommandResultRequest, ShutdownRequest};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    const PASSWORD: &str = "unit test password";

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("keyward-service-{name}-{nanos}"))
    }

    fn test_config(dir: &std::path::Path, with_auth: bool) -> ServerConfig {
        let auth = with_auth.then(|| {
            let salt = keyward_crypto::new_salt();
            let hash = keyward_crypto::hash_password(&salt, PASSWORD);
            AuthSecret { salt, hash }
        });
        ServerConfig {
            keydb_dir: dir.to_path_buf(),
            listen_addr: "127.0.0.1".into(),
            listen_port: 0,
            tls_cert: PathBuf::from("/unused/tls.crt"),
            tls_key: PathBuf::from("/unused/tls.key"),
            tls_ca: None,
            tls_validate_client: false,
            auth,
            kmip: None,
        }
    }

    fn service(name: &str) -> Arc<KeyService> {
        let dir = temp_dir(name);
        KeyService::new(test_config(&dir, true), Mailer::default()).unwrap()
    }

    async fn create(
        service: &KeyService,
        max_active: u32,
        interval: i64,
        count: u32,
    ) -> (String, Vec<u8>) {
        let reply = service
            .dispatch(
                &Peer::remote("10.9.9.9"),
                Request::CreateKey(CreateKeyRequest {
                    password: PASSWORD.into(),
                    uuid: None,
                    mount_point: "/srv/data".into(),
                    mount_options: vec!["rw".into()],
                    max_active,
                    alive_interval_sec: interval,
                    alive_count: count,
                }),
            )
            .await
            .unwrap();
        let reply: CreateKeyReply = serde_json::from_value(reply).unwrap();
        (reply.uuid, reply.key)
    }

    async fn auto_retrieve(service: &KeyService, ip: &str, uuid: &str) -> RetrieveKeyReply {
        let value = service
            .dispatch(
                &Peer::remote(ip),
                Request::AutoRetrieveKey(AutoRetrieveKeyRequest {
                    uuids: vec![uuid.into()],
                    hostname: format!("host-{ip}"),
                }),
            )
            .await
            .unwrap();
        serde_json::from_value(value).unwrap()
    }

    /// Rewrite a holder's alive messages to lie `age` seconds in the
    /// past, simulating silence without sleeping.
    fn age_holder(service: &KeyService, uuid: &str, ip: &str, age: i64) {
        let mut db = service.db.lock().unwrap();
        let mut rec = db.get_by_uuid(uuid).unwrap().clone();
        if let Some(msgs) = rec.alive_messages.get_mut(ip) {
            for msg in msgs {
                msg.timestamp -= age;
            }
        }
        db.upsert(rec).unwrap();
    }

    // ── Capacity ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn third_host_is_rejected_at_capacity_two() {
        let service = service("capacity");
        let (uuid, key) = create(&service, 2, 1, 3).await;
        assert_eq!(key.len(), keyward_crypto::KEY_LEN);

        let first = auto_retrieve(&service, "10.0.0.1", &uuid).await;
        assert_eq!(first.granted[&uuid].key, key);
        let second = auto_retrieve(&service, "10.0.0.2", &uuid).await;
        assert!(second.granted.contains_key(&uuid));
        let third = auto_retrieve(&service, "10.0.0.3", &uuid).await;
        assert!(third.granted.is_empty());
        assert_eq!(third.rejected_uuids, vec![uuid.clone()]);
    }

    #[tokio::test]
    async fn existing_holder_regrant_does_not_consume_capacity() {
        let service = service("regrant");
        let (uuid, _) = create(&service, 1, 60, 3).await;
        assert!(auto_retrieve(&service, "10.0.0.1", &uuid)
            .await
            .granted
            .contains_key(&uuid));
        // the same host asking again is a refresh, not a second slot
        assert!(auto_retrieve(&service, "10.0.0.1", &uuid)
            .await
            .granted
            .contains_key(&uuid));
        assert!(auto_retrieve(&service, "10.0.0.2", &uuid)
            .await
            .rejected_uuids
            .contains(&uuid));
    }

    #[tokio::test]
    async fn silent_holders_free_their_slots() {
        let service = service("expiry");
        let (uuid, _) = create(&service, 2, 1, 3).await;
        auto_retrieve(&service, "10.0.0.1", &uuid).await;
        auto_retrieve(&service, "10.0.0.2", &uuid).await;
        assert!(auto_retrieve(&service, "10.0.0.4", &uuid)
            .await
            .rejected_uuids
            .contains(&uuid));

        // both holders fall silent past the 3-second window
        age_holder(&service, &uuid, "10.0.0.1", 4);
        age_holder(&service, &uuid, "10.0.0.2", 4);
        let fourth = auto_retrieve(&service, "10.0.0.4", &uuid).await;
        assert!(fourth.granted.contains_key(&uuid));
    }

    #[tokio::test]
    async fn unknown_uuid_lands_in_missing() {
        let service = service("missing");
        let reply = auto_retrieve(&service, "10.0.0.1", "no-such-uuid").await;
        assert_eq!(reply.missing_uuids, vec!["no-such-uuid".to_string()]);
        assert!(reply.granted.is_empty());
        assert!(reply.rejected_uuids.is_empty());
    }

    // ── Manual override ───────────────────────────────────────────────

    #[tokio::test]
    async fn manual_retrieve_overrides_the_cap_but_does_not_lift_it() {
        let service = service("manual");
        let (uuid, _) = create(&service, 1, 60, 3).await;
        auto_retrieve(&service, "10.0.0.1", &uuid).await;

        let value = service
            .dispatch(
                &Peer::remote("10.0.0.9"),
                Request::ManualRetrieveKey(ManualRetrieveKeyRequest {
                    password: PASSWORD.into(),
                    uuids: vec![uuid.clone()],
                    hostname: "override-host".into(),
                }),
            )
            .await
            .unwrap();
        let reply: RetrieveKeyReply = serde_json::from_value(value).unwrap();
        assert!(reply.granted.contains_key(&uuid));

        // the cap still binds for password-less callers
        assert!(auto_retrieve(&service, "10.0.0.5", &uuid)
            .await
            .rejected_uuids
            .contains(&uuid));
    }

    #[tokio::test]
    async fn manual_retrieve_with_wrong_password_is_refused() {
        let service = service("manual-pw");
        let (uuid, _) = create(&service, 1, 60, 3).await;
        let err = service
            .dispatch(
                &Peer::remote("10.0.0.9"),
                Request::ManualRetrieveKey(ManualRetrieveKeyRequest {
                    password: "wrong".into(),
                    uuids: vec![uuid],
                    hostname: "h".into(),
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPassword);
    }

    // ── Liveness reports ──────────────────────────────────────────────

    #[tokio::test]
    async fn alive_holder_keeps_reporting() {
        let service = service("alive");
        let (uuid, _) = create(&service, 2, 60, 3).await;
        auto_retrieve(&service, "10.0.0.1", &uuid).await;

        let value = service
            .dispatch(
                &Peer::remote("10.0.0.1"),
                Request::ReportAlive(ReportAliveRequest {
                    uuids: vec![uuid.clone()],
                    hostname: "host-a".into(),
                }),
            )
            .await
            .unwrap();
        let reply: ReportAliveReply = serde_json::from_value(value).unwrap();
        assert!(reply.rejected_uuids.is_empty());
    }

    #[tokio::test]
    async fn silence_revokes_the_holder() {
        let service = service("revoke");
        let (uuid, _) = create(&service, 2, 1, 2).await;
        auto_retrieve(&service, "10.0.0.1", &uuid).await;
        // silent past interval*count plus a margin
        age_holder(&service, &uuid, "10.0.0.1", 3);

        let value = service
            .dispatch(
                &Peer::remote("10.0.0.1"),
                Request::ReportAlive(ReportAliveRequest {
                    uuids: vec![uuid.clone()],
                    hostname: "host-a".into(),
                }),
            )
            .await
            .unwrap();
        let reply: ReportAliveReply = serde_json::from_value(value).unwrap();
        assert_eq!(reply.rejected_uuids, vec![uuid]);
    }

    #[tokio::test]
    async fn stranger_reporting_alive_is_rejected() {
        let service = service("stranger");
        let (uuid, _) = create(&service, 2, 60, 3).await;
        let value = service
            .dispatch(
                &Peer::remote("10.0.0.200"),
                Request::ReportAlive(ReportAliveRequest {
                    uuids: vec![uuid.clone(), "missing-uuid".into()],
                    hostname: "h".into(),
                }),
            )
            .await
            .unwrap();
        let reply: ReportAliveReply = serde_json::from_value(value).unwrap();
        assert_eq!(reply.rejected_uuids, vec![uuid, "missing-uuid".to_string()]);
    }

    // ── Pending commands ──────────────────────────────────────────────

    #[tokio::test]
    async fn pending_command_round_trip() {
        let service = service("commands");
        let (uuid, _) = create(&service, 2, 60, 3).await;
        {
            let mut db = service.db.lock().unwrap();
            let mut rec = db.get_by_uuid(&uuid).unwrap().clone();
            rec.add_pending_command(
                "1.2.3.4",
                PendingCommand {
                    valid_from: service.now(),
                    validity_sec: 600,
                    content: keyward_keydb::COMMAND_UMOUNT.into(),
                    seen_by_client: false,
                    client_result: String::new(),
                },
            );
            db.upsert(rec).unwrap();
        }

        // the addressed host polls and receives the command
        let value = service
            .dispatch(
                &Peer::remote("1.2.3.4"),
                Request::PollCommand(PollCommandRequest { uuid: uuid.clone() }),
            )
            .await
            .unwrap();
        let reply: PollCommandReply = serde_json::from_value(value).unwrap();
        let cmd = reply.command.unwrap();
        assert_eq!(cmd.content, keyward_keydb::COMMAND_UMOUNT);
        assert!(cmd.seen_by_client);

        service
            .dispatch(
                &Peer::remote("1.2.3.4"),
                Request::SaveCommandResult(SaveCommandResultRequest {
                    uuid: uuid.clone(),
                    result: "ok".into(),
                }),
            )
            .await
            .unwrap();
        {
            let db = service.db.lock().unwrap();
            let rec = db.get_by_uuid(&uuid).unwrap();
            assert_eq!(rec.pending_commands["1.2.3.4"][0].client_result, "ok");
        }

        // delivered once; a second poll is empty
        let value = service
            .dispatch(
                &Peer::remote("1.2.3.4"),
                Request::PollCommand(PollCommandRequest { uuid: uuid.clone() }),
            )
            .await
            .unwrap();
        let reply: PollCommandReply = serde_json::from_value(value).unwrap();
        assert!(reply.command.is_none());
    }

    #[tokio::test]
    async fn poll_for_unknown_uuid_is_an_error() {
        let service = service("poll-unknown");
        let err = service
            .dispatch(
                &Peer::remote("1.2.3.4"),
                Request::PollCommand(PollCommandRequest {
                    uuid: "nope".into(),
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownUuid);
    }

    // ── Erase / reload ────────────────────────────────────────────────

    #[tokio::test]
    async fn erase_requires_password_even_for_local_admin() {
        let service = service("erase-auth");
        let (uuid, _) = create(&service, 2, 60, 3).await;
        let err = service
            .dispatch(
                &Peer::local_admin(),
                Request::EraseKey(EraseKeyRequest {
                    password: "wrong".into(),
                    uuid: uuid.clone(),
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPassword);

        service
            .dispatch(
                &Peer::local_admin(),
                Request::EraseKey(EraseKeyRequest {
                    password: PASSWORD.into(),
                    uuid: uuid.clone(),
                }),
            )
            .await
            .unwrap();
        assert!(service.db.lock().unwrap().get_by_uuid(&uuid).is_none());
    }

    #[tokio::test]
    async fn local_admin_pings_without_password() {
        let service = service("local-ping");
        service
            .dispatch(
                &Peer::local_admin(),
                Request::Ping(PingRequest {
                    password: String::new(),
                }),
            )
            .await
            .unwrap();
        // remote caller with the same empty password is refused
        let err = service
            .dispatch(
                &Peer::remote("10.0.0.7"),
                Request::Ping(PingRequest {
                    password: String::new(),
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPassword);
    }

    #[tokio::test]
    async fn reload_record_sees_outside_edits() {
        let service = service("reload");
        let (uuid, _) = create(&service, 2, 60, 3).await;

        // edit behind the daemon's back, the way the admin CLI does
        let dir = service.config.keydb_dir.clone();
        let mut outside = KeyDb::open_one(&dir, &uuid).unwrap();
        let mut rec = outside.get_by_uuid(&uuid).unwrap().clone();
        rec.mount_point = "/srv/elsewhere".into();
        outside.upsert(rec).unwrap();

        service
            .dispatch(
                &Peer::local_admin(),
                Request::ReloadRecord(ReloadRecordRequest {
                    password: PASSWORD.into(),
                    uuid: uuid.clone(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            service.db.lock().unwrap().get_by_uuid(&uuid).unwrap().mount_point,
            "/srv/elsewhere"
        );
    }

    // ── Restricted mode and shutdown ──────────────────────────────────

    #[tokio::test]
    async fn unconfigured_server_only_answers_ping_and_get_salt() {
        let dir = temp_dir("restricted");
        let service = KeyService::new(test_config(&dir, false), Mailer::default()).unwrap();

        for request in [
            Request::Ping(PingRequest {
                password: "x".into(),
            }),
            Request::GetSalt,
            Request::CreateKey(CreateKeyRequest {
                password: "x".into(),
                uuid: None,
                mount_point: "/srv".into(),
                mount_options: vec![],
                max_active: 1,
                alive_interval_sec: 10,
                alive_count: 3,
            }),
            Request::ReportAlive(ReportAliveRequest {
                uuids: vec!["u".into()],
                hostname: "h".into(),
            }),
        ] {
            let err = service
                .dispatch(&Peer::remote("10.0.0.1"), request)
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::NotInitialized);
        }
    }

    #[tokio::test]
    async fn get_salt_hands_out_the_configured_salt() {
        let service = service("salt");
        let value = service
            .dispatch(&Peer::remote("10.0.0.1"), Request::GetSalt)
            .await
            .unwrap();
        let reply: SaltReply = serde_json::from_value(value).unwrap();
        assert_eq!(reply.salt.len(), keyward_crypto::SALT_LEN);
    }

    #[tokio::test]
    async fn shutdown_needs_the_minted_challenge() {
        let service = service("shutdown");
        let err = service
            .dispatch(
                &Peer::remote("10.0.0.1"),
                Request::Shutdown(ShutdownRequest {
                    challenge: "guessed".into(),
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadPassword);
        assert!(!service.cancel_token().is_cancelled());

        service
            .dispatch(
                &Peer::remote("10.0.0.1"),
                Request::Shutdown(ShutdownRequest {
                    challenge: service.admin_challenge().to_string(),
                }),
            )
            .await
            .unwrap();
        assert!(service.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn duplicate_uuid_create_is_refused() {
        let service = service("dup");
        let (uuid, _) = create(&service, 1, 10, 3).await;
        let err = service
            .dispatch(
                &Peer::remote("10.9.9.9"),
                Request::CreateKey(CreateKeyRequest {
                    password: PASSWORD.into(),
                    uuid: Some(uuid),
                    mount_point: "/srv/data".into(),
                    mount_options: vec![],
                    max_active: 1,
                    alive_interval_sec: 10,
                    alive_count: 3,
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn create_rejects_non_canonical_uuids() {
        let service = service("uuid-shape");
        // the uuid becomes the record file name; anything that is not
        // the exact 8-4-4-4-12 form must be refused
        for bad in [
            "/etc/cron.d/x",
            "../../../../tmp/x",
            "not-a-uuid",
            "5F0A3F7E-8C89-4D8F-B9C7-2F43D0A0F601",
            "5f0a3f7e8c894d8fb9c72f43d0a0f601",
            "urn:uuid:5f0a3f7e-8c89-4d8f-b9c7-2f43d0a0f601",
        ] {
            let err = service
                .dispatch(
                    &Peer::remote("10.9.9.9"),
                    Request::CreateKey(CreateKeyRequest {
                        password: PASSWORD.into(),
                        uuid: Some(bad.into()),
                        mount_point: "/srv/data".into(),
                        mount_options: vec![],
                        max_active: 1,
                        alive_interval_sec: 10,
                        alive_count: 3,
                    }),
                )
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::BadRequest, "accepted {bad:?}");
        }

        // the canonical form is accepted verbatim
        let value = service
            .dispatch(
                &Peer::remote("10.9.9.9"),
                Request::CreateKey(CreateKeyRequest {
                    password: PASSWORD.into(),
                    uuid: Some("5f0a3f7e-8c89-4d8f-b9c7-2f43d0a0f601".into()),
                    mount_point: "/srv/data".into(),
                    mount_options: vec![],
                    max_active: 1,
                    alive_interval_sec: 10,
                    alive_count: 3,
                }),
            )
            .await
            .unwrap();
        let reply: CreateKeyReply = serde_json::from_value(value).unwrap();
        assert_eq!(reply.uuid, "5f0a3f7e-8c89-4d8f-b9c7-2f43d0a0f601");
    }

    #[test]
    fn short_id_prefers_mount_basename() {
        assert_eq!(short_id("/srv/data", "abcdef01-23"), "data");
        assert_eq!(short_id("/", "abcdef01-23"), "abcdef01");
        assert_eq!(short_id("", "abcdef01-23"), "abcdef01");
    }
}
