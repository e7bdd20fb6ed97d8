//! Server configuration, immutable after startup.
//!
//! Values come from the sysconfig file at [`DEFAULT_CONFIG_PATH`].
//! Mandatory keys that are missing or malformed abort startup with a
//! config error. A missing password salt/hash pair is *not* fatal: the
//! daemon then runs in a restricted mode until the operator finishes
//! the initial setup.

use std::path::PathBuf;
use std::time::Duration;

use keyward_crypto::{hash_from_hex, salt_from_hex, HASH_LEN, SALT_LEN};
use keyward_kmip::KmipConfig;
use keyward_proto::DEFAULT_PORT;

use crate::sysconfig::Sysconfig;

/// Where the operator-managed sysconfig file lives.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sysconfig/keyward-server";

pub const CONF_KEYDB_DIR: &str = "KEYDB_DIR";
pub const CONF_LISTEN_ADDR: &str = "LISTEN_ADDR";
pub const CONF_LISTEN_PORT: &str = "LISTEN_PORT";
pub const CONF_TLS_CERT: &str = "TLS_CERT";
pub const CONF_TLS_KEY: &str = "TLS_KEY";
pub const CONF_TLS_CA: &str = "TLS_CA";
pub const CONF_TLS_VALIDATE_CLIENT: &str = "TLS_VALIDATE_CLIENT";
pub const CONF_PASS_SALT: &str = "PASS_SALT";
pub const CONF_PASS_HASH: &str = "PASS_HASH";
pub const CONF_KMIP_SERVER_ADDRS: &str = "KMIP_SERVER_ADDRS";
pub const CONF_KMIP_SERVER_USER: &str = "KMIP_SERVER_USER";
pub const CONF_KMIP_SERVER_PASS: &str = "KMIP_SERVER_PASS";
pub const CONF_KMIP_SERVER_TLS_CA: &str = "KMIP_SERVER_TLS_CA";
pub const CONF_KMIP_SERVER_TLS_CERT: &str = "KMIP_SERVER_TLS_CERT";
pub const CONF_KMIP_SERVER_TLS_KEY: &str = "KMIP_SERVER_TLS_KEY";
pub const CONF_KMIP_DIAL_TIMEOUT_SEC: &str = "KMIP_DIAL_TIMEOUT_SEC";

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// The stored access-password verifier.
#[derive(Clone)]
pub struct AuthSecret {
    pub salt: [u8; SALT_LEN],
    pub hash: [u8; HASH_LEN],
}

impl std::fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthSecret(..)")
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub keydb_dir: PathBuf,
    pub listen_addr: String,
    pub listen_port: u16,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    /// CA that must have issued client certificates, when
    /// `tls_validate_client` is on.
    pub tls_ca: Option<PathBuf>,
    pub tls_validate_client: bool,
    /// Absent until the operator sets an access password; the daemon
    /// then answers nothing but Ping and GetSalt.
    pub auth: Option<AuthSecret>,
    /// Present when keys are escrowed on a KMIP appliance.
    pub kmip: Option<KmipConfig>,
}

impl ServerConfig {
    pub fn from_sysconfig(conf: &Sysconfig) -> Result<Self, ConfigError> {
        let keydb_dir = conf
            .get(CONF_KEYDB_DIR)
            .map(PathBuf::from)
            .ok_or_else(|| missing(CONF_KEYDB_DIR))?;
        let tls_cert = conf
            .get(CONF_TLS_CERT)
            .map(PathBuf::from)
            .ok_or_else(|| missing(CONF_TLS_CERT))?;
        let tls_key = conf
            .get(CONF_TLS_KEY)
            .map(PathBuf::from)
            .ok_or_else(|| missing(CONF_TLS_KEY))?;

        let listen_addr = conf.get_string(CONF_LISTEN_ADDR, "0.0.0.0");
        let listen_port = match conf.get_int::<u16>(CONF_LISTEN_PORT) {
            None => DEFAULT_PORT,
            Some(Ok(port)) => port,
            Some(Err(_)) => {
                return Err(ConfigError(format!(
                    "{CONF_LISTEN_PORT} is not a valid port number"
                )))
            }
        };

        let tls_ca = conf.get(CONF_TLS_CA).map(PathBuf::from);
        let tls_validate_client = conf.get_bool(CONF_TLS_VALIDATE_CLIENT);
        if tls_validate_client && tls_ca.is_none() {
            return Err(ConfigError(format!(
                "{CONF_TLS_VALIDATE_CLIENT} requires {CONF_TLS_CA}"
            )));
        }

        let auth = match (conf.get(CONF_PASS_SALT), conf.get(CONF_PASS_HASH)) {
            (Some(salt), Some(hash)) => Some(AuthSecret {
                salt: salt_from_hex(salt).map_err(|e| ConfigError(e.to_string()))?,
                hash: hash_from_hex(hash).map_err(|e| ConfigError(e.to_string()))?,
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError(format!(
                    "{CONF_PASS_SALT} and {CONF_PASS_HASH} must be set together"
                )))
            }
        };

        let kmip_servers = conf.get_list(CONF_KMIP_SERVER_ADDRS);
        let kmip = if kmip_servers.is_empty() {
            None
        } else {
            let dial_timeout = match conf.get_int::<u64>(CONF_KMIP_DIAL_TIMEOUT_SEC) {
                None => None,
                Some(Ok(secs)) => Some(Duration::from_secs(secs)),
                Some(Err(_)) => {
                    return Err(ConfigError(format!(
                        "{CONF_KMIP_DIAL_TIMEOUT_SEC} is not a number of seconds"
                    )))
                }
            };
            Some(KmipConfig {
                servers: kmip_servers,
                username: conf.get(CONF_KMIP_SERVER_USER).map(str::to_string),
                password: conf.get(CONF_KMIP_SERVER_PASS).map(str::to_string),
                ca_file: conf.get(CONF_KMIP_SERVER_TLS_CA).map(PathBuf::from),
                cert_file: conf.get(CONF_KMIP_SERVER_TLS_CERT).map(PathBuf::from),
                key_file: conf.get(CONF_KMIP_SERVER_TLS_KEY).map(PathBuf::from),
                dial_timeout,
            })
        };

        Ok(ServerConfig {
            keydb_dir,
            listen_addr,
            listen_port,
            tls_cert,
            tls_key,
            tls_ca,
            tls_validate_client,
            auth,
            kmip,
        })
    }
}

fn missing(key: &str) -> ConfigError {
    ConfigError(format!("mandatory key {key} is missing"))
}

// ── Tests ─────────────────────────────────────────────────────────────
