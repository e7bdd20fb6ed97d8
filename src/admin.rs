//! Non-interactive admin operations.
//!
//! These run as root on the server box. Read-only commands open the
//! record store directly; mutating commands write one record via
//! `open_one`, then tell the running daemon to reload it through the
//! Unix socket so the in-memory copy catches up.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};

use keyward_client::KeywardClient;
use keyward_keydb::{KeyDb, PendingCommand, COMMAND_MOUNT, COMMAND_UMOUNT};

use crate::config::{ServerConfig, CONF_KEYDB_DIR};
use crate::sysconfig::Sysconfig;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn keydb_dir(config_path: &Path) -> anyhow::Result<PathBuf> {
    let sysconf = Sysconfig::load(config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    ServerConfig::from_sysconfig(&sysconf)
        .map(|c| c.keydb_dir)
        .or_else(|_| {
            // a partially initialised server may still have a keydb
            sysconf
                .get(CONF_KEYDB_DIR)
                .map(PathBuf::from)
                .context("key database directory is not configured")
        })
}

fn format_epoch(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "-".into())
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// `list-keys`: all records, most recently used first.
pub fn list_keys(config_path: &Path) -> anyhow::Result<()> {
    let db = KeyDb::open_all(keydb_dir(config_path)?)?;
    println!("Total: {} records", db.len());
    println!(
        "{:<15} {:<19} {:<12} {:<36} {:>9} {:>9} Mount Point",
        "Used By", "When", "ID", "UUID", "Max.Users", "Num.Users"
    );
    let now = now_epoch();
    for rec in db.list() {
        let mut rec = rec.clone();
        rec.remove_dead_hosts(now);
        println!(
            "{:<15} {:<19} {:<12} {:<36} {:>9} {:>9} {}",
            rec.last_retrieval.ip,
            format_epoch(rec.last_retrieval.timestamp),
            rec.id,
            rec.uuid,
            rec.max_active,
            rec.alive_holder_count(),
            rec.mount_point
        );
    }
    Ok(())
}

/// `show-key`: one record in detail; key material is never printed.
pub fn show_key(config_path: &Path, uuid: &str) -> anyhow::Result<()> {
    let db = KeyDb::open_one(keydb_dir(config_path)?, uuid)?;
    let rec = db
        .get_by_uuid(uuid)
        .with_context(|| format!("no record for uuid {uuid}"))?;
    let mut rec = rec.clone();
    rec.remove_dead_hosts(now_epoch());

    println!("{:<34}{}", "UUID", rec.uuid);
    println!("{:<34}{}", "Mount Point", rec.mount_point);
    println!("{:<34}{}", "Mount Options", rec.mount_options_str());
    println!("{:<34}{}", "Maximum Computers", rec.max_active);
    println!("{:<34}{}", "Keep-Alive Timeout (sec)", rec.alive_window_sec());
    println!(
        "{:<34}{} ({})",
        "Last Retrieved By", rec.last_retrieval.ip, rec.last_retrieval.hostname
    );
    println!(
        "{:<34}{}",
        "Last Retrieved On",
        format_epoch(rec.last_retrieval.timestamp)
    );
    println!("{:<34}{}", "Current Active Computers", rec.alive_holder_count());
    for msgs in rec.alive_messages.values() {
        for msg in msgs {
            println!(
                "{:<34}{} {} ({})",
                "",
                format_epoch(msg.timestamp),
                msg.ip,
                msg.hostname
            );
        }
    }
    let pending: usize = rec.pending_commands.values().map(Vec::len).sum();
    println!("{:<34}{}", "Pending Commands", pending);
    for (ip, cmds) in &rec.pending_commands {
        for cmd in cmds {
            println!(
                "{ip:>45}\tValidFrom=\"{}\"\tValidTo=\"{}\"\tContent=\"{}\"\tFetched? {}\tResult=\"{}\"",
                format_epoch(cmd.valid_from),
                format_epoch(cmd.valid_from + cmd.validity_sec),
                cmd.content,
                cmd.seen_by_client,
                cmd.client_result
            );
        }
    }
    Ok(())
}

/// Fields of `edit-key`; unset flags leave the record untouched.
#[derive(Debug, Default)]
pub struct EditKeyArgs {
    pub mount_point: Option<String>,
    pub mount_options: Option<String>,
    pub max_active: Option<u32>,
    pub alive_interval_sec: Option<i64>,
    pub alive_count: Option<u32>,
}

/// `edit-key`: update policy fields on disk, then ask the daemon to
/// reload the record.
pub fn edit_key(
    config_path: &Path,
    socket: &Path,
    uuid: &str,
    password: &str,
    args: EditKeyArgs,
) -> anyhow::Result<()> {
    let mut db = KeyDb::open_one(keydb_dir(config_path)?, uuid)?;
    let mut rec = db
        .get_by_uuid(uuid)
        .with_context(|| format!("no record for uuid {uuid}"))?
        .clone();
    if let Some(mount_point) = args.mount_point {
        rec.mount_point = mount_point;
    }
    if let Some(options) = args.mount_options {
        rec.mount_options = options.split(',').map(str::to_string).collect();
    }
    if let Some(max_active) = args.max_active {
        anyhow::ensure!(max_active >= 1, "max-active must be at least 1");
        rec.max_active = max_active;
    }
    if let Some(interval) = args.alive_interval_sec {
        anyhow::ensure!(interval >= 1, "alive-interval-sec must be at least 1");
        rec.alive_interval_sec = interval;
    }
    if let Some(count) = args.alive_count {
        anyhow::ensure!(count >= 1, "alive-count must be at least 1");
        rec.alive_count = count;
    }
    db.upsert(rec)?;
    reload(socket, password, uuid)?;
    println!("Record {uuid} updated.");
    Ok(())
}

/// `send-command`: queue a mount/umount instruction for one holder IP.
pub fn send_command(
    config_path: &Path,
    socket: &Path,
    uuid: &str,
    ip: &str,
    command: &str,
    expire_min: i64,
    password: &str,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        command == COMMAND_MOUNT || command == COMMAND_UMOUNT,
        "command must be {COMMAND_MOUNT} or {COMMAND_UMOUNT}"
    );
    anyhow::ensure!(expire_min >= 1, "expire-min must be at least 1");
    let mut db = KeyDb::open_one(keydb_dir(config_path)?, uuid)?;
    let mut rec = db
        .get_by_uuid(uuid)
        .with_context(|| format!("no record for uuid {uuid}"))?
        .clone();
    rec.add_pending_command(
        ip,
        PendingCommand {
            valid_from: now_epoch(),
            validity_sec: expire_min * 60,
            content: command.to_string(),
            seen_by_client: false,
            client_result: String::new(),
        },
    );
    db.upsert(rec)?;
    reload(socket, password, uuid)?;
    println!("Computer {ip} will receive the command on its next poll.");
    Ok(())
}

/// `clear-commands`: drop every queued command on a record.
pub fn clear_commands(
    config_path: &Path,
    socket: &Path,
    uuid: &str,
    password: &str,
) -> anyhow::Result<()> {
    let mut db = KeyDb::open_one(keydb_dir(config_path)?, uuid)?;
    let mut rec = db
        .get_by_uuid(uuid)
        .with_context(|| format!("no record for uuid {uuid}"))?
        .clone();
    rec.clear_pending_commands();
    db.upsert(rec)?;
    reload(socket, password, uuid)?;
    println!("All pending commands of {uuid} cleared.");
    Ok(())
}

/// `gen-cert`: a self-signed PEM pair for evaluation setups where no
/// organisation CA is available.
pub fn gen_cert(common_name: &str, out_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let cert = rcgen::generate_simple_self_signed(vec![common_name.to_string()])?;
    let cert_path = out_dir.join(format!("{common_name}.crt"));
    let key_path = out_dir.join(format!("{common_name}.key"));
    std::fs::write(&cert_path, cert.serialize_pem()?)?;
    std::fs::write(&key_path, cert.serialize_private_key_pem())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }
    println!("Wrote {} and {}", cert_path.display(), key_path.display());
    Ok(())
}

/// Tell the running daemon to re-read the record we just wrote. A
/// daemon that is not running is fine; it loads the record at next
/// start.
fn reload(socket: &Path, password: &str, uuid: &str) -> anyhow::Result<()> {
    let client = KeywardClient::unix(socket);
    match client.reload_record(password, uuid) {
        Ok(()) => Ok(()),
        Err(keyward_client::ClientError::Unreachable(e)) => {
            tracing::warn!(error = %e, "daemon not reachable; record takes effect at next start");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
