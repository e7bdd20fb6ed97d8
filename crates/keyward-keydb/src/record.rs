//! The key record and its liveness state machine.
//!
//! A record tracks which hosts ("holders") currently possess its key.
//! Holders prove possession by periodic alive reports; a holder whose
//! newest report is older than `alive_interval_sec * alive_count`
//! seconds is dead and frees a capacity slot. All clock inputs are
//! passed in as unix seconds so the arithmetic is testable; callers use
//! the server's wall clock, never timestamps supplied by clients.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Pending command content telling a holder to mount its disk.
pub const COMMAND_MOUNT: &str = "mount";
/// Pending command content telling a holder to unmount its disk.
pub const COMMAND_UMOUNT: &str = "umount";

/// A single alive report from a holder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AliveMessage {
    pub timestamp: i64,
    pub ip: String,
    pub hostname: String,
}

/// An administrator-scheduled instruction delivered to one holder IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Unix seconds from which the command is valid.
    pub valid_from: i64,
    /// Seconds after `valid_from` during which the command (and its
    /// result) stay alive.
    pub validity_sec: i64,
    pub content: String,
    #[serde(default)]
    pub seen_by_client: bool,
    #[serde(default)]
    pub client_result: String,
}

impl PendingCommand {
    pub fn expired(&self, now: i64) -> bool {
        now > self.valid_from + self.validity_sec
    }
}

/// The unit of persistence: one encryption key with its policy,
/// liveness state and queued commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRecord {
    /// Canonical identifier, 8-4-4-4-12 hex.
    pub uuid: String,
    /// Short human-friendly identifier shown in listings.
    pub id: String,
    /// Unix seconds of record creation.
    pub creation_time: i64,
    /// Raw key bytes. Empty when the key lives on a KMIP appliance, in
    /// which case `external_id` references the remote object.
    pub key_material: Vec<u8>,
    pub external_id: Option<String>,
    /// Advisory mount location handed back to holders.
    pub mount_point: String,
    pub mount_options: Vec<String>,
    /// Maximum number of distinct hosts that may concurrently hold the
    /// key via password-less retrieval.
    pub max_active: u32,
    pub alive_interval_sec: i64,
    pub alive_count: u32,
    /// Holder IP -> recent alive reports, oldest first, at most
    /// `alive_count` per holder.
    pub alive_messages: HashMap<String, Vec<AliveMessage>>,
    /// The most recent grant of this key.
    pub last_retrieval: AliveMessage,
    /// Target IP -> queued commands, oldest first.
    pub pending_commands: HashMap<String, Vec<PendingCommand>>,
}

impl KeyRecord {
    /// Seconds of silence after which a holder is dead.
    pub fn alive_window_sec(&self) -> i64 {
        self.alive_interval_sec * i64::from(self.alive_count)
    }

    /// Comma-joined mount options for display.
    pub fn mount_options_str(&self) -> String {
        self.mount_options.join(",")
    }

    // ── Liveness ──────────────────────────────────────────────────────

    /// Drop every holder whose newest report fell out of the alive
    /// window and compact the surviving queues to the most recent
    /// `alive_count` entries. Applied before every capacity decision
    /// and before every serialized response.
    pub fn remove_dead_hosts(&mut self, now: i64) {
        let window = self.alive_window_sec();
        let cap = self.alive_count as usize;
        self.alive_messages.retain(|_, msgs| {
            if msgs.len() > cap {
                msgs.drain(..msgs.len() - cap);
            }
            match msgs.last() {
                Some(newest) => now - newest.timestamp <= window,
                None => false,
            }
        });
    }

    /// Whether `ip` currently counts as an alive holder.
    pub fn is_alive_holder(&self, now: i64, ip: &str) -> bool {
        self.alive_messages
            .get(ip)
            .and_then(|msgs| msgs.last())
            .map(|newest| now - newest.timestamp <= self.alive_window_sec())
            .unwrap_or(false)
    }

    /// Number of alive holders. Callers run `remove_dead_hosts` first,
    /// so every remaining entry counts.
    pub fn alive_holder_count(&self) -> usize {
        self.alive_messages.len()
    }

    /// Append an alive report for `ip`, trimming its queue to
    /// `alive_count` entries.
    pub fn record_alive(&mut self, now: i64, ip: &str, hostname: &str) {
        let msgs = self.alive_messages.entry(ip.to_string()).or_default();
        msgs.push(AliveMessage {
            timestamp: now,
            ip: ip.to_string(),
            hostname: hostname.to_string(),
        });
        let cap = self.alive_count as usize;
        if msgs.len() > cap {
            msgs.drain(..msgs.len() - cap);
        }
    }

    /// Register a grant: refresh the caller's liveness and remember it
    /// as the most recent retriever.
    pub fn record_retrieval(&mut self, now: i64, ip: &str, hostname: &str) {
        self.record_alive(now, ip, hostname);
        self.last_retrieval = AliveMessage {
            timestamp: now,
            ip: ip.to_string(),
            hostname: hostname.to_string(),
        };
    }

    // ── Pending commands ──────────────────────────────────────────────

    /// Queue a command for `ip`.
    pub fn add_pending_command(&mut self, ip: &str, command: PendingCommand) {
        self.pending_commands
            .entry(ip.to_string())
            .or_default()
            .push(command);
    }

    /// Drop expired commands everywhere; holders with nothing left are
    /// removed entirely.
    pub fn purge_expired_commands(&mut self, now: i64) {
        self.pending_commands.retain(|_, cmds| {
            cmds.retain(|c| !c.expired(now));
            !cmds.is_empty()
        });
    }

    pub fn clear_pending_commands(&mut self) {
        self.pending_commands.clear();
    }

    /// Hand out the oldest not-yet-delivered command for `ip`, marking
    /// it as seen. Expired commands are purged first.
    pub fn poll_command(&mut self, now: i64, ip: &str) -> Option<PendingCommand> {
        self.purge_expired_commands(now);
        let cmds = self.pending_commands.get_mut(ip)?;
        let cmd = cmds.iter_mut().find(|c| !c.seen_by_client)?;
        cmd.seen_by_client = true;
        Some(cmd.clone())
    }

    /// Attach a client result to the most recently delivered command
    /// that is still waiting for one. Returns false when no delivered
    /// command is outstanding.
    pub fn save_command_result(&mut self, now: i64, ip: &str, result: &str) -> bool {
        self.purge_expired_commands(now);
        let Some(cmds) = self.pending_commands.get_mut(ip) else {
            return false;
        };
        match cmds
            .iter_mut()
            .rev()
            .find(|c| c.seen_by_client && c.client_result.is_empty())
        {
            Some(cmd) => {
                cmd.client_result = result.to_string();
                true
            }
            None => false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max_active: u32, interval: i64, count: u32) -> KeyRecord {
        KeyRecord {
            uuid: "5f0a3f7e-8c89-4d8f-b9c7-2f43d0a0f601".into(),
            id: "data".into(),
            creation_time: 1_000,
            key_material: vec![0x17; 32],
            max_active,
            alive_interval_sec: interval,
            alive_count: count,
            mount_point: "/srv/data".into(),
            mount_options: vec!["rw".into(), "noatime".into()],
            ..KeyRecord::default()
        }
    }

    fn command(valid_from: i64, validity: i64) -> PendingCommand {
        PendingCommand {
            valid_from,
            validity_sec: validity,
            content: COMMAND_UMOUNT.into(),
            seen_by_client: false,
            client_result: String::new(),
        }
    }

    // ── Liveness ──────────────────────────────────────────────────────

    #[test]
    fn alive_queue_never_exceeds_alive_count() {
        let mut rec = record(2, 10, 3);
        for t in 0..20 {
            rec.record_alive(t, "10.0.0.1", "h1");
            assert!(rec.alive_messages["10.0.0.1"].len() <= 3);
        }
        let msgs = &rec.alive_messages["10.0.0.1"];
        assert_eq!(
            msgs.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
            vec![17, 18, 19]
        );
    }

    #[test]
    fn holder_inside_window_is_alive() {
        let mut rec = record(2, 10, 3);
        rec.record_alive(100, "10.0.0.1", "h1");
        // window is 30s
        assert!(rec.is_alive_holder(129, "10.0.0.1"));
        assert!(rec.is_alive_holder(130, "10.0.0.1"));
        assert!(!rec.is_alive_holder(131, "10.0.0.1"));
    }

    #[test]
    fn remove_dead_hosts_drops_silent_holders() {
        let mut rec = record(2, 1, 3);
        rec.record_alive(0, "10.0.0.1", "h1");
        rec.record_alive(1, "10.0.0.1", "h1");
        rec.record_alive(2, "10.0.0.2", "h2");
        rec.remove_dead_hosts(4);
        // window 3s: h1 newest=1 is dead at t=4+, h2 newest=2 survives
        assert!(!rec.alive_messages.contains_key("10.0.0.1"));
        assert!(rec.alive_messages.contains_key("10.0.0.2"));
        assert_eq!(rec.alive_holder_count(), 1);
    }

    #[test]
    fn remove_dead_hosts_leaves_everyone_in_window() {
        let mut rec = record(2, 5, 2);
        rec.record_alive(10, "10.0.0.1", "h1");
        rec.record_alive(12, "10.0.0.2", "h2");
        rec.remove_dead_hosts(15);
        assert_eq!(rec.alive_holder_count(), 2);
        // postcondition: every survivor's newest report is in the window
        for msgs in rec.alive_messages.values() {
            assert!(15 - msgs.last().unwrap().timestamp <= rec.alive_window_sec());
        }
    }

    #[test]
    fn remove_dead_hosts_compacts_oversized_queues() {
        let mut rec = record(2, 10, 2);
        rec.alive_messages.insert(
            "10.0.0.1".into(),
            (0..5)
                .map(|t| AliveMessage {
                    timestamp: t,
                    ip: "10.0.0.1".into(),
                    hostname: "h1".into(),
                })
                .collect(),
        );
        rec.remove_dead_hosts(5);
        assert_eq!(rec.alive_messages["10.0.0.1"].len(), 2);
        assert_eq!(rec.alive_messages["10.0.0.1"][0].timestamp, 3);
    }

    #[test]
    fn retrieval_updates_last_retrieval_and_liveness() {
        let mut rec = record(2, 10, 3);
        rec.record_retrieval(50, "10.0.0.9", "h9");
        assert_eq!(rec.last_retrieval.timestamp, 50);
        assert_eq!(rec.last_retrieval.ip, "10.0.0.9");
        assert!(rec.is_alive_holder(50, "10.0.0.9"));
    }

    // ── Pending commands ──────────────────────────────────────────────

    #[test]
    fn poll_returns_oldest_unseen_then_nothing() {
        let mut rec = record(2, 10, 3);
        rec.add_pending_command("1.2.3.4", command(100, 600));
        let cmd = rec.poll_command(100, "1.2.3.4").unwrap();
        assert_eq!(cmd.content, COMMAND_UMOUNT);
        assert!(cmd.seen_by_client);
        // already delivered, second poll is empty
        assert!(rec.poll_command(101, "1.2.3.4").is_none());
    }

    #[test]
    fn poll_is_scoped_to_caller_ip() {
        let mut rec = record(2, 10, 3);
        rec.add_pending_command("1.2.3.4", command(100, 600));
        assert!(rec.poll_command(100, "5.6.7.8").is_none());
        assert!(rec.poll_command(100, "1.2.3.4").is_some());
    }

    #[test]
    fn expired_commands_are_purged_on_poll() {
        let mut rec = record(2, 10, 3);
        rec.add_pending_command("1.2.3.4", command(100, 600));
        // 100 + 600 < 701
        assert!(rec.poll_command(701, "1.2.3.4").is_none());
        assert!(rec.pending_commands.is_empty());
    }

    #[test]
    fn result_attaches_to_most_recently_seen_command() {
        let mut rec = record(2, 10, 3);
        rec.add_pending_command("1.2.3.4", command(100, 600));
        rec.add_pending_command("1.2.3.4", command(101, 600));
        rec.poll_command(102, "1.2.3.4");
        rec.poll_command(103, "1.2.3.4");
        assert!(rec.save_command_result(104, "1.2.3.4", "ok"));
        let cmds = &rec.pending_commands["1.2.3.4"];
        assert_eq!(cmds[1].client_result, "ok");
        assert_eq!(cmds[0].client_result, "");
    }

    #[test]
    fn result_without_delivery_is_rejected() {
        let mut rec = record(2, 10, 3);
        rec.add_pending_command("1.2.3.4", command(100, 600));
        assert!(!rec.save_command_result(101, "1.2.3.4", "ok"));
    }

    #[test]
    fn full_command_lifecycle() {
        let mut rec = record(2, 10, 3);
        rec.add_pending_command("1.2.3.4", command(0, 600));
        let cmd = rec.poll_command(1, "1.2.3.4").unwrap();
        assert!(!cmd.expired(1));
        assert!(rec.save_command_result(2, "1.2.3.4", "ok"));
        assert!(rec.poll_command(3, "1.2.3.4").is_none());
        // past valid_from + validity the record forgets the command
        rec.purge_expired_commands(601);
        assert!(rec.pending_commands.is_empty());
    }
}
