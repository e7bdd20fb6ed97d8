//! Directory-backed store of key records.
//!
//! The daemon wraps a [`KeyDb`] in a single mutex; handlers take the
//! lock, mutate, persist, release. Critical sections stay short: the
//! record file write is the only I/O performed under the lock.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::record::KeyRecord;
use crate::wire::{decode_record, encode_record};
use crate::{Error, Result};

/// File extension of a record file.
const RECORD_EXT: &str = "sdb";

pub struct KeyDb {
    dir: PathBuf,
    records: HashMap<String, KeyRecord>,
}

impl KeyDb {
    /// Load every `.sdb` file under `dir` into memory. A file that does
    /// not parse, or two files carrying the same uuid, abort the load;
    /// refusing to start beats silently dropping a key.
    pub fn open_all(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| Error::Io {
            context: format!("creating key database directory {}", dir.display()),
            source,
        })?;
        let mut db = KeyDb {
            records: HashMap::new(),
            dir: dir.clone(),
        };
        let entries = fs::read_dir(&dir).map_err(|source| Error::Io {
            context: format!("scanning key database directory {}", dir.display()),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                context: format!("scanning key database directory {}", dir.display()),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let rec = load_record(&path)?;
            if db.records.insert(rec.uuid.clone(), rec).is_some() {
                return Err(Error::Corruption {
                    path,
                    detail: "duplicate record uuid".into(),
                });
            }
        }
        tracing::debug!(dir = %dir.display(), records = db.records.len(), "key database loaded");
        Ok(db)
    }

    /// Load exactly one record. Used by the admin CLI to mutate a single
    /// record on disk without racing the daemon's full in-memory set.
    pub fn open_one(dir: impl Into<PathBuf>, uuid: &str) -> Result<Self> {
        let dir = dir.into();
        let rec = load_record(&record_path(&dir, uuid))?;
        let mut records = HashMap::new();
        records.insert(rec.uuid.clone(), rec);
        Ok(KeyDb { dir, records })
    }

    /// Persist `rec` atomically and update the in-memory index. The
    /// record is complete on disk before this returns.
    pub fn upsert(&mut self, rec: KeyRecord) -> Result<()> {
        let path = record_path(&self.dir, &rec.uuid);
        let tmp = path.with_extension("sdb.tmp");
        fs::write(&tmp, encode_record(&rec)).map_err(|source| Error::Io {
            context: format!("writing record file {}", tmp.display()),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| Error::Io {
            context: format!("renaming {} into place", tmp.display()),
            source,
        })?;
        self.records.insert(rec.uuid.clone(), rec);
        Ok(())
    }

    pub fn get_by_uuid(&self, uuid: &str) -> Option<&KeyRecord> {
        self.records.get(uuid)
    }

    /// All records, most recently retrieved first.
    pub fn list(&self) -> Vec<&KeyRecord> {
        let mut recs: Vec<&KeyRecord> = self.records.values().collect();
        recs.sort_by(|a, b| {
            b.last_retrieval
                .timestamp
                .cmp(&a.last_retrieval.timestamp)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        recs
    }

    /// Remove the record file and the in-memory entry.
    pub fn erase(&mut self, uuid: &str) -> Result<()> {
        if self.records.remove(uuid).is_none() {
            return Err(Error::UnknownUuid { uuid: uuid.into() });
        }
        let path = record_path(&self.dir, uuid);
        fs::remove_file(&path).map_err(|source| Error::Io {
            context: format!("removing record file {}", path.display()),
            source,
        })?;
        Ok(())
    }

    /// Re-read one record from disk, replacing the in-memory copy.
    /// Needed after the admin CLI has written behind the daemon's back.
    pub fn reload_one(&mut self, uuid: &str) -> Result<()> {
        let rec = load_record(&record_path(&self.dir, uuid))?;
        self.records.insert(rec.uuid.clone(), rec);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn record_path(dir: &Path, uuid: &str) -> PathBuf {
    dir.join(format!("{uuid}.{RECORD_EXT}"))
}

fn load_record(path: &Path) -> Result<KeyRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            let uuid = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            return Err(Error::UnknownUuid { uuid });
        }
        Err(source) => {
            return Err(Error::Io {
                context: format!("reading record file {}", path.display()),
                source,
            })
        }
    };
    let rec = decode_record(&bytes).map_err(|e| Error::Corruption {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if rec.uuid != stem {
        return Err(Error::Corruption {
            path: path.to_path_buf(),
            detail: format!("file name does not match record uuid {}", rec.uuid),
        });
    }
    Ok(rec)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AliveMessage;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("keyward-keydb-{name}-{nanos}"))
    }

    fn sample(uuid: &str, retrieved_at: i64) -> KeyRecord {
        KeyRecord {
            uuid: uuid.into(),
            id: "data".into(),
            creation_time: 1_690_000_000,
            key_material: vec![0x42; 32],
            mount_point: "/srv/data".into(),
            mount_options: vec!["rw".into()],
            max_active: 2,
            alive_interval_sec: 10,
            alive_count: 4,
            last_retrieval: AliveMessage {
                timestamp: retrieved_at,
                ip: "10.0.0.1".into(),
                hostname: "alpha".into(),
            },
            ..KeyRecord::default()
        }
    }

    #[test]
    fn upsert_then_open_one_roundtrips_bytes() {
        let dir = temp_dir("roundtrip");
        let mut db = KeyDb::open_all(&dir).unwrap();
        let mut rec = sample("11111111-2222-4333-8444-555555555555", 7);
        rec.record_alive(5, "10.0.0.1", "alpha");
        rec.add_pending_command(
            "10.0.0.1",
            crate::record::PendingCommand {
                valid_from: 6,
                validity_sec: 60,
                content: "umount".into(),
                seen_by_client: false,
                client_result: String::new(),
            },
        );
        db.upsert(rec.clone()).unwrap();

        let reopened = KeyDb::open_one(&dir, &rec.uuid).unwrap();
        assert_eq!(reopened.get_by_uuid(&rec.uuid).unwrap(), &rec);
        // and the file re-encodes to the identical bytes
        let on_disk = fs::read(record_path(&dir, &rec.uuid)).unwrap();
        assert_eq!(on_disk, crate::wire::encode_record(&rec));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn open_all_loads_every_record() {
        let dir = temp_dir("open-all");
        let mut db = KeyDb::open_all(&dir).unwrap();
        db.upsert(sample("11111111-0000-4000-8000-000000000001", 1))
            .unwrap();
        db.upsert(sample("11111111-0000-4000-8000-000000000002", 2))
            .unwrap();

        let db = KeyDb::open_all(&dir).unwrap();
        assert_eq!(db.len(), 2);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn list_sorts_by_last_retrieval_descending() {
        let dir = temp_dir("list");
        let mut db = KeyDb::open_all(&dir).unwrap();
        db.upsert(sample("11111111-0000-4000-8000-000000000001", 10))
            .unwrap();
        db.upsert(sample("11111111-0000-4000-8000-000000000002", 30))
            .unwrap();
        db.upsert(sample("11111111-0000-4000-8000-000000000003", 20))
            .unwrap();
        let order: Vec<i64> = db.list().iter().map(|r| r.last_retrieval.timestamp).collect();
        assert_eq!(order, vec![30, 20, 10]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn erase_removes_file_and_entry() {
        let dir = temp_dir("erase");
        let mut db = KeyDb::open_all(&dir).unwrap();
        let rec = sample("11111111-0000-4000-8000-00000000000e", 1);
        db.upsert(rec.clone()).unwrap();
        db.erase(&rec.uuid).unwrap();
        assert!(db.get_by_uuid(&rec.uuid).is_none());
        assert!(!record_path(&dir, &rec.uuid).exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn erase_unknown_uuid_fails() {
        let dir = temp_dir("erase-unknown");
        let mut db = KeyDb::open_all(&dir).unwrap();
        assert!(matches!(
            db.erase("11111111-0000-4000-8000-0000000000ff"),
            Err(Error::UnknownUuid { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn reload_one_picks_up_outside_writes() {
        let dir = temp_dir("reload");
        let mut db = KeyDb::open_all(&dir).unwrap();
        let rec = sample("11111111-0000-4000-8000-00000000000a", 1);
        db.upsert(rec.clone()).unwrap();

        // another process edits the record on disk
        let mut other = KeyDb::open_one(&dir, &rec.uuid).unwrap();
        let mut edited = other.get_by_uuid(&rec.uuid).unwrap().clone();
        edited.mount_point = "/srv/other".into();
        other.upsert(edited).unwrap();

        assert_eq!(db.get_by_uuid(&rec.uuid).unwrap().mount_point, "/srv/data");
        db.reload_one(&rec.uuid).unwrap();
        assert_eq!(db.get_by_uuid(&rec.uuid).unwrap().mount_point, "/srv/other");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_file_refuses_to_load() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("11111111-0000-4000-8000-00000000000b.sdb"),
            b"\x00\x01garbage",
        )
        .unwrap();
        assert!(matches!(
            KeyDb::open_all(&dir),
            Err(Error::Corruption { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn mismatched_file_name_refuses_to_load() {
        let dir = temp_dir("mismatch");
        let mut db = KeyDb::open_all(&dir).unwrap();
        let rec = sample("11111111-0000-4000-8000-00000000000c", 1);
        db.upsert(rec.clone()).unwrap();
        let renamed = record_path(&dir, "11111111-0000-4000-8000-00000000000d");
        fs::rename(record_path(&dir, &rec.uuid), renamed).unwrap();
        assert!(matches!(
            KeyDb::open_all(&dir),
            Err(Error::Corruption { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn interrupted_write_leaves_prior_record_intact() {
        let dir = temp_dir("atomic");
        let mut db = KeyDb::open_all(&dir).unwrap();
        let rec = sample("11111111-0000-4000-8000-000000000009", 1);
        db.upsert(rec.clone()).unwrap();

        // a crash mid-write leaves a truncated temp file behind; it must
        // never shadow the good record
        fs::write(
            record_path(&dir, &rec.uuid).with_extension("sdb.tmp"),
            b"\x00\x01",
        )
        .unwrap();
        let db = KeyDb::open_all(&dir).unwrap();
        assert_eq!(db.get_by_uuid(&rec.uuid).unwrap(), &rec);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn open_one_missing_record_is_unknown_uuid() {
        let dir = temp_dir("open-one-missing");
        fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            KeyDb::open_one(&dir, "11111111-0000-4000-8000-0000000000aa"),
            Err(Error::UnknownUuid { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
