//! On-disk encoding of a key record.
//!
//! A `.sdb` file is a flat run of tagged fields: 2-byte big-endian tag,
//! 4-byte big-endian length, then that many value bytes, repeated until
//! EOF. Unknown tags are skipped on read so older daemons can load
//! files written by newer ones; every write emits the full current tag
//! set. The nested holder maps are flattened into repeated message and
//! command fields that carry their own IP.

use crate::record::{AliveMessage, KeyRecord, PendingCommand};

const TAG_UUID: u16 = 0x0001;
const TAG_ID: u16 = 0x0002;
const TAG_CREATION_TIME: u16 = 0x0003;
const TAG_KEY_MATERIAL: u16 = 0x0004;
const TAG_EXTERNAL_ID: u16 = 0x0005;
const TAG_MOUNT_POINT: u16 = 0x0006;
const TAG_MOUNT_OPTION: u16 = 0x0007;
const TAG_MAX_ACTIVE: u16 = 0x0008;
const TAG_ALIVE_INTERVAL: u16 = 0x0009;
const TAG_ALIVE_COUNT: u16 = 0x000a;
const TAG_ALIVE_MESSAGE: u16 = 0x000b;
const TAG_LAST_RETRIEVAL: u16 = 0x000c;
const TAG_PENDING_COMMAND: u16 = 0x000d;

/// Decoding failure; the store wraps this with the file path.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WireError {
    #[error("truncated field at offset {0}")]
    Truncated(usize),

    #[error("field {field} is not valid UTF-8")]
    BadUtf8 { field: &'static str },

    #[error("field {field} has length {got}, expected {expected}")]
    BadFieldLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("record has no uuid field")]
    MissingUuid,
}

// ── Encoding ──────────────────────────────────────────────────────────

pub fn encode_record(rec: &KeyRecord) -> Vec<u8> {
    let mut out = Vec::new();
    put_field(&mut out, TAG_UUID, rec.uuid.as_bytes());
    put_field(&mut out, TAG_ID, rec.id.as_bytes());
    put_field(&mut out, TAG_CREATION_TIME, &rec.creation_time.to_be_bytes());
    put_field(&mut out, TAG_KEY_MATERIAL, &rec.key_material);
    if let Some(external_id) = &rec.external_id {
        put_field(&mut out, TAG_EXTERNAL_ID, external_id.as_bytes());
    }
    put_field(&mut out, TAG_MOUNT_POINT, rec.mount_point.as_bytes());
    for opt in &rec.mount_options {
        put_field(&mut out, TAG_MOUNT_OPTION, opt.as_bytes());
    }
    put_field(&mut out, TAG_MAX_ACTIVE, &rec.max_active.to_be_bytes());
    put_field(
        &mut out,
        TAG_ALIVE_INTERVAL,
        &rec.alive_interval_sec.to_be_bytes(),
    );
    put_field(&mut out, TAG_ALIVE_COUNT, &rec.alive_count.to_be_bytes());

    // deterministic output: holders sorted by IP
    let mut ips: Vec<&String> = rec.alive_messages.keys().collect();
    ips.sort();
    for ip in ips {
        for msg in &rec.alive_messages[ip] {
            put_field(&mut out, TAG_ALIVE_MESSAGE, &encode_message(msg));
        }
    }
    put_field(
        &mut out,
        TAG_LAST_RETRIEVAL,
        &encode_message(&rec.last_retrieval),
    );
    let mut ips: Vec<&String> = rec.pending_commands.keys().collect();
    ips.sort();
    for ip in ips {
        for cmd in &rec.pending_commands[ip] {
            put_field(&mut out, TAG_PENDING_COMMAND, &encode_command(ip, cmd));
        }
    }
    out
}

fn put_field(out: &mut Vec<u8>, tag: u16, value: &[u8]) {
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_message(msg: &AliveMessage) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&msg.timestamp.to_be_bytes());
    put_str(&mut out, &msg.ip);
    put_str(&mut out, &msg.hostname);
    out
}

fn encode_command(ip: &str, cmd: &PendingCommand) -> Vec<u8> {
    let mut out = Vec::new();
    put_str(&mut out, ip);
    out.extend_from_slice(&cmd.valid_from.to_be_bytes());
    out.extend_from_slice(&cmd.validity_sec.to_be_bytes());
    out.push(u8::from(cmd.seen_by_client));
    put_str(&mut out, &cmd.content);
    put_str(&mut out, &cmd.client_result);
    out
}

// ── Decoding ──────────────────────────────────────────────────────────

pub fn decode_record(input: &[u8]) -> Result<KeyRecord, WireError> {
    let mut rec = KeyRecord::default();
    let mut saw_uuid = false;
    let mut pos = 0;

    while pos < input.len() {
        if input.len() - pos < 6 {
            return Err(WireError::Truncated(pos));
        }
        let tag = u16::from_be_bytes([input[pos], input[pos + 1]]);
        let len = u32::from_be_bytes([
            input[pos + 2],
            input[pos + 3],
            input[pos + 4],
            input[pos + 5],
        ]) as usize;
        pos += 6;
        if input.len() - pos < len {
            return Err(WireError::Truncated(pos));
        }
        let value = &input[pos..pos + len];
        pos += len;

        match tag {
            TAG_UUID => {
                rec.uuid = utf8("uuid", value)?;
                saw_uuid = true;
            }
            TAG_ID => rec.id = utf8("id", value)?,
            TAG_CREATION_TIME => rec.creation_time = be_i64("creation_time", value)?,
            TAG_KEY_MATERIAL => rec.key_material = value.to_vec(),
            TAG_EXTERNAL_ID => rec.external_id = Some(utf8("external_id", value)?),
            TAG_MOUNT_POINT => rec.mount_point = utf8("mount_point", value)?,
            TAG_MOUNT_OPTION => rec.mount_options.push(utf8("mount_option", value)?),
            TAG_MAX_ACTIVE => rec.max_active = be_u32("max_active", value)?,
            TAG_ALIVE_INTERVAL => rec.alive_interval_sec = be_i64("alive_interval", value)?,
            TAG_ALIVE_COUNT => rec.alive_count = be_u32("alive_count", value)?,
            TAG_ALIVE_MESSAGE => {
                let msg = decode_message(value)?;
                rec.alive_messages.entry(msg.ip.clone()).or_default().push(msg);
            }
            TAG_LAST_RETRIEVAL => rec.last_retrieval = decode_message(value)?,
            TAG_PENDING_COMMAND => {
                let (ip, cmd) = decode_command(value)?;
                rec.pending_commands.entry(ip).or_default().push(cmd);
            }
            // forward compatibility: skip fields this build doesn't know
            _ => {}
        }
    }

    if !saw_uuid {
        return Err(WireError::MissingUuid);
    }
    Ok(rec)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, WireError> {
        be_i64(field, self.take(8)?)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn string(&mut self, field: &'static str) -> Result<String, WireError> {
        let len_bytes = self.take(2)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        utf8(field, self.take(len)?)
    }
}

fn decode_message(value: &[u8]) -> Result<AliveMessage, WireError> {
    let mut cur = Cursor { buf: value, pos: 0 };
    Ok(AliveMessage {
        timestamp: cur.i64("message.timestamp")?,
        ip: cur.string("message.ip")?,
        hostname: cur.string("message.hostname")?,
    })
}

fn decode_command(value: &[u8]) -> Result<(String, PendingCommand), WireError> {
    let mut cur = Cursor { buf: value, pos: 0 };
    let ip = cur.string("command.ip")?;
    let cmd = PendingCommand {
        valid_from: cur.i64("command.valid_from")?,
        validity_sec: cur.i64("command.validity")?,
        seen_by_client: cur.u8()? != 0,
        content: cur.string("command.content")?,
        client_result: cur.string("command.result")?,
    };
    Ok((ip, cmd))
}

fn utf8(field: &'static str, value: &[u8]) -> Result<String, WireError> {
    String::from_utf8(value.to_vec()).map_err(|_| WireError::BadUtf8 { field })
}

fn be_i64(field: &'static str, value: &[u8]) -> Result<i64, WireError> {
    let arr: [u8; 8] = value.try_into().map_err(|_| WireError::BadFieldLength {
        field,
        expected: 8,
        got: value.len(),
    })?;
    Ok(i64::from_be_bytes(arr))
}

fn be_u32(field: &'static str, value: &[u8]) -> Result<u32, WireError> {
    let arr: [u8; 4] = value.try_into().map_err(|_| WireError::BadFieldLength {
        field,
        expected: 4,
        got: value.len(),
    })?;
    Ok(u32::from_be_bytes(arr))
}

// ── Tests ─────────────────────────────────────────────────────────────
