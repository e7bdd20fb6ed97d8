//! TTLV codec for the KMIP binary protocol.
//!
//! Every KMIP item is Tag-Type-Length-Value: a 3-byte big-endian tag, a
//! 1-byte type, a 4-byte big-endian length of the *unpadded* value, then
//! the value itself zero-padded to an 8-byte boundary. Structures nest by
//! concatenating the padded encodings of their children.

use thiserror::Error;

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum TtlvError {
    #[error("input truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("unknown item type 0x{0:02x}")]
    UnknownType(u8),

    #[error("item 0x{tag:06x}: declared length {declared} is invalid for type 0x{item_type:02x}")]
    BadLength {
        tag: u32,
        item_type: u8,
        declared: usize,
    },

    #[error("item 0x{tag:06x}: value is not valid UTF-8")]
    BadUtf8 { tag: u32 },

    #[error("item 0x{tag:06x}: boolean value {value} is neither 0 nor 1")]
    BadBoolean { tag: u32, value: u64 },

    #[error("no child with tag 0x{child:06x} under structure 0x{parent:06x}")]
    MissingChild { parent: u32, child: u32 },

    #[error("item 0x{tag:06x} is not a {expected}")]
    WrongType { tag: u32, expected: &'static str },
}

pub type Result<T> = std::result::Result<T, TtlvError>;

// ── Item model ────────────────────────────────────────────────────────

/// Value of a single TTLV item, one variant per KMIP item type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Structure(Vec<Item>),
    Integer(i32),
    LongInteger(i64),
    BigInteger(Vec<u8>),
    Enumeration(u32),
    Boolean(bool),
    TextString(String),
    ByteString(Vec<u8>),
    DateTime(i64),
    Interval(u32),
}

/// A decoded TTLV item: tag plus typed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub tag: u32,
    pub value: Value,
}

const TYPE_STRUCTURE: u8 = 0x01;
const TYPE_INTEGER: u8 = 0x02;
const TYPE_LONG_INTEGER: u8 = 0x03;
const TYPE_BIG_INTEGER: u8 = 0x04;
const TYPE_ENUMERATION: u8 = 0x05;
const TYPE_BOOLEAN: u8 = 0x06;
const TYPE_TEXT_STRING: u8 = 0x07;
const TYPE_BYTE_STRING: u8 = 0x08;
const TYPE_DATE_TIME: u8 = 0x09;
const TYPE_INTERVAL: u8 = 0x0a;

const HEADER_LEN: usize = 8;

impl Item {
    pub fn structure(tag: u32, children: Vec<Item>) -> Self {
        Item {
            tag,
            value: Value::Structure(children),
        }
    }

    pub fn integer(tag: u32, v: i32) -> Self {
        Item {
            tag,
            value: Value::Integer(v),
        }
    }

    pub fn long_integer(tag: u32, v: i64) -> Self {
        Item {
            tag,
            value: Value::LongInteger(v),
        }
    }

    pub fn enumeration(tag: u32, v: u32) -> Self {
        Item {
            tag,
            value: Value::Enumeration(v),
        }
    }

    pub fn boolean(tag: u32, v: bool) -> Self {
        Item {
            tag,
            value: Value::Boolean(v),
        }
    }

    pub fn text(tag: u32, v: impl Into<String>) -> Self {
        Item {
            tag,
            value: Value::TextString(v.into()),
        }
    }

    pub fn bytes(tag: u32, v: Vec<u8>) -> Self {
        Item {
            tag,
            value: Value::ByteString(v),
        }
    }

    pub fn date_time(tag: u32, epoch_secs: i64) -> Self {
        Item {
            tag,
            value: Value::DateTime(epoch_secs),
        }
    }

    fn type_byte(&self) -> u8 {
        match self.value {
            Value::Structure(_) => TYPE_STRUCTURE,
            Value::Integer(_) => TYPE_INTEGER,
            Value::LongInteger(_) => TYPE_LONG_INTEGER,
            Value::BigInteger(_) => TYPE_BIG_INTEGER,
            Value::Enumeration(_) => TYPE_ENUMERATION,
            Value::Boolean(_) => TYPE_BOOLEAN,
            Value::TextString(_) => TYPE_TEXT_STRING,
            Value::ByteString(_) => TYPE_BYTE_STRING,
            Value::DateTime(_) => TYPE_DATE_TIME,
            Value::Interval(_) => TYPE_INTERVAL,
        }
    }

    // ── Encoding ──────────────────────────────────────────────────────

    /// Append the padded wire encoding of this item to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        match &self.value {
            Value::Structure(children) => {
                for child in children {
                    child.encode(&mut payload);
                }
            }
            Value::Integer(v) => payload.extend_from_slice(&v.to_be_bytes()),
            Value::LongInteger(v) => payload.extend_from_slice(&v.to_be_bytes()),
            Value::BigInteger(v) => payload.extend_from_slice(v),
            Value::Enumeration(v) => payload.extend_from_slice(&v.to_be_bytes()),
            Value::Boolean(v) => payload.extend_from_slice(&(u64::from(*v)).to_be_bytes()),
            Value::TextString(v) => payload.extend_from_slice(v.as_bytes()),
            Value::ByteString(v) => payload.extend_from_slice(v),
            Value::DateTime(v) => payload.extend_from_slice(&v.to_be_bytes()),
            Value::Interval(v) => payload.extend_from_slice(&v.to_be_bytes()),
        }
        out.extend_from_slice(&self.tag.to_be_bytes()[1..4]);
        out.push(self.type_byte());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out.resize(out.len() + pad_for(payload.len()), 0);
    }

    /// Encode this item into a fresh buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    // ── Decoding ──────────────────────────────────────────────────────

    /// Decode one item from the front of `input`. Returns the item and
    /// the number of bytes consumed including padding.
    pub fn decode(input: &[u8]) -> Result<(Item, usize)> {
        if input.len() < HEADER_LEN {
            return Err(TtlvError::Truncated {
                need: HEADER_LEN,
                have: input.len(),
            });
        }
        let tag = u32::from_be_bytes([0, input[0], input[1], input[2]]);
        let item_type = input[3];
        let declared = u32::from_be_bytes([input[4], input[5], input[6], input[7]]) as usize;
        let consumed = HEADER_LEN + declared + pad_for(declared);
        if input.len() < consumed {
            return Err(TtlvError::Truncated {
                need: consumed,
                have: input.len(),
            });
        }
        let raw = &input[HEADER_LEN..HEADER_LEN + declared];

        let value = match item_type {
            TYPE_STRUCTURE => {
                let mut children = Vec::new();
                let mut offset = 0;
                while offset < raw.len() {
                    let (child, used) = Item::decode(&raw[offset..])?;
                    children.push(child);
                    offset += used;
                }
                Value::Structure(children)
            }
            TYPE_INTEGER => Value::Integer(i32::from_be_bytes(fixed(tag, item_type, raw)?)),
            TYPE_LONG_INTEGER => Value::LongInteger(i64::from_be_bytes(fixed(tag, item_type, raw)?)),
            TYPE_BIG_INTEGER => Value::BigInteger(raw.to_vec()),
            TYPE_ENUMERATION => Value::Enumeration(u32::from_be_bytes(fixed(tag, item_type, raw)?)),
            TYPE_BOOLEAN => {
                let v = u64::from_be_bytes(fixed(tag, item_type, raw)?);
                match v {
                    0 => Value::Boolean(false),
                    1 => Value::Boolean(true),
                    other => return Err(TtlvError::BadBoolean { tag, value: other }),
                }
            }
            TYPE_TEXT_STRING => Value::TextString(
                String::from_utf8(raw.to_vec()).map_err(|_| TtlvError::BadUtf8 { tag })?,
            ),
            TYPE_BYTE_STRING => Value::ByteString(raw.to_vec()),
            TYPE_DATE_TIME => Value::DateTime(i64::from_be_bytes(fixed(tag, item_type, raw)?)),
            TYPE_INTERVAL => Value::Interval(u32::from_be_bytes(fixed(tag, item_type, raw)?)),
            other => return Err(TtlvError::UnknownType(other)),
        };
        Ok((Item { tag, value }, consumed))
    }

    // ── Navigation ────────────────────────────────────────────────────

    /// First child carrying `tag`, or None. Non-structures have no children.
    pub fn child(&self, tag: u32) -> Option<&Item> {
        match &self.value {
            Value::Structure(children) => children.iter().find(|c| c.tag == tag),
            _ => None,
        }
    }

    /// Required child lookup; missing children are a protocol error.
    pub fn require(&self, tag: u32) -> Result<&Item> {
        self.child(tag).ok_or(TtlvError::MissingChild {
            parent: self.tag,
            child: tag,
        })
    }

    /// Walk a path of tags through nested structures, first match at
    /// every level.
    pub fn walk(&self, path: &[u32]) -> Result<&Item> {
        let mut cur = self;
        for &tag in path {
            cur = cur.require(tag)?;
        }
        Ok(cur)
    }

    pub fn as_integer(&self) -> Result<i32> {
        match self.value {
            Value::Integer(v) => Ok(v),
            _ => Err(self.wrong("Integer")),
        }
    }

    pub fn as_enumeration(&self) -> Result<u32> {
        match self.value {
            Value::Enumeration(v) => Ok(v),
            _ => Err(self.wrong("Enumeration")),
        }
    }

    pub fn as_text(&self) -> Result<&str> {
        match &self.value {
            Value::TextString(v) => Ok(v),
            _ => Err(self.wrong("TextString")),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match &self.value {
            Value::ByteString(v) => Ok(v),
            _ => Err(self.wrong("ByteString")),
        }
    }

    fn wrong(&self, expected: &'static str) -> TtlvError {
        TtlvError::WrongType {
            tag: self.tag,
            expected,
        }
    }
}

/// Zero bytes needed after a value of `len` bytes to reach the next
/// 8-byte boundary.
fn pad_for(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Fixed-width numeric value; excess or missing bytes fail decoding.
fn fixed<const N: usize>(tag: u32, item_type: u8, raw: &[u8]) -> Result<[u8; N]> {
    raw.try_into().map_err(|_| TtlvError::BadLength {
        tag,
        item_type,
        declared: raw.len(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────
