//! Construction and interpretation of the two KMIP exchanges this
//! client performs. Requests are built as TTLV item trees; responses
//! are navigated with required-child lookups so a missing field surfaces
//! as a protocol mismatch instead of a panic.

use keyward_ttlv::Item;

use crate::tags::*;
use crate::{KmipError, Result};

/// Username/password forwarded in the request header.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

fn request_header(auth: Option<&Credential>) -> Item {
    let mut children = vec![Item::structure(
        TAG_PROTOCOL_VERSION,
        vec![
            Item::integer(TAG_PROTOCOL_VERSION_MAJOR, PROTOCOL_MAJOR),
            Item::integer(TAG_PROTOCOL_VERSION_MINOR, PROTOCOL_MINOR),
        ],
    )];
    if let Some(cred) = auth {
        children.push(Item::structure(
            TAG_AUTHENTICATION,
            vec![Item::structure(
                TAG_CREDENTIAL,
                vec![
                    Item::enumeration(TAG_CREDENTIAL_TYPE, CREDENTIAL_TYPE_USERNAME_PASSWORD),
                    Item::structure(
                        TAG_CREDENTIAL_VALUE,
                        vec![
                            Item::text(TAG_USERNAME, cred.username.clone()),
                            Item::text(TAG_PASSWORD, cred.password.clone()),
                        ],
                    ),
                ],
            )],
        ));
    }
    children.push(Item::integer(TAG_BATCH_COUNT, 1));
    Item::structure(TAG_REQUEST_HEADER, children)
}

fn attribute(name: &str, value: Item) -> Item {
    Item::structure(
        TAG_ATTRIBUTE,
        vec![Item::text(TAG_ATTRIBUTE_NAME, name), value],
    )
}

/// Request creation of a 256-bit AES key on the appliance.
pub fn create_request(auth: Option<&Credential>) -> Item {
    let payload = Item::structure(
        TAG_REQUEST_PAYLOAD,
        vec![
            Item::enumeration(TAG_OBJECT_TYPE, OBJECT_TYPE_SYMMETRIC_KEY),
            Item::structure(
                TAG_TEMPLATE_ATTRIBUTE,
                vec![
                    attribute(
                        ATTR_CRYPTOGRAPHIC_ALGORITHM,
                        Item::enumeration(TAG_ATTRIBUTE_VALUE, ALGORITHM_AES),
                    ),
                    attribute(
                        ATTR_CRYPTOGRAPHIC_LENGTH,
                        Item::integer(TAG_ATTRIBUTE_VALUE, AES_KEY_BITS),
                    ),
                    attribute(
                        ATTR_CRYPTOGRAPHIC_USAGE_MASK,
                        Item::integer(TAG_ATTRIBUTE_VALUE, USAGE_ENCRYPT | USAGE_DECRYPT),
                    ),
                ],
            ),
        ],
    );
    request_message(OP_CREATE, payload, auth)
}

/// Request the key material of an existing object.
pub fn get_request(auth: Option<&Credential>, unique_id: &str) -> Item {
    let payload = Item::structure(
        TAG_REQUEST_PAYLOAD,
        vec![Item::text(TAG_UNIQUE_IDENTIFIER, unique_id)],
    );
    request_message(OP_GET, payload, auth)
}

fn request_message(op: u32, payload: Item, auth: Option<&Credential>) -> Item {
    Item::structure(
        TAG_REQUEST_MESSAGE,
        vec![
            request_header(auth),
            Item::structure(
                TAG_BATCH_ITEM,
                vec![Item::enumeration(TAG_OPERATION, op), payload],
            ),
        ],
    )
}

/// Validate the common response shell and hand back the payload of the
/// single batch item. Refusals become [`KmipError::Failure`].
fn response_payload(resp: &Item, expect_op: u32) -> Result<&Item> {
    if resp.tag != TAG_RESPONSE_MESSAGE {
        return Err(KmipError::ProtocolMismatch(format!(
            "expected response message, got tag 0x{:06x}",
            resp.tag
        )));
    }
    let batch_count = resp
        .walk(&[TAG_RESPONSE_HEADER, TAG_BATCH_COUNT])?
        .as_integer()?;
    if batch_count != 1 {
        return Err(KmipError::ProtocolMismatch(format!(
            "expected exactly 1 batch item, got {batch_count}"
        )));
    }
    let item = resp.require(TAG_BATCH_ITEM)?;
    let status = item.require(TAG_RESULT_STATUS)?.as_enumeration()?;
    if status != RESULT_STATUS_SUCCESS {
        let text = item
            .child(TAG_RESULT_MESSAGE)
            .and_then(|m| m.as_text().ok())
            .unwrap_or_default()
            .to_string();
        return Err(KmipError::Failure { status, text });
    }
    let op = item.require(TAG_OPERATION)?.as_enumeration()?;
    if op != expect_op {
        return Err(KmipError::ProtocolMismatch(format!(
            "expected operation 0x{expect_op:02x}, got 0x{op:02x}"
        )));
    }
    Ok(item.require(TAG_RESPONSE_PAYLOAD)?)
}

/// Unique identifier assigned by the appliance to a created key.
pub fn parse_create_response(resp: &Item) -> Result<String> {
    let payload = response_payload(resp, OP_CREATE)?;
    Ok(payload
        .require(TAG_UNIQUE_IDENTIFIER)?
        .as_text()?
        .to_string())
}

/// Raw key material from a Get response.
pub fn parse_get_response(resp: &Item) -> Result<Vec<u8>> {
    let payload = response_payload(resp, OP_GET)?;
    Ok(payload
        .walk(&[TAG_SYMMETRIC_KEY, TAG_KEY_BLOCK, TAG_KEY_VALUE, TAG_KEY_MATERIAL])?
        .as_bytes()?
        .to_vec())
}

// ── Tests ─────────────────────────────────────────────────────────────
