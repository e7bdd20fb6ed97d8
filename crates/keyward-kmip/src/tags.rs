//! KMIP 1.3 tag and enumeration constants used by this client.

pub const TAG_ATTRIBUTE: u32 = 0x42_0008;
pub const TAG_ATTRIBUTE_NAME: u32 = 0x42_000a;
pub const TAG_ATTRIBUTE_VALUE: u32 = 0x42_000b;
pub const TAG_AUTHENTICATION: u32 = 0x42_000c;
pub const TAG_BATCH_COUNT: u32 = 0x42_000d;
pub const TAG_BATCH_ITEM: u32 = 0x42_000f;
pub const TAG_CREDENTIAL: u32 = 0x42_0023;
pub const TAG_CREDENTIAL_TYPE: u32 = 0x42_0024;
pub const TAG_CREDENTIAL_VALUE: u32 = 0x42_0025;
pub const TAG_KEY_BLOCK: u32 = 0x42_0040;
pub const TAG_KEY_MATERIAL: u32 = 0x42_0043;
pub const TAG_KEY_VALUE: u32 = 0x42_0045;
pub const TAG_OBJECT_TYPE: u32 = 0x42_0057;
pub const TAG_OPERATION: u32 = 0x42_005c;
pub const TAG_PROTOCOL_VERSION: u32 = 0x42_0069;
pub const TAG_PROTOCOL_VERSION_MAJOR: u32 = 0x42_006a;
pub const TAG_PROTOCOL_VERSION_MINOR: u32 = 0x42_006b;
pub const TAG_REQUEST_HEADER: u32 = 0x42_0077;
pub const TAG_REQUEST_MESSAGE: u32 = 0x42_0078;
pub const TAG_REQUEST_PAYLOAD: u32 = 0x42_0079;
pub const TAG_RESPONSE_HEADER: u32 = 0x42_007a;
pub const TAG_RESPONSE_MESSAGE: u32 = 0x42_007b;
pub const TAG_RESPONSE_PAYLOAD: u32 = 0x42_007c;
pub const TAG_RESULT_MESSAGE: u32 = 0x42_007d;
pub const TAG_RESULT_STATUS: u32 = 0x42_007f;
pub const TAG_SYMMETRIC_KEY: u32 = 0x42_008f;
pub const TAG_TEMPLATE_ATTRIBUTE: u32 = 0x42_0091;
pub const TAG_TIME_STAMP: u32 = 0x42_0092;
pub const TAG_UNIQUE_IDENTIFIER: u32 = 0x42_0094;
pub const TAG_USERNAME: u32 = 0x42_0099;
pub const TAG_PASSWORD: u32 = 0x42_00a1;

pub const OP_CREATE: u32 = 0x01;
pub const OP_GET: u32 = 0x0a;

pub const OBJECT_TYPE_SYMMETRIC_KEY: u32 = 0x02;
pub const CREDENTIAL_TYPE_USERNAME_PASSWORD: u32 = 0x01;
pub const ALGORITHM_AES: u32 = 0x03;
pub const USAGE_ENCRYPT: i32 = 0x04;
pub const USAGE_DECRYPT: i32 = 0x08;
pub const RESULT_STATUS_SUCCESS: u32 = 0x00;

pub const PROTOCOL_MAJOR: i32 = 1;
pub const PROTOCOL_MINOR: i32 = 3;

pub const ATTR_CRYPTOGRAPHIC_ALGORITHM: &str = "Cryptographic Algorithm";
pub const ATTR_CRYPTOGRAPHIC_LENGTH: &str = "Cryptographic Length";
pub const ATTR_CRYPTOGRAPHIC_USAGE_MASK: &str = "Cryptographic Usage Mask";

/// Key size requested from the appliance, in bits.
pub const AES_KEY_BITS: i32 = 256;
