use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::auth::AuthenticationResult;

/// One accepted message, as persisted to the inbox store. Immutable after
/// the storage rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub received_at: DateTime<Utc>,
    /// Original RFC 5322 octets, base64 in the JSON encoding.
    #[serde(with = "raw_bytes")]
    pub raw: Vec<u8>,
    pub sender: String,
    pub recipient: String,
    pub transport: Transport,
    pub auth: AuthenticationResult,
    pub size_bytes: usize,
}

/// Envelope metadata set by the MTA on the ingestion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    pub client_ip: Option<IpAddr>,
    pub client_hostname: String,
    pub helo: String,
    pub mail_from: String,
}

impl InboundMessage {
    /// Time-ordered opaque id: unix seconds plus a random suffix. The id is
    /// also the storage filename stem.
    pub fn generate_id(now: DateTime<Utc>) -> String {
        let suffix: u32 = rand::random();
        format!("msg_{}_{suffix:08x}", now.timestamp())
    }
}

/// Lowercase the domain part and strip a single pair of angle brackets.
/// Invalid addresses are passed through trimmed; the parser is tolerant by
/// contract.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed);

    match trimmed.rsplit_once('@') {
        Some((local, domain)) => format!("{local}@{}", domain.to_ascii_lowercase()),
        None => trimmed.to_string(),
    }
}

/// Domain part of an address, lowercased. Empty when there is none (null
/// sender / bounce).
pub fn address_domain(address: &str) -> String {
    normalize_address(address)
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_string())
        .unwrap_or_default()
}

mod raw_bytes {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Base64::decode_vec(&encoded).map_err(D::Error::custom)
    }
}
