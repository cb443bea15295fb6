//! The JSON envelope published for each captured message.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use serde::Serialize;
use std::hash::Hasher;

use crate::sip::SipMessage;

/// A captured SIP message plus metadata, serialized to JSON for MQTT
/// publishing. The raw SIP bytes are base64 when encoded.
#[derive(Debug, Clone, Serialize)]
pub struct Msg {
    #[serde(rename = "sip", serialize_with = "as_base64")]
    pub sip_data: Vec<u8>,
    pub time: DateTime<Utc>,
    pub id: String,
}

impl Msg {
    /// Build an envelope from a SIP message. The id is the Call-ID (or
    /// `i:`) header when present, otherwise an FNV-1a hash of the whole
    /// message so the id stays deterministic.
    pub fn new(sip: &SipMessage) -> Self {
        let mut data = sip.raw_headers().to_vec();
        data.extend_from_slice(sip.body());

        let id = match sip.call_id() {
            Some(cid) if !cid.is_empty() => cid.to_string(),
            _ => format!("{:x}", fnv1a(&data)),
        };

        Msg {
            sip_data: data,
            time: Utc::now(),
            id,
        }
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    hasher.finish()
}

fn as_base64<S: serde::Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}
