// Relay wire framing
//
// Data packets: 16 session id bytes (high u64 then low u64, big-endian)
// followed by the opaque payload. Control text: `RELAY_CTRL:<id>:<message>`.

use uuid::Uuid;

pub const RELAY_CTRL_PREFIX: &str = "RELAY_CTRL:";
pub const RELAY_REQUEST_PREFIX: &str = "RELAY_REQUEST:";
pub const SESSION_ID_LEN: usize = 16;

pub fn pack(session_id: Uuid, payload: &[u8]) -> Vec<u8> {
    let (high, low) = session_id.as_u64_pair();
    let mut packet = Vec::with_capacity(SESSION_ID_LEN + payload.len());
    packet.extend_from_slice(&high.to_be_bytes());
    packet.extend_from_slice(&low.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Split a packet into session id and payload; `None` if it is too short
pub fn unpack(packet: &[u8]) -> Option<(Uuid, &[u8])> {
    if packet.len() < SESSION_ID_LEN {
        return None;
    }
    let (id, payload) = packet.split_at(SESSION_ID_LEN);
    let high = u64::from_be_bytes(id[..8].try_into().ok()?);
    let low = u64::from_be_bytes(id[8..].try_into().ok()?);
    Some((Uuid::from_u64_pair(high, low), payload))
}

pub fn format_control(session_id: Uuid, message: &str) -> String {
    format!("{}{}:{}", RELAY_CTRL_PREFIX, session_id, message)
}

/// The message may itself contain `:`
pub fn parse_control(text: &str) -> Option<(Uuid, &str)> {
    let rest = text.strip_prefix(RELAY_CTRL_PREFIX)?;
    let (id, message) = rest.split_once(':')?;
    Some((Uuid::parse_str(id).ok()?, message))
}

pub fn format_relay_request(target: &str, session_id: Uuid) -> String {
    format!("{}{}:{}", RELAY_REQUEST_PREFIX, target, session_id)
}

pub fn parse_relay_request(payload: &str) -> Option<(&str, Uuid)> {
    let rest = payload.strip_prefix(RELAY_REQUEST_PREFIX)?;
    let (target, id) = rest.split_once(':')?;
    if target.is_empty() {
        return None;
    }
    Some((target, Uuid::parse_str(id).ok()?))
}
