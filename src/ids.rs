//! Id generators. Background task ids are a distinct format from the
//! session/tool-call ids the rest of the crate uses `uuid` v4 for — `spec.md`
//! §6 calls for a "16-character lowercase hex, random" id, which `uuid`
//! doesn't produce directly, so background tasks get their own generator
//! built on `rand` (already a dependency via `retry::RetryConfig`'s jitter).

const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// 16 lowercase hex characters, not derived from any sortable counter.
pub fn background_task_id() -> String {
    let mut s = String::with_capacity(16);
    for _ in 0..16 {
        let idx = (rand::random::<u8>() as usize) % HEX_CHARS.len();
        s.push(HEX_CHARS[idx] as char);
    }
    s
}

pub fn session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}
