use uuid::Uuid;

/// Prefix for chat completion ids surfaced on the wire.
pub const CHAT_ID_PREFIX: &str = "chat-";
/// Prefix for per-request correlation ids.
pub const REQUEST_ID_PREFIX: &str = "req_";

/// Generates `<prefix>` followed by 32 hex characters.
pub fn gen_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}
