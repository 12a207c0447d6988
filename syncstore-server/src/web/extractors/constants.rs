use lazy_static::lazy_static;
use regex::Regex;

/// `/1.5/{uid}` — the numeric user-id path segment (spec.md §6's URL surface).
pub const UID_REGEX: &str = r"[0-9]{1,10}";
/// BSO ids: 1-64 bytes, any byte but `/` (spec.md §3 forbids it as the one reserved character).
pub const BSO_ID_REGEX: &str = r"[^/]{1,64}";
pub const COLLECTION_ID_REGEX: &str = r"[a-zA-Z0-9._-]{1,32}";

pub const BATCH_MAX_IDS: usize = 100;

pub const BSO_MAX_TTL: u32 = 999_999_999;
pub const BSO_MAX_SORTINDEX_VALUE: i32 = 999_999_999;
pub const BSO_MIN_SORTINDEX_VALUE: i32 = -999_999_999;

pub const ACCEPTED_CONTENT_TYPES: [&str; 3] =
    ["application/json", "text/plain", "application/newlines"];

lazy_static! {
    pub static ref VALID_ID_REGEX: Regex = Regex::new(&format!("^{}$", BSO_ID_REGEX)).unwrap();
    pub static ref VALID_COLLECTION_ID_REGEX: Regex =
        Regex::new(&format!("^{}$", COLLECTION_ID_REGEX)).unwrap();
    pub static ref VALID_UID_REGEX: Regex = Regex::new(&format!("^{}$", UID_REGEX)).unwrap();
    pub static ref TRUE_REGEX: Regex = Regex::new("^(?i)true$").unwrap();
    /// A known-bad ciphertext IV signature rejected in the `crypto` collection (ported from the
    /// teacher: clients that roll back to an all-zero IV indicate a broken key rotation).
    pub static ref KNOWN_BAD_PAYLOAD_REGEX: Regex =
        Regex::new(r#"IV":\s*"AAAAAAAAAAAAAAAAAAAAAA=="#).unwrap();
}
