//! Id and clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// A fresh opaque id: UUID v4 without dashes.
pub fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current time as Unix milliseconds.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
