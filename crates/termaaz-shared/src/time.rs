use chrono::Utc;

/// Current Unix timestamp in milliseconds. All wire timestamps and
/// entity `*_at` fields use this representation.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
