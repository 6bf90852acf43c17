/// One day in milliseconds.
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Current wall-clock time in epoch milliseconds, the unit used by expiry fields.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
