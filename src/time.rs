use chrono::Utc;

/// Current wall-clock time in milliseconds since the epoch.
///
/// All persisted timestamps and lease deadlines use this unit.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
