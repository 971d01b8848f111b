//! Small time helpers. All persisted timestamps are Unix seconds.

/// Current Unix timestamp in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Days expressed in seconds.
#[must_use]
pub const fn days(n: u64) -> u64 {
    n * 86_400
}

/// Hours expressed in seconds.
#[must_use]
pub const fn hours(n: u64) -> u64 {
    n * 3_600
}
