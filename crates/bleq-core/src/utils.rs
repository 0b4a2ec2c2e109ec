/*!
 * Utility functions and helpers for bleq.
 */
use std::time::Duration;

/// Format a byte slice for log output (e.g. "0A 1B FF")
///
/// # Arguments
///
/// * `data` - The bytes to format; `None` is rendered as "<none>"
pub fn hex_str(data: Option<&[u8]>) -> String {
    match data {
        Some(bytes) => bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<String>>()
            .join(" "),
        None => "<none>".to_string(),
    }
}

/// Convert a Duration to milliseconds
pub fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}

/// Convert milliseconds to a Duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
