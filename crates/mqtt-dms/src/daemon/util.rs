//! Shared daemon utilities.

/// Environment variable naming this machine in the default status topic
pub const MACHINE_ID_ENV: &str = "MQTT_DMS_MACHINE_ID";

/// Identity of this machine, usable as one level of an MQTT topic.
///
/// Taken from `MQTT_DMS_MACHINE_ID`, else the hostname, else `"unknown"`.
/// `/` would split the id across levels and `+`/`#` are wildcards that a
/// broker rejects in a publish topic, so those become `_` together with
/// whitespace and `-`.
pub fn get_machine_id() -> String {
    let raw = std::env::var(MACHINE_ID_ENV)
        .ok()
        .or_else(|| hostname::get().ok().map(|h| h.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let id = topic_level(&raw);
    if id.is_empty() {
        "unknown".to_string()
    } else {
        id
    }
}

fn topic_level(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' | '-' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Build a fresh MQTT client identity for one connect attempt.
pub fn new_client_id() -> String {
    format!("mqtt-dms-{}", uuid::Uuid::new_v4().simple())
}

/// Current wall-clock time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
