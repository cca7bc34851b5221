//! Common helper functions for Peerlink.

/// Read a boolean flag from the environment.
///
/// Accepts `1`, `true`, `yes`, `on` (any case, surrounding whitespace ignored).
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Read an unsigned integer from the environment, falling back on absence or
/// parse failure.
pub fn env_u64(name: &str, default: u64) -> u64 {
    let Ok(value) = std::env::var(name) else {
        return default;
    };
    value.trim().parse().unwrap_or_else(|_| {
        tracing::warn!(name, value = %value, default, "ignoring unparseable setting");
        default
    })
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
