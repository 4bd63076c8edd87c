//! Flag-value parsers for sizes, durations, and verifier endpoints.

use std::time::Duration;

/// Parses human byte sizes: `512B`, `2KB`, `4MB`, `1GB`, or a bare
/// number of bytes. Units are powers of 1024.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let upper = trimmed.to_ascii_uppercase();

    let (digits, multiplier) = if let Some(rest) = upper.strip_suffix("GB") {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = upper.strip_suffix("MB") {
        (rest, 1024 * 1024)
    } else if let Some(rest) = upper.strip_suffix("KB") {
        (rest, 1024)
    } else if let Some(rest) = upper.strip_suffix('B') {
        (rest, 1)
    } else {
        (upper.as_str(), 1)
    };

    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid size '{input}' (expected e.g. 512B, 2KB, 4MB)"))
}

/// Parses durations: `500ms`, `10s`, `2m`, `1h`, or bare seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();

    let (digits, unit_ms) = if let Some(rest) = trimmed.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = trimmed.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = trimmed.strip_suffix('m') {
        (rest, 60 * 1000)
    } else if let Some(rest) = trimmed.strip_suffix('h') {
        (rest, 60 * 60 * 1000)
    } else {
        (trimmed, 1000)
    };

    digits
        .trim()
        .parse::<u64>()
        .map(|n| Duration::from_millis(n * unit_ms))
        .map_err(|_| format!("invalid duration '{input}' (expected e.g. 500ms, 10s, 2m)"))
}

/// Parses a `selector=url` verifier endpoint override.
pub fn parse_verifier(input: &str) -> Result<(String, String), String> {
    let (selector, url) = input
        .split_once('=')
        .ok_or_else(|| format!("invalid verifier '{input}' (expected detector=url)"))?;
    if selector.trim().is_empty() || url.trim().is_empty() {
        return Err(format!("invalid verifier '{input}' (expected detector=url)"));
    }
    Ok((selector.trim().to_string(), url.trim().to_string()))
}
