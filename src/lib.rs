//! finserve library
//!
//! Chat-completion core: engine lifecycle, prompt composition, streaming
//! bridge and response post-processing, served over an OpenAI-compatible
//! HTTP API.

pub mod app;
pub mod compose;
pub mod config;
pub mod inference;
pub mod postprocess;
pub mod server;
pub mod service;
pub mod types;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("taux d'intérêt", 10), "taux d'int");
        assert_eq!(truncate_str("intérêt", 4), "int");
        assert_eq!(truncate_str("short", 64), "short");
    }
}
