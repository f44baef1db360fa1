use std::sync::OnceLock;
use regex::Regex;

/// Fatal-looking ffmpeg messages, checked in this order on every line
const FATAL_PATTERNS: &[&str] = &[
    r"Impossible to convert between the formats supported by the filter",
    r"Impossible to open.+",
    r".+Invalid data found when processing input",
    r"^[Ss]tream map.+matches no stream",
    r"^[eE]rror",
];

fn fatal_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        FATAL_PATTERNS
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::error!("invalid fatal pattern {:?}: {}", p, e);
                    None
                }
            })
            .collect()
    })
}

/// First line of the captured stderr that matches a fatal pattern, or an empty string.
///
/// Lines are split on both `\n` and `\r`, so a message painted right after a status
/// line is still seen at the start of its own line.
pub fn scan(captured: &str) -> String {
    let patterns = fatal_patterns();
    captured
        .split(['\n', '\r'])
        .find(|line| patterns.iter().any(|re| re.is_match(line)))
        .map(str::to_string)
        .unwrap_or_default()
}

/// Same as [`scan`] for raw bytes; invalid UTF-8 is replaced
pub fn scan_bytes(captured: &[u8]) -> String {
    scan(&String::from_utf8_lossy(captured))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fatal_line_wins() {
        let captured = "frame=1 size=1\nError opening file\nframe=2 size=2\n";
        assert_eq!(scan(captured), "Error opening file");
    }

    #[test]
    fn test_emission_order_not_pattern_order() {
        let captured = "error while decoding MB 1 2\n\
                        Impossible to convert between the formats supported by the filter 'a' and the filter 'b'\n";
        assert_eq!(scan(captured), "error while decoding MB 1 2");
    }

    #[test]
    fn test_each_signature() {
        assert_eq!(
            scan("[in#0 @ 0x1] Impossible to open 'missing.mkv'"),
            "[in#0 @ 0x1] Impossible to open 'missing.mkv'"
        );
        assert_eq!(
            scan("input.mkv: Invalid data found when processing input"),
            "input.mkv: Invalid data found when processing input"
        );
        assert_eq!(
            scan("Stream map '0:v:3' matches no streams."),
            "Stream map '0:v:3' matches no streams."
        );
        assert_eq!(
            scan("x\nImpossible to convert between the formats supported by the filter 'in' and the filter 'out'"),
            "Impossible to convert between the formats supported by the filter 'in' and the filter 'out'"
        );
    }

    #[test]
    fn test_anchoring() {
        // leading text is required for the invalid-data pattern, forbidden for the error pattern
        assert_eq!(scan("Invalid data found when processing input"), "");
        assert_eq!(scan("[aac @ 0x1] Error decoding frame"), "");
        assert_eq!(scan("  stream map x matches no stream"), "");
    }

    #[test]
    fn test_no_match_is_empty() {
        assert_eq!(scan(""), "");
        assert_eq!(scan("frame=  10 fps=1.0 size=1kB\nvideo:1kB audio:0kB\n"), "");
    }

    #[test]
    fn test_carriage_return_painted_lines() {
        let captured = b"frame=  1 size=1kB\rframe=  2 size=2kB\rError while filtering: Cannot allocate memory\n";
        assert_eq!(scan_bytes(captured), "Error while filtering: Cannot allocate memory");
    }
}
