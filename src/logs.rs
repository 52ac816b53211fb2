//! Cleaning of raw CI job logs.
//!
//! Provider traces carry terminal color sequences and collapsible section
//! markers (`section_start:<ts>:<name>[opts]\r`, `section_end:<ts>:<name>\r`).
//! Both are removed; line content, order and line breaks are kept.

use std::sync::LazyLock;

use regex::Regex;

static SECTION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"section_(?:start|end):\d+:[^\s\x1b\[\]]+(?:\[[^\]\r\n]*\])?\r?")
        .expect("section marker pattern is valid")
});

/// Strip escape sequences and section markers from a raw provider log.
///
/// Idempotent: `clean_log(&clean_log(x)) == clean_log(x)`.
pub fn clean_log(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n");
    let unmarked = SECTION_MARKER.replace_all(&normalized, "");

    // strip-ansi-escapes drops tabs along with other C0 controls, so strip
    // each tab-separated piece on its own.
    let stripped = unmarked
        .split('\t')
        .map(strip_ansi_escapes::strip_str)
        .collect::<Vec<_>>()
        .join("\t");

    stripped.replace('\r', "")
}

/// A log that carries no usable content.
pub fn is_blank(log: &str) -> bool {
    log.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "\x1b[0KRunning with gitlab-runner 16.5.0\n\
        section_start:1700000000:prepare_script[collapsed=true]\r\x1b[0K\x1b[0K\x1b[36;1mPreparing environment\x1b[0;m\n\
        Running on runner-abc\n\
        section_end:1700000003:prepare_script\r\x1b[0K\n\
        \x1b[32;1m$ make test\x1b[0;m\n\
        ok\tall 12 tests passed\n";

    #[test]
    fn test_removes_escapes_and_markers() {
        let cleaned = clean_log(RAW);
        assert!(!cleaned.contains('\x1b'));
        assert!(!cleaned.contains("section_start"));
        assert!(!cleaned.contains("section_end"));
        assert!(!cleaned.contains('\r'));
    }

    #[test]
    fn test_preserves_lines_in_order() {
        let cleaned = clean_log(RAW);
        let lines: Vec<&str> = cleaned.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Running with gitlab-runner 16.5.0",
                "Preparing environment",
                "Running on runner-abc",
                "",
                "$ make test",
                "ok\tall 12 tests passed",
            ]
        );
    }

    #[test]
    fn test_clean_is_idempotent() {
        let once = clean_log(RAW);
        assert_eq!(clean_log(&once), once);

        let plain = "line one\nline two\n";
        assert_eq!(clean_log(plain), plain);
    }

    #[test]
    fn test_crlf_line_breaks_normalized() {
        assert_eq!(clean_log("a\r\nb\r\n"), "a\nb\n");
    }

    #[test]
    fn test_blank_detection() {
        assert!(is_blank(""));
        assert!(is_blank("  \n\t\n"));
        assert!(is_blank(&clean_log("\x1b[0K\n")));
        assert!(!is_blank("x"));
    }
}
