//! Filename helpers for media stored on disk and in the bucket.
//!
//! Local names double as object keys, so they must be valid on Windows,
//! Linux and macOS alike while keeping non-ASCII author names readable.

/// Characters that are invalid in Windows filenames
const WINDOWS_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest author prefix embedded in a media file name.
pub const AUTHOR_TAG_CHARS: usize = 20;

/// Sanitize a string for use as a file name on every platform.
///
/// Control and reserved characters become `_` (runs collapse to one),
/// leading/trailing spaces and dots are trimmed, Windows device names get a
/// `_` prefix and an empty result becomes `unnamed`.
///
/// ```
/// use media_curator::utils::filename::sanitize_filename;
///
/// assert_eq!(sanitize_filename("12_A/B.mp4"), "12_A_B.mp4");
/// assert_eq!(sanitize_filename(""), "unnamed");
/// ```
pub fn sanitize_filename(input: &str) -> String {
    if input.is_empty() {
        return "unnamed".to_string();
    }

    // Swap each run of forbidden characters for a single underscore
    let mut result = String::with_capacity(input.len());
    let mut in_run = false;
    for c in input.chars() {
        let forbidden = c.is_control() || WINDOWS_INVALID_CHARS.contains(&c);
        if !forbidden {
            result.push(c);
        } else if !in_run {
            result.push('_');
        }
        in_run = forbidden;
    }

    // Windows drops trailing spaces and dots, leading ones hide the file
    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    // Device names stay reserved with any extension, e.g. `NUL.jpg`
    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if WINDOWS_RESERVED_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
    {
        return format!("_{}", trimmed);
    }

    trimmed.to_string()
}

/// Short author tag: the first [`AUTHOR_TAG_CHARS`] characters, spaces as `_`.
pub fn author_tag(author: &str) -> String {
    author
        .chars()
        .take(AUTHOR_TAG_CHARS)
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string() {
        assert_eq!(sanitize_filename(""), "unnamed");
    }

    #[test]
    fn test_invalid_characters_replaced() {
        assert_eq!(sanitize_filename("1_a:b.jpg"), "1_a_b.jpg");
        assert_eq!(sanitize_filename("a<>:\"b"), "a_b");
        assert_eq!(sanitize_filename("test\x1Ffile"), "test_file");
    }

    #[test]
    fn test_reserved_name_with_extension() {
        assert_eq!(sanitize_filename("CON.mp4"), "_CON.mp4");
        assert_eq!(sanitize_filename("nul.jpg"), "_nul.jpg");
        assert_eq!(sanitize_filename("Com1.backup.mp4"), "_Com1.backup.mp4");
        assert_eq!(sanitize_filename("CONSOLE.mp4"), "CONSOLE.mp4");
    }

    #[test]
    fn test_unicode_author_kept() {
        assert_eq!(sanitize_filename("7_Ömer_Çelik.jpg"), "7_Ömer_Çelik.jpg");
        assert_eq!(sanitize_filename("8_观看一只青蛙?.mp4"), "8_观看一只青蛙_.mp4");
    }

    #[test]
    fn test_author_tag_truncates_on_chars() {
        assert_eq!(author_tag("Jane Doe"), "Jane_Doe");
        assert_eq!(
            author_tag("Abcdefghij Klmnopqrst Uvwxyz"),
            "Abcdefghij_Klmnopqrs"
        );
        assert_eq!(author_tag("青蛙 摄影师").chars().count(), 6);
    }

    #[test]
    fn test_idempotency() {
        for input in ["hello?world", "CON", "  test  ", "...dots..."] {
            let once = sanitize_filename(input);
            assert_eq!(once, sanitize_filename(&once), "input: {}", input);
        }
    }
}
