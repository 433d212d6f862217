//! Small helpers shared across the crate.

use std::time::Duration;

use sandboxd_shared::errors::{SandboxError, SandboxResult};

/// Parse a human duration string (`30s`, `5m`, `2h`).
pub fn parse_duration(s: &str) -> SandboxResult<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| SandboxError::InvalidRequest(format!("bad duration '{}': {}", s, e)))
}

/// Keep only the first `cap` lines; -1 disables the cap.
///
/// A trailing newline does not count as an extra line.
pub fn truncate_lines(text: &str, cap: i64) -> String {
    if cap < 0 {
        return text.to_string();
    }
    let cap = cap as usize;
    let mut out = String::new();
    for (i, line) in text.split_inclusive('\n').enumerate() {
        if i >= cap {
            break;
        }
        out.push_str(line);
    }
    out
}

/// Errors a client produces by closing its end of a stream mid-copy.
pub fn is_clean_close(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    ) || err.to_string().contains("use of closed")
}

/// Quote a string for inclusion in a `sh -c` command line; single quotes
/// are escaped as `'"'"'`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Normalize an image reference to `repository:tag`.
///
/// The tag applied to untagged references is `default_tag` when set, else
/// `latest`. Registry ports (`host:5000/repo`) are not mistaken for tags.
pub fn normalize_image_ref(reference: &str, default_tag: Option<&str>) -> String {
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    if last_segment.contains(':') {
        return reference.to_string();
    }
    format!("{}:{}", reference, default_tag.unwrap_or("latest"))
}

/// Split a normalized reference into (repository, tag).
pub fn split_image_ref(reference: &str) -> (&str, &str) {
    if let Some(slash) = reference.rfind('/') {
        if let Some(colon) = reference[slash..].rfind(':') {
            let colon = slash + colon;
            return (&reference[..colon], &reference[colon + 1..]);
        }
        return (reference, "latest");
    }
    match reference.rsplit_once(':') {
        Some((repo, tag)) => (repo, tag),
        None => (reference, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration(" 50ms ").unwrap(), Duration::from_millis(50));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_truncate_lines() {
        assert_eq!(truncate_lines("a\nb\nc\n", 2), "a\nb\n");
        assert_eq!(truncate_lines("a\nb\nc", -1), "a\nb\nc");
        assert_eq!(truncate_lines("a\nb\nc", 5), "a\nb\nc");
        assert_eq!(truncate_lines("", 3), "");
        assert_eq!(truncate_lines("no newline", 1), "no newline");
    }

    #[test]
    fn test_clean_close_detection() {
        use std::io::{Error, ErrorKind};
        assert!(is_clean_close(&Error::new(ErrorKind::BrokenPipe, "x")));
        assert!(is_clean_close(&Error::new(ErrorKind::UnexpectedEof, "x")));
        assert!(is_clean_close(&Error::other("use of closed connection")));
        assert!(!is_clean_close(&Error::other("the daemon caught fire")));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn test_normalize_image_ref() {
        assert_eq!(normalize_image_ref("alpine", None), "alpine:latest");
        assert_eq!(normalize_image_ref("alpine:3.19", None), "alpine:3.19");
        assert_eq!(normalize_image_ref("alpine", Some("edge")), "alpine:edge");
        assert_eq!(
            normalize_image_ref("registry:5000/team/app", None),
            "registry:5000/team/app:latest"
        );
        assert_eq!(
            normalize_image_ref("registry:5000/team/app:v2", None),
            "registry:5000/team/app:v2"
        );
    }

    #[test]
    fn test_split_image_ref() {
        assert_eq!(split_image_ref("alpine:3.19"), ("alpine", "3.19"));
        assert_eq!(split_image_ref("alpine"), ("alpine", "latest"));
        assert_eq!(
            split_image_ref("registry:5000/team/app:v2"),
            ("registry:5000/team/app", "v2")
        );
        assert_eq!(
            split_image_ref("registry:5000/team/app"),
            ("registry:5000/team/app", "latest")
        );
    }
}
