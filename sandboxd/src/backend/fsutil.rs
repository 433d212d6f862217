//! Shared helpers for the exec-based filesystem operations.
//!
//! Both backends drive the same in-box commands (`ls`, `find`, `cat`,
//! `echo`, `tar`) and parse their output here.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};

use sandboxd_shared::errors::{SandboxError, SandboxResult};

use crate::backend::types::{BoxFile, FileKind, PathStat};
use crate::stream::StdStreams;
use crate::util::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListingFormat {
    /// `ls -la`: perms links owner group size date... name
    Ls,
    /// `find -ls`: inode blocks perms links owner group size date... path
    Find,
}

impl ListingFormat {
    fn offset(&self) -> usize {
        match self {
            ListingFormat::Ls => 0,
            ListingFormat::Find => 2,
        }
    }
}

/// Command and output format for listing `path` down to `depth`.
pub(crate) fn list_command(path: &str, depth: u32) -> (Vec<String>, ListingFormat) {
    if depth <= 1 {
        (
            vec!["ls".to_string(), "-la".to_string(), path.to_string()],
            ListingFormat::Ls,
        )
    } else {
        (
            vec![
                "find".to_string(),
                path.to_string(),
                "-maxdepth".to_string(),
                depth.to_string(),
                "-ls".to_string(),
            ],
            ListingFormat::Find,
        )
    }
}

/// `sh -c` script writing `content` to `path`, single quotes escaped as
/// `'"'"'`.
pub(crate) fn write_script(path: &str, content: &str) -> String {
    format!("echo {} > {}", shell_quote(content), shell_quote(path))
}

/// Tar up `path` on stdout, the way `kubectl cp` does.
pub(crate) fn archive_read_command(path: &str) -> Vec<String> {
    let trimmed = path.trim_end_matches('/');
    let (dir, name) = match trimmed.rsplit_once('/') {
        Some((dir, name)) if !dir.is_empty() => (dir.to_string(), name.to_string()),
        _ => ("/".to_string(), trimmed.trim_start_matches('/').to_string()),
    };
    vec![
        "tar".to_string(),
        "-C".to_string(),
        dir,
        "-cf".to_string(),
        "-".to_string(),
        name,
    ]
}

/// Unpack a tar stream from stdin into `path`.
pub(crate) fn archive_write_command(path: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("mkdir -p {p} && tar -xf - -C {p}", p = shell_quote(path)),
    ]
}

fn kind_from_perms(perms: &str) -> Option<FileKind> {
    match perms.chars().next()? {
        '-' => Some(FileKind::File),
        'd' => Some(FileKind::Directory),
        'l' => Some(FileKind::Symlink),
        'b' | 'c' | 's' | 'p' => Some(FileKind::Other),
        _ => None,
    }
}

/// Parse the three date tokens `ls`/`find` print.
///
/// Recent entries use `Jan 2 15:04`, older ones `Jan 2 2006`, and some
/// toolchains emit ISO dates. `None` on anything else; the caller reports
/// no modification time.
fn parse_listing_date(month: &str, day: &str, third: &str) -> Option<DateTime<Utc>> {
    if month.contains('-') {
        // ISO: `2024-05-02 10:15[:30]`
        let datetime = format!("{} {}", month, day);
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(&datetime, fmt) {
                return Some(Utc.from_utc_datetime(&naive));
            }
        }
        return None;
    }
    if third.contains(':') {
        let composed = format!("{} {} {} {}", month, day, Utc::now().year(), third);
        return NaiveDateTime::parse_from_str(&composed, "%b %e %Y %H:%M")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive));
    }
    let composed = format!("{} {} {}", month, day, third);
    NaiveDate::parse_from_str(&composed, "%b %e %Y")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse one listing line into a file entry.
///
/// Lines starting `total`, `.`/`..` entries, the base path itself, and
/// anything malformed are skipped.
pub(crate) fn parse_listing_line(line: &str, base: &str, format: ListingFormat) -> Option<BoxFile> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let offset = format.offset();
    if tokens.len() < offset + 9 {
        return None;
    }
    if tokens[0] == "total" {
        return None;
    }

    let perms = tokens[offset];
    let kind = kind_from_perms(perms)?;
    if perms.len() < 10 {
        return None;
    }

    let size: i64 = tokens[offset + 4].parse().ok()?;
    let mod_time = parse_listing_date(tokens[offset + 5], tokens[offset + 6], tokens[offset + 7]);

    let mut raw_name = tokens[offset + 8..].join(" ");
    if kind == FileKind::Symlink {
        if let Some(idx) = raw_name.find(" -> ") {
            raw_name.truncate(idx);
        }
    }
    if raw_name == "." || raw_name == ".." {
        return None;
    }

    let (name, path) = match format {
        ListingFormat::Ls => {
            let path = if base.ends_with('/') {
                format!("{}{}", base, raw_name)
            } else {
                format!("{}/{}", base, raw_name)
            };
            (raw_name, path)
        }
        ListingFormat::Find => {
            if raw_name == base {
                return None;
            }
            let name = raw_name
                .rsplit('/')
                .next()
                .unwrap_or(raw_name.as_str())
                .to_string();
            if name == "." || name == ".." {
                return None;
            }
            (name, raw_name)
        }
    };

    Some(BoxFile {
        name,
        path,
        kind,
        size,
        mode: perms.to_string(),
        mod_time,
    })
}

/// Error for a failed in-box command, preferring stderr for the detail.
pub(crate) fn exec_failure(context: &str, path: &str, streams: &StdStreams) -> SandboxError {
    let stderr = streams.stderr_utf8();
    let detail = if stderr.trim().is_empty() {
        streams.stdout_utf8()
    } else {
        stderr
    };
    if detail.contains("No such file or directory") {
        SandboxError::NotFound(format!("{}: {}", context, path))
    } else {
        SandboxError::Upstream(format!("{} {}: {}", context, path, detail.trim()))
    }
}

/// Stat an archived path from its first tar entry header.
pub(crate) fn stat_from_tar(data: &[u8], path: &str) -> SandboxResult<PathStat> {
    let mut archive = tar::Archive::new(data);
    let mut entries = archive
        .entries()
        .map_err(|e| SandboxError::Upstream(format!("reading archive: {}", e)))?;
    let entry = entries
        .next()
        .ok_or_else(|| SandboxError::NotFound(format!("archive for {} is empty", path)))?
        .map_err(|e| SandboxError::Upstream(format!("reading archive entry: {}", e)))?;

    let header = entry.header();
    let name = entry
        .path()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| {
            path.trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(path)
                .to_string()
        });

    Ok(PathStat {
        name,
        size: header.size().unwrap_or(0),
        mode: header.mode().unwrap_or(0),
        mtime: header
            .mtime()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            .unwrap_or(DateTime::UNIX_EPOCH),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_file_line() {
        let line = "-rw-r--r--    1 root     root           12 Jan  2 15:04 notes.txt";
        let entry = parse_listing_line(line, "/tmp", ListingFormat::Ls).unwrap();
        assert_eq!(entry.name, "notes.txt");
        assert_eq!(entry.path, "/tmp/notes.txt");
        assert_eq!(entry.kind, FileKind::File);
        assert_eq!(entry.size, 12);
        assert_eq!(entry.mode, "-rw-r--r--");
        assert!(entry.mod_time.is_some());
    }

    #[test]
    fn test_parse_ls_skips_noise() {
        assert!(parse_listing_line("total 16", "/tmp", ListingFormat::Ls).is_none());
        let dot = "drwxr-xr-x    2 root     root         4096 Jan  2 15:04 .";
        assert!(parse_listing_line(dot, "/tmp", ListingFormat::Ls).is_none());
        let dotdot = "drwxr-xr-x    2 root     root         4096 Jan  2 15:04 ..";
        assert!(parse_listing_line(dotdot, "/tmp", ListingFormat::Ls).is_none());
        assert!(parse_listing_line("garbage line", "/tmp", ListingFormat::Ls).is_none());
    }

    #[test]
    fn test_parse_ls_symlink_strips_target() {
        let line = "lrwxrwxrwx    1 root     root            4 Jan  2 2023 link -> /etc";
        let entry = parse_listing_line(line, "/tmp", ListingFormat::Ls).unwrap();
        assert_eq!(entry.name, "link");
        assert_eq!(entry.kind, FileKind::Symlink);
    }

    #[test]
    fn test_parse_find_line_uses_full_path() {
        let line = "   654321      4 drwxr-xr-x   2  root  root      4096 May  2 10:15 /tmp/d";
        let entry = parse_listing_line(line, "/tmp", ListingFormat::Find).unwrap();
        assert_eq!(entry.name, "d");
        assert_eq!(entry.path, "/tmp/d");
        assert_eq!(entry.kind, FileKind::Directory);
    }

    #[test]
    fn test_parse_find_skips_base_path() {
        let line = "   654320      4 drwxr-xr-x   5  root  root      4096 May  2 10:15 /tmp";
        assert!(parse_listing_line(line, "/tmp", ListingFormat::Find).is_none());
    }

    #[test]
    fn test_depth_two_listing_scenario() {
        // `/tmp/a` (file) and `/tmp/d/b` (file) under a depth-2 find.
        let output = "\
   654320      4 drwxr-xr-x   3  root  root      4096 May  2 10:15 /tmp
   654321      4 -rw-r--r--   1  root  root        10 May  2 10:15 /tmp/a
   654322      4 drwxr-xr-x   2  root  root      4096 May  2 10:15 /tmp/d
   654323      4 -rw-r--r--   1  root  root        20 May  2 10:16 /tmp/d/b
";
        let entries: Vec<BoxFile> = output
            .lines()
            .filter_map(|line| parse_listing_line(line, "/tmp", ListingFormat::Find))
            .collect();
        let summary: Vec<(&str, FileKind)> =
            entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("a", FileKind::File),
                ("d", FileKind::Directory),
                ("b", FileKind::File)
            ]
        );
    }

    #[test]
    fn test_parse_listing_date_formats() {
        assert!(parse_listing_date("Jan", "2", "15:04").is_some());
        assert!(parse_listing_date("Jan", "2", "2023").is_some());
        assert!(parse_listing_date("2024-05-02", "10:15", "x").is_some());
        assert!(parse_listing_date("??", "2", "15:04").is_none());
    }

    #[test]
    fn test_list_command_by_depth() {
        let (cmd, format) = list_command("/tmp", 0);
        assert_eq!(cmd[0], "ls");
        assert_eq!(format, ListingFormat::Ls);
        let (cmd, format) = list_command("/tmp", 1);
        assert_eq!(cmd[0], "ls");
        assert_eq!(format, ListingFormat::Ls);
        let (cmd, format) = list_command("/tmp", 3);
        assert_eq!(cmd, vec!["find", "/tmp", "-maxdepth", "3", "-ls"]);
        assert_eq!(format, ListingFormat::Find);
    }

    #[test]
    fn test_write_script_escapes_quotes() {
        assert_eq!(
            write_script("/tmp/f", "it's"),
            r#"echo 'it'"'"'s' > '/tmp/f'"#
        );
    }

    #[test]
    fn test_archive_read_command_splits_path() {
        assert_eq!(
            archive_read_command("/tmp/data.txt"),
            vec!["tar", "-C", "/tmp", "-cf", "-", "data.txt"]
        );
        assert_eq!(
            archive_read_command("/data"),
            vec!["tar", "-C", "/", "-cf", "-", "data"]
        );
    }

    #[test]
    fn test_stat_from_tar() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let content = b"hello world";
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder
            .append_data(&mut header, "greeting.txt", &content[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let stat = stat_from_tar(&data, "/tmp/greeting.txt").unwrap();
        assert_eq!(stat.name, "greeting.txt");
        assert_eq!(stat.size, 11);
        assert_eq!(stat.mode, 0o644);
        assert_eq!(stat.mtime.timestamp(), 1_700_000_000);
    }
}
