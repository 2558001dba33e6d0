//! Managed block inside the system hosts file
//!
//! Only the region between the start and end markers is ever rewritten.
//! Everything outside it is carried over byte-for-byte, and the new file is
//! swapped in with a rename so a crash mid-write leaves either the old or
//! the new file, never a torn one.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum HostsError {
    #[error("Failed to read hosts file: {0}")]
    ReadError(#[source] io::Error),
    #[error("Failed to write hosts file: {0}")]
    WriteError(#[source] io::Error),
    #[error("Managed block is malformed: {0}")]
    Malformed(String),
}

pub const HOSTS_MARKER_START: &str = "# VPN-BYPASS-MANAGED - START";
pub const HOSTS_MARKER_END: &str = "# VPN-BYPASS-MANAGED - END";

/// One pinned `ip domain` line
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostsEntry {
    pub domain: String,
    pub ip: IpAddr,
}

impl HostsEntry {
    pub fn new(domain: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            domain: domain.into(),
            ip,
        }
    }
}

/// RFC 1123 hostname check: dot-separated labels of letters, digits and
/// hyphens, no leading/trailing hyphen, at most 63 chars per label and 253
/// overall. Rejects anything that could smuggle extra tokens into a line.
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

pub struct HostsManager {
    path: PathBuf,
}

impl HostsManager {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/etc/hosts"),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the managed block with `entries`. An empty slice removes the
    /// block. Returns whether the file changed.
    pub fn replace_block(&self, entries: &[HostsEntry]) -> Result<bool, HostsError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(HostsError::ReadError(e)),
        };

        let updated = render(&content, entries)?;
        if updated == content {
            debug!("Hosts block already up to date");
            return Ok(false);
        }

        write_atomic(&self.path, &updated)?;
        info!(
            "Hosts block at {} now has {} entries",
            self.path.display(),
            entries.len()
        );
        Ok(true)
    }

    pub fn remove_block(&self) -> Result<bool, HostsError> {
        self.replace_block(&[])
    }
}

impl Default for HostsManager {
    fn default() -> Self {
        Self::new()
    }
}

fn render_block(entries: &[HostsEntry]) -> String {
    let mut sorted: Vec<&HostsEntry> = entries.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut block = String::new();
    block.push_str(HOSTS_MARKER_START);
    block.push('\n');
    for entry in sorted {
        block.push_str(&format!("{} {}\n", entry.ip, entry.domain));
    }
    block.push_str(HOSTS_MARKER_END);
    block.push('\n');
    block
}

/// Compute the new file content. Every existing managed block is dropped
/// and the new one (if any) takes the place of the first; with no existing
/// block it is appended.
fn render(content: &str, entries: &[HostsEntry]) -> Result<String, HostsError> {
    let block = if entries.is_empty() {
        String::new()
    } else {
        render_block(entries)
    };

    let mut result = String::with_capacity(content.len() + block.len());
    let mut in_block = false;
    let mut placed = false;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed == HOSTS_MARKER_START {
            if in_block {
                return Err(HostsError::Malformed("nested start marker".to_string()));
            }
            in_block = true;
            if !placed {
                result.push_str(&block);
                placed = true;
            }
            continue;
        }
        if trimmed == HOSTS_MARKER_END {
            if !in_block {
                return Err(HostsError::Malformed("end marker without start".to_string()));
            }
            in_block = false;
            continue;
        }
        if !in_block {
            result.push_str(line);
        }
    }

    if in_block {
        return Err(HostsError::Malformed("missing end marker".to_string()));
    }

    if !placed && !block.is_empty() {
        if !result.is_empty() && !result.ends_with('\n') {
            result.push('\n');
        }
        result.push_str(&block);
    }

    Ok(result)
}

fn write_atomic(path: &Path, content: &str) -> Result<(), HostsError> {
    // /etc is a symlink on macOS; replace the real file, not the link
    let target = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut tmp = NamedTempFile::new_in(&dir).map_err(HostsError::WriteError)?;
    tmp.write_all(content.as_bytes())
        .map_err(HostsError::WriteError)?;
    tmp.as_file().sync_all().map_err(HostsError::WriteError)?;

    if let Ok(meta) = fs::metadata(&target) {
        fs::set_permissions(tmp.path(), meta.permissions()).map_err(HostsError::WriteError)?;
    }

    tmp.persist(&target)
        .map_err(|e| HostsError::WriteError(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tempfile::TempDir;

    fn create_test_manager(temp_dir: &TempDir, content: &str) -> HostsManager {
        let path = temp_dir.path().join("hosts");
        fs::write(&path, content).unwrap();
        HostsManager::with_path(path)
    }

    fn entry(domain: &str, a: u8, b: u8, c: u8, d: u8) -> HostsEntry {
        HostsEntry::new(domain, IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
    }

    #[test]
    fn test_default_path() {
        let manager = HostsManager::new();
        assert_eq!(manager.path(), Path::new("/etc/hosts"));
    }

    #[test]
    fn test_render_appends_block() {
        let original = "127.0.0.1\tlocalhost\n";
        let result = render(original, &[entry("example.com", 93, 184, 216, 34)]).unwrap();

        assert!(result.starts_with(original));
        assert!(result.contains(HOSTS_MARKER_START));
        assert!(result.contains("93.184.216.34 example.com\n"));
        assert!(result.ends_with(&format!("{}\n", HOSTS_MARKER_END)));
    }

    #[test]
    fn test_render_missing_trailing_newline() {
        let original = "127.0.0.1 localhost";
        let result = render(original, &[entry("a.test", 10, 0, 0, 1)]).unwrap();
        assert!(result.starts_with("127.0.0.1 localhost\n# VPN-BYPASS-MANAGED - START\n"));
    }

    #[test]
    fn test_render_empty_entries_without_block_is_noop() {
        let original = "127.0.0.1\tlocalhost\n# comment   \n\n\n";
        assert_eq!(render(original, &[]).unwrap(), original);
    }

    #[test]
    fn test_render_replaces_in_place() {
        let original = "127.0.0.1\tlocalhost\n\
                        # VPN-BYPASS-MANAGED - START\n\
                        10.0.0.1 old.example.com\n\
                        # VPN-BYPASS-MANAGED - END\n\
                        ::1\tlocalhost\n";

        let result = render(original, &[entry("new.example.com", 10, 0, 0, 2)]).unwrap();

        assert_eq!(
            result,
            "127.0.0.1\tlocalhost\n\
             # VPN-BYPASS-MANAGED - START\n\
             10.0.0.2 new.example.com\n\
             # VPN-BYPASS-MANAGED - END\n\
             ::1\tlocalhost\n"
        );
    }

    #[test]
    fn test_render_empty_entries_removes_block() {
        let original = "a\n# VPN-BYPASS-MANAGED - START\n1.1.1.1 x.test\n# VPN-BYPASS-MANAGED - END\nb\n";
        assert_eq!(render(original, &[]).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_render_collapses_duplicate_blocks() {
        let original = "# VPN-BYPASS-MANAGED - START\n1.1.1.1 a.test\n# VPN-BYPASS-MANAGED - END\n\
                        middle\n\
                        # VPN-BYPASS-MANAGED - START\n2.2.2.2 b.test\n# VPN-BYPASS-MANAGED - END\n";
        let result = render(original, &[entry("c.test", 3, 3, 3, 3)]).unwrap();
        assert_eq!(
            result,
            "# VPN-BYPASS-MANAGED - START\n3.3.3.3 c.test\n# VPN-BYPASS-MANAGED - END\nmiddle\n"
        );
    }

    #[test]
    fn test_render_rejects_unterminated_block() {
        let original = "x\n# VPN-BYPASS-MANAGED - START\n1.1.1.1 a.test\nuser line\n";
        assert!(matches!(
            render(original, &[]),
            Err(HostsError::Malformed(_))
        ));
    }

    #[test]
    fn test_render_sorts_and_dedups() {
        let entries = vec![
            entry("b.test", 2, 2, 2, 2),
            entry("a.test", 1, 1, 1, 1),
            entry("b.test", 2, 2, 2, 2),
        ];
        let result = render("", &entries).unwrap();
        assert_eq!(
            result,
            "# VPN-BYPASS-MANAGED - START\n1.1.1.1 a.test\n2.2.2.2 b.test\n# VPN-BYPASS-MANAGED - END\n"
        );
    }

    #[test]
    fn test_ipv6_entry() {
        let entries = vec![HostsEntry::new(
            "ipv6.example.com",
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
        )];
        let result = render("", &entries).unwrap();
        assert!(result.contains("2001:db8::1 ipv6.example.com"));
    }

    #[test]
    fn test_second_update_replaces_first_and_keeps_surroundings() {
        let temp_dir = TempDir::new().unwrap();
        let prefix = "127.0.0.1\tlocalhost\n# keep   me\t\n";
        let manager = create_test_manager(&temp_dir, prefix);

        manager
            .replace_block(&[entry("one.test", 10, 0, 0, 1), entry("two.test", 10, 0, 0, 2)])
            .unwrap();
        let mut content = fs::read_to_string(manager.path()).unwrap();
        content.push_str("# appended by user\n");
        fs::write(manager.path(), &content).unwrap();

        manager.replace_block(&[entry("three.test", 10, 0, 0, 3)]).unwrap();

        let content = fs::read_to_string(manager.path()).unwrap();
        assert_eq!(
            content,
            format!(
                "{}{}\n10.0.0.3 three.test\n{}\n# appended by user\n",
                prefix, HOSTS_MARKER_START, HOSTS_MARKER_END
            )
        );
    }

    #[test]
    fn test_replace_block_reports_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let manager = create_test_manager(&temp_dir, "127.0.0.1 localhost\n");
        let entries = [entry("a.test", 1, 2, 3, 4)];

        assert!(manager.replace_block(&entries).unwrap());
        assert!(!manager.replace_block(&entries).unwrap());
        assert!(manager.remove_block().unwrap());
        assert_eq!(
            fs::read_to_string(manager.path()).unwrap(),
            "127.0.0.1 localhost\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_replace_block_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let manager = create_test_manager(&temp_dir, "127.0.0.1 localhost\n");
        fs::set_permissions(manager.path(), fs::Permissions::from_mode(0o644)).unwrap();

        manager.replace_block(&[entry("a.test", 1, 2, 3, 4)]).unwrap();

        let mode = fs::metadata(manager.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_hostname_validation() {
        assert!(is_valid_hostname("example.com"));
        assert!(is_valid_hostname("a-b.c0.test"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-bad.com"));
        assert!(!is_valid_hostname("bad..com"));
        assert!(!is_valid_hostname("evil.com\n1.2.3.4 bank.com"));
        assert!(!is_valid_hostname("space in.name"));
        assert!(!is_valid_hostname(&"a".repeat(64)));
    }
}
