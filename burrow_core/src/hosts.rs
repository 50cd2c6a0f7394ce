//! Host name resolution.
//!
//! Forwards are published under a host name that resolves to their
//! allocated loopback address. [`HostsFile`] keeps those entries in a marked
//! section of the system hosts file.

use std::fmt::Write;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

const START_MARKER: &str = "# BEGIN burrow";
const END_MARKER: &str = "# END burrow";

#[async_trait]
pub trait Hostfile: Send + Sync {
    async fn add_host(&self, ip: &str, hostname: &str) -> io::Result<()>;

    async fn remove_host(&self, hostname: &str) -> io::Result<()>;
}

#[derive(Debug)]
pub struct HostsFile {
    path: PathBuf,
    // serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl Default for HostsFile {
    fn default() -> Self {
        Self::new()
    }
}

impl HostsFile {
    pub fn new() -> Self {
        let path = if cfg!(windows) {
            PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
        } else {
            PathBuf::from("/etc/hosts")
        };
        Self::with_path(path)
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn read(&self) -> io::Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(x) => Ok(x),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    async fn modify<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut Vec<(String, String)>) -> bool + Send,
    {
        let _guard = self.lock.lock().await;
        let content = self.read().await?;
        let mut entries = section_entries(&content);
        if !f(&mut entries) {
            return Ok(());
        }
        fs::write(&self.path, update_content(&content, &entries)).await
    }
}

#[async_trait]
impl Hostfile for HostsFile {
    async fn add_host(&self, ip: &str, hostname: &str) -> io::Result<()> {
        log::debug!("[hosts]add {} {}", ip, hostname);
        self.modify(|entries| {
            if entries.iter().any(|(i, h)| i == ip && h == hostname) {
                return false;
            }
            entries.push((ip.to_string(), hostname.to_string()));
            true
        })
        .await
    }

    async fn remove_host(&self, hostname: &str) -> io::Result<()> {
        log::debug!("[hosts]remove {}", hostname);
        self.modify(|entries| {
            let before = entries.len();
            entries.retain(|(_, h)| h != hostname);
            entries.len() != before
        })
        .await
    }
}

/// `(ip, hostname)` entries of the managed section.
fn section_entries(content: &str) -> Vec<(String, String)> {
    let Some(start) = content.find(START_MARKER) else {
        return Vec::new();
    };
    let body = &content[start + START_MARKER.len()..];
    let body = match body.find(END_MARKER) {
        Some(end) => &body[..end],
        None => body,
    };

    body.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let ip = parts.next()?;
            let host = parts.next()?;
            Some((ip.to_string(), host.to_string()))
        })
        .collect()
}

fn update_content(current_content: &str, entries: &[(String, String)]) -> String {
    let mut new_section = String::new();
    if !entries.is_empty() {
        new_section.push_str(START_MARKER);
        new_section.push('\n');
        for (ip, host) in entries {
            let _ = writeln!(new_section, "{} {}", ip, host);
        }
        new_section.push_str(END_MARKER);
    }

    if let Some(start) = current_content.find(START_MARKER) {
        // a section missing its end marker runs to the end of the file
        let end = match current_content[start..].find(END_MARKER) {
            Some(end_idx) => start + end_idx + END_MARKER.len(),
            None => current_content.len(),
        };
        let mut output = String::from(&current_content[..start]);
        output.push_str(&new_section);
        let rest = &current_content[end..];
        if new_section.is_empty() {
            output.push_str(rest.strip_prefix('\n').unwrap_or(rest));
        } else if rest.is_empty() {
            output.push('\n');
        } else {
            output.push_str(rest);
        }
        return output;
    }

    if new_section.is_empty() {
        return current_content.to_string();
    }

    let mut output = String::from(current_content);
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(&new_section);
    output.push('\n');
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(v: &[(&str, &str)]) -> Vec<(String, String)> {
        v.iter().map(|(i, h)| (i.to_string(), h.to_string())).collect()
    }

    #[test]
    fn append_new_section() {
        let content = "127.0.0.1 localhost\n";
        let new_content = update_content(content, &entries(&[("127.1.2.1", "api.svc.local")]));

        assert!(new_content.starts_with("127.0.0.1 localhost\n"));
        assert!(new_content.contains("# BEGIN burrow\n127.1.2.1 api.svc.local\n# END burrow\n"));
    }

    #[test]
    fn replace_existing_section() {
        let content = "127.0.0.1 localhost\n# BEGIN burrow\n127.1.2.1 old.local\n# END burrow\n::1 localhost\n";
        let new_content = update_content(content, &entries(&[("127.1.2.2", "new.local")]));

        assert!(new_content.contains("127.1.2.2 new.local"));
        assert!(!new_content.contains("old.local"));
        assert!(new_content.ends_with("::1 localhost\n"));
        assert_eq!(new_content.matches(START_MARKER).count(), 1);
    }

    #[test]
    fn empty_section_is_removed() {
        let content = "127.0.0.1 localhost\n# BEGIN burrow\n127.1.2.1 api\n# END burrow\n";
        assert_eq!(update_content(content, &[]), "127.0.0.1 localhost\n");
    }

    #[test]
    fn truncated_section_is_repaired() {
        let content = "127.0.0.1 localhost\n# BEGIN burrow\n127.1.2.1 api\n";
        assert_eq!(section_entries(content), entries(&[("127.1.2.1", "api")]));

        let new_content = update_content(content, &entries(&[("127.1.2.1", "api"), ("127.1.2.2", "db")]));
        assert_eq!(
            new_content,
            "127.0.0.1 localhost\n# BEGIN burrow\n127.1.2.1 api\n127.1.2.2 db\n# END burrow\n"
        );
        assert_eq!(update_content(content, &[]), "127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn add_host_to_truncated_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n# BEGIN burrow\n127.1.2.1 api\n").unwrap();

        let hosts = HostsFile::with_path(path.clone());
        hosts.add_host("127.1.2.2", "db").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches(START_MARKER).count(), 1);
        assert_eq!(content.matches(END_MARKER).count(), 1);
        assert!(content.contains("127.1.2.1 api\n127.1.2.2 db\n"));
    }

    #[test]
    fn parse_section_entries() {
        let content = "127.0.0.1 localhost\n# BEGIN burrow\n127.1.2.1 api\n::127:1:2:1 api\n# END burrow\n10.0.0.1 other\n";
        assert_eq!(
            section_entries(content),
            entries(&[("127.1.2.1", "api"), ("::127:1:2:1", "api")])
        );
    }

    #[tokio::test]
    async fn add_then_remove_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        let hosts = HostsFile::with_path(path.clone());
        hosts.add_host("127.1.2.1", "api.svc.local").await.unwrap();
        hosts.add_host("127.1.2.1", "api.svc.local").await.unwrap();
        hosts.add_host("127.1.2.2", "db.svc.local").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("api.svc.local").count(), 1);
        assert!(content.contains("127.1.2.2 db.svc.local"));

        hosts.remove_host("api.svc.local").await.unwrap();
        hosts.remove_host("db.svc.local").await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "127.0.0.1 localhost\n");
    }
}
