//! Append-only record of submitted nonces.
//!
//! One line per submission:
//! `YYYY-MM-DDTHH:MM:SS: <device>: <nonce> <endpoint> accepted|rejected`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use time::{macros::format_description, OffsetDateTime};

use crate::tracing::prelude::*;

pub struct ShareLog {
    file: Mutex<File>,
}

impl ShareLog {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one submission. Write failures are logged, not returned.
    pub fn record(&self, device: &str, nonce: u32, endpoint: &str, accepted: bool) {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let stamp = now
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second]"
            ))
            .unwrap_or_default();
        let verdict = if accepted { "accepted" } else { "rejected" };
        let line = format!("{stamp}: {device}: {nonce:08x} {endpoint} {verdict}\n");

        let mut file = self.file.lock().unwrap();
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "Failed to write share log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.log");

        let log = ShareLog::open(&path).unwrap();
        log.record("bus0/dev1", 0x1234_abcd, "http://pool.example/", true);
        log.record("bus0/dev1", 0x10, "http://pool.example/", false);
        drop(log);

        // Reopening appends.
        ShareLog::open(&path)
            .unwrap()
            .record("bus0/dev2", 1, "http://pool.example/", true);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(": bus0/dev1: 1234abcd http://pool.example/ accepted"));
        assert!(lines[1].ends_with(": bus0/dev1: 00000010 http://pool.example/ rejected"));
        assert_eq!(lines[0].as_bytes()[10], b'T');
    }
}
