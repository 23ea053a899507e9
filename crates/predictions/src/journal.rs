//! Audit log of successful upstream fetches.
//!
//! One JSON line per fetch, day-rotated files. Writes are best effort —
//! a failed write warns and the fetch that triggered it is unaffected.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};

const BOT_LOG_DIR: &str = "headway-bot";

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn resolve_repo_root() -> Option<PathBuf> {
    let mut cursor = std::env::current_dir().ok()?;
    loop {
        if cursor.join(".git").is_dir() {
            return Some(cursor);
        }
        if !cursor.pop() {
            return None;
        }
    }
}

pub fn resolve_fetch_log_dir() -> PathBuf {
    if let Ok(raw) = std::env::var("FETCH_LOG_DIR") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join(BOT_LOG_DIR);
        }
    }
    if let Some(root) = resolve_repo_root() {
        return root.join("FETCH_LOGS").join(BOT_LOG_DIR);
    }
    PathBuf::from("FETCH_LOGS").join(BOT_LOG_DIR)
}

pub struct FetchJournal {
    dir: PathBuf,
    day_key: String,
    file: File,
}

impl FetchJournal {
    pub fn open(dir: PathBuf) -> std::io::Result<Self> {
        create_dir_all(&dir)?;
        let day_key = Utc::now().format("%Y-%m-%d").to_string();
        let file = Self::open_day_file(&dir, &day_key)?;
        Ok(Self { dir, day_key, file })
    }

    fn open_day_file(dir: &Path, day_key: &str) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("fetches-{}.jsonl", day_key)))
    }

    fn rotate_if_needed(&mut self) -> std::io::Result<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if today != self.day_key {
            self.file = Self::open_day_file(&self.dir, &today)?;
            self.day_key = today;
        }
        Ok(())
    }

    pub fn write_event(&mut self, event: serde_json::Value) {
        let result = (|| -> std::io::Result<()> {
            self.rotate_if_needed()?;
            let line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            writeln!(self.file, "{}", line)?;
            self.file.flush()?;
            Ok(())
        })();

        if let Err(e) = result {
            tracing::warn!("fetch journal write failed: {}", e);
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_append_as_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("journal");
        let mut journal = FetchJournal::open(dir.clone()).unwrap();

        journal.write_event(json!({"kind": "fetch_ok", "stop_id": "place-sdmnl", "count": 4}));
        journal.write_event(json!({"kind": "fetch_ok", "stop_id": "place-orhte", "count": 0}));

        let day_key = Utc::now().format("%Y-%m-%d").to_string();
        let contents =
            std::fs::read_to_string(dir.join(format!("fetches-{}.jsonl", day_key))).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["stop_id"], "place-sdmnl");
        assert_eq!(first["count"], 4);
    }
}
