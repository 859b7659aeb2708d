//! Session Archive
//!
//! Persists [`SessionRecord`]s as one JSON file per session in a directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use agent_core::error::{AgentError, Result};
use agent_core::session::SessionRecord;
use agent_core::store::SessionStore;

const EXTENSION: &str = "json";

/// Directory-backed store of session records
#[derive(Clone, Debug)]
pub struct SessionArchive {
    dir: PathBuf,
}

impl SessionArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", file_stem(session_id)))
    }

    /// Write a record, replacing any previous save of the same session
    pub async fn save(&self, record: &SessionRecord) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&record.session_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;

        // Rename over the old file so a crash never leaves a half-written record
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(session_id = %record.session_id, path = %path.display(), "Session archived");
        Ok(path)
    }

    pub async fn load(&self, session_id: &str) -> Result<SessionRecord> {
        let path = self.path_for(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AgentError::SessionNotFound(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Ids of every archived session, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(session_id_from_stem) {
                Some(id) => ids.push(id),
                None => tracing::debug!(path = %path.display(), "Ignoring file with a foreign name"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Returns whether a record was removed
    pub async fn remove(&self, session_id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Seed `store` with every archived session it does not already hold.
    ///
    /// Unreadable records are logged and skipped. Returns the number restored.
    pub async fn restore_into(&self, store: &dyn SessionStore) -> Result<usize> {
        let mut restored = 0;
        for id in self.list().await? {
            let record = match self.load(&id).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Skipping unreadable session record");
                    continue;
                }
            };
            match store.restore(record) {
                Ok(_) => restored += 1,
                Err(AgentError::SessionExists(_)) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to restore session"),
            }
        }
        Ok(restored)
    }
}

/// File-name-safe form of a session id.
///
/// ASCII alphanumerics and `-` are kept; every other byte becomes `_xx`
/// (lowercase hex), so distinct ids never share a file. The empty id is `_`.
fn file_stem(session_id: &str) -> String {
    if session_id.is_empty() {
        return "_".into();
    }
    let mut stem = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

/// Inverse of [`file_stem`]; `None` for names it could not have produced
fn session_id_from_stem(stem: &str) -> Option<String> {
    if stem == "_" {
        return Some(String::new());
    }
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'_' {
            let hex = tail.get(..2)?;
            let decoded = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
            if decoded.is_ascii_alphanumeric() || decoded == b'-' {
                return None;
            }
            bytes.push(decoded);
            rest = &tail[2..];
        } else if byte.is_ascii_alphanumeric() || byte == b'-' {
            bytes.push(byte);
            rest = tail;
        } else {
            return None;
        }
    }
    String::from_utf8(bytes).ok()
}
