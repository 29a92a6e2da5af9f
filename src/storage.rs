//! Append-only message store: one JSON document per message under
//! `<base>/inbox/YYYY/MM/DD/`, written atomically (temp file in the target
//! directory, fsync, rename). Acceptance is only acknowledged after the
//! rename.

use chrono::{Datelike, NaiveDate};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::message::InboundMessage;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

#[derive(Clone)]
pub struct MessageStore {
    base: PathBuf,
}

impl MessageStore {
    /// Open (and create) the store root. `base` is the configured
    /// `data_dir`; messages land under `base/inbox/`.
    pub async fn open(base: &Path) -> io::Result<MessageStore> {
        let store = MessageStore {
            base: base.to_path_buf(),
        };
        create_dir(&store.inbox()).await?;
        Ok(store)
    }

    fn inbox(&self) -> PathBuf {
        self.base.join("inbox")
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.inbox()
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    /// Persist one message; returns the final path. The temp file lives in
    /// the destination directory so the rename is atomic on the same
    /// filesystem.
    pub async fn store(&self, message: &InboundMessage) -> io::Result<PathBuf> {
        let dir = self.day_dir(message.received_at.date_naive());
        create_dir(&dir).await?;

        let encoded = serde_json::to_vec(message).map_err(io::Error::other)?;
        let final_path = dir.join(format!("{}.json", message.id));
        let tmp_path = dir.join(format!(".{}.json.tmp", message.id));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(FILE_MODE);

        let mut file = options.open(&tmp_path).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path).await?;
        sync_dir(&dir).await;

        debug!(path = %final_path.display(), "stored message");
        Ok(final_path)
    }

    /// Message files for one day, sorted by name (and therefore roughly by
    /// time). Best-effort: concurrent writers may add files mid-walk.
    pub async fn list(&self, date: NaiveDate) -> io::Result<Vec<PathBuf>> {
        let dir = self.day_dir(date);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".json") && !name.starts_with('.') {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub async fn load(&self, path: &Path) -> io::Result<InboundMessage> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw).map_err(io::Error::other)
    }

    pub async fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        if let Some(parent) = dst.parent() {
            create_dir(parent).await?;
        }
        tokio::fs::rename(src, dst).await
    }

    pub async fn delete(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    /// Readiness probe: the store is usable when a scratch file can be
    /// created and removed under the inbox root.
    pub async fn probe(&self) -> bool {
        let probe = self.inbox().join(".probe");
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                true
            }
            Err(_) => false,
        }
    }
}

async fn create_dir(dir: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(dir).await
}

/// fsync the directory so the rename itself is durable. Failure is logged
/// and ignored; the data file was already synced.
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = tokio::task::spawn_blocking(move || handle.sync_all()).await;
    }
}
