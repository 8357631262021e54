use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The log exists but could not be read back.
    #[error("Failed to read seen-entry log '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Durable set of entry ids that have already been forwarded.
///
/// Backed by an append-only file holding one id per line. The file is replayed
/// on [`SeenStore::open`] and appended to on every new id. All access goes
/// through one async mutex, so a single instance can be shared by every feed
/// poller; the check and the insert in [`SeenStore::mark_if_new`] happen under
/// the same lock.
#[derive(Debug)]
pub struct SeenStore {
    ids: Mutex<HashSet<String>>,
    path: Option<PathBuf>,
}

impl SeenStore {
    /// Opens the store at `path`, replaying every id already recorded there.
    ///
    /// A missing file is not an error: the store starts empty and the file is
    /// created on the first [`tell`](Self::tell).
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let ids = match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes)
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_owned)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No seen-entry log found, starting empty");
                HashSet::new()
            }
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        tracing::info!(path = %path.display(), entries = ids.len(), "Loaded seen-entry log");

        Ok(Self {
            ids: Mutex::new(ids),
            path: Some(path),
        })
    }

    /// A store that forgets everything when dropped.
    pub fn in_memory() -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
            path: None,
        }
    }

    /// Returns true if `id` has been recorded.
    pub async fn ask(&self, id: &str) -> bool {
        let id = sanitize_id(id);
        self.ids.lock().await.contains(&id)
    }

    /// Records `id` and appends it to the log. Recording an id twice is a no-op.
    ///
    /// Write failures are logged and swallowed: the id stays remembered for the
    /// lifetime of this process, it just may be forwarded again after a restart.
    pub async fn tell(&self, id: &str) {
        let id = sanitize_id(id);
        let mut ids = self.ids.lock().await;
        if ids.insert(id.clone()) {
            self.persist(&id).await;
        }
    }

    /// Records `id` if it is new, returning whether it was.
    pub async fn mark_if_new(&self, id: &str) -> bool {
        let id = sanitize_id(id);
        let mut ids = self.ids.lock().await;
        if !ids.insert(id.clone()) {
            return false;
        }
        self.persist(&id).await;
        true
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ids.lock().await.is_empty()
    }

    // Called with the id lock held so lines land in the order ids were added.
    async fn persist(&self, id: &str) {
        let Some(path) = &self.path else {
            return;
        };

        if let Err(e) = append_line(path, id).await {
            tracing::warn!(
                path = %path.display(),
                id = %id,
                error = %e,
                "Failed to persist seen entry, it may be re-delivered after a restart"
            );
        }
    }
}

async fn append_line(path: &Path, id: &str) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(format!("{id}\n").as_bytes()).await?;
    file.flush().await
}

/// Line breaks would split one id into two records.
fn sanitize_id(id: &str) -> String {
    id.chars().filter(|c| *c != '\n' && *c != '\r').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn temp_log(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "matrix_rssbot_seen_{}_{}",
            name,
            std::process::id()
        ));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("entries.txt")
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let path = temp_log("missing");
        let store = SeenStore::open(&path).await.unwrap();
        assert!(store.is_empty().await);
        assert!(!store.ask("anything").await);
        assert!(!path.exists(), "Opening must not create the log");
    }

    #[tokio::test]
    async fn test_tell_appends_and_replays() {
        let path = temp_log("replay");

        let store = SeenStore::open(&path).await.unwrap();
        store.tell("42").await;
        store.tell("43").await;
        store.tell("42").await;
        assert!(store.ask("42").await);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "42\n43\n");

        let reopened = SeenStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        assert!(reopened.ask("42").await);
        assert!(reopened.ask("43").await);
        assert!(!reopened.ask("44").await);
    }

    #[tokio::test]
    async fn test_mark_if_new_only_once() {
        let store = SeenStore::in_memory();
        assert!(store.mark_if_new("a").await);
        assert!(!store.mark_if_new("a").await);
        assert!(store.ask("a").await);
    }

    #[tokio::test]
    async fn test_newlines_stripped_from_ids() {
        let path = temp_log("newlines");
        let store = SeenStore::open(&path).await.unwrap();

        store.tell("multi\nline\r\nid").await;
        assert!(store.ask("multilineid").await);
        assert!(store.ask("multi\nlineid").await);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "multilineid\n");
    }

    #[tokio::test]
    async fn test_blank_lines_ignored_on_replay() {
        let path = temp_log("blank");
        std::fs::write(&path, "one\n\n\ntwo\n").unwrap();

        let store = SeenStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert!(!store.ask("").await);
    }

    #[tokio::test]
    async fn test_unwritable_log_keeps_memory() {
        let path = temp_log("unwritable")
            .parent()
            .unwrap()
            .join("no_such_dir")
            .join("entries.txt");

        let store = SeenStore::open(&path).await.unwrap();
        assert!(store.mark_if_new("x").await);
        assert!(!store.mark_if_new("x").await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_marks_admit_one_winner() {
        let store = Arc::new(SeenStore::in_memory());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.mark_if_new("shared").await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_log_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_log("perms");
        let store = SeenStore::open(&path).await.unwrap();
        store.tell("id").await;

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    proptest! {
        #[test]
        fn sanitized_ids_are_single_records(id in ".*") {
            let clean = sanitize_id(&id);
            prop_assert!(!clean.contains('\n'));
            prop_assert!(!clean.contains('\r'));
            prop_assert_eq!(sanitize_id(&clean), clean.clone());
        }
    }
}
