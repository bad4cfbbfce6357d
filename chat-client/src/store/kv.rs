//! Flat key-value persistence: one JSON document per conversation.
//!
//! Documents live in a single directory, named after the conversation
//! key's fingerprint. Every read-modify-write holds an exclusive advisory
//! lock on the document's `.lock` file, so several processes can share the
//! directory. Writes go to a fresh temporary file that is synced and then
//! persisted over the document. Subscribers in the same process are notified after
//! every successful write; other processes see changes only through
//! `fetch` (wrap the store in a [`PollingStore`](super::PollingStore) for
//! a live feed).

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duet_chat_core::LocalClock;
use duet_chat_types::{
    ConversationKey, MessageId, ParticipantId, StoreError, StoreMessage, TypingUpdate,
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{mark_delivered_in, mark_read_in, Fanout, MessageStore, StoreFeed};
use crate::clock::WallClock;
use crate::lock;

/// On-disk form of one conversation.
#[derive(Debug, Serialize, Deserialize)]
struct ConversationDoc {
    key: ConversationKey,
    messages: Vec<StoreMessage>,
}

/// Directory-backed [`MessageStore`].
#[derive(Debug, Clone)]
pub struct KvStore {
    inner: Arc<KvInner>,
}

#[derive(Debug)]
struct KvInner {
    dir: PathBuf,
    /// Orders writers within this process; the file lock orders processes.
    write_lock: tokio::sync::Mutex<()>,
    messages: Fanout<Vec<StoreMessage>>,
    typing: Fanout<TypingUpdate>,
    clock: Mutex<(WallClock, LocalClock)>,
}

impl KvStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_clock(dir, WallClock::system()).await
    }

    /// Open a store that stamps records from `wall`.
    pub async fn open_with_clock(
        dir: impl Into<PathBuf>,
        wall: WallClock,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Io(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            inner: Arc::new(KvInner {
                dir,
                write_lock: tokio::sync::Mutex::new(()),
                messages: Fanout::new(),
                typing: Fanout::new(),
                clock: Mutex::new((wall, LocalClock::new())),
            }),
        })
    }

    /// Directory holding the documents.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of the document for `key`.
    pub fn path_for(&self, key: &ConversationKey) -> PathBuf {
        self.inner.dir.join(format!("{}.json", key.fingerprint()))
    }

    async fn load(&self, key: &ConversationKey) -> Result<Vec<StoreMessage>, StoreError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(format!("read {}: {e}", path.display()))),
        };
        let doc: ConversationDoc = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?;
        if &doc.key != key {
            return Err(StoreError::Serialization(format!(
                "{} belongs to another conversation",
                path.display()
            )));
        }
        Ok(doc.messages)
    }

    fn lock_path(&self, key: &ConversationKey) -> PathBuf {
        self.inner.dir.join(format!("{}.lock", key.fingerprint()))
    }

    /// Take the exclusive lock on `key`'s document. Held until the returned
    /// handle is dropped.
    async fn lock_document(&self, key: &ConversationKey) -> Result<File, StoreError> {
        let path = self.lock_path(key);
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| StoreError::Io(format!("open {}: {e}", path.display())))?;
            file.lock_exclusive()
                .map_err(|e| StoreError::Io(format!("lock {}: {e}", path.display())))?;
            Ok(file)
        })
        .await
        .map_err(|e| StoreError::Io(format!("lock task: {e}")))?
    }

    async fn save(&self, key: &ConversationKey, messages: &[StoreMessage]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let dir = self.inner.dir.clone();
        let doc = ConversationDoc {
            key: key.clone(),
            messages: messages.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let mut tmp = NamedTempFile::new_in(&dir)
                .map_err(|e| StoreError::Io(format!("create temp in {}: {e}", dir.display())))?;
            tmp.write_all(&bytes)
                .and_then(|()| tmp.as_file().sync_all())
                .map_err(|e| StoreError::Io(format!("write {}: {e}", tmp.path().display())))?;
            tmp.persist(&path)
                .map_err(|e| StoreError::Io(format!("persist {}: {e}", path.display())))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(format!("write task: {e}")))?
    }

    /// Read-modify-write under the document lock; notifies subscribers
    /// when `f` reports a change.
    async fn update<R>(
        &self,
        key: &ConversationKey,
        f: impl FnOnce(&mut Vec<StoreMessage>) -> Result<(R, bool), StoreError> + Send,
    ) -> Result<R, StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        // Closing the handle releases the lock.
        let _document = self.lock_document(key).await?;
        let mut messages = self.load(key).await?;
        let (result, changed) = f(&mut messages)?;
        if changed {
            self.save(key, &messages).await?;
            debug!(conversation = %key.fingerprint(), count = messages.len(), "kv document written");
            self.inner.messages.publish(key, messages);
        }
        Ok(result)
    }
}

#[async_trait]
impl MessageStore for KvStore {
    async fn append(
        &self,
        key: &ConversationKey,
        sender: &ParticipantId,
        text: &str,
    ) -> Result<StoreMessage, StoreError> {
        let clock = &self.inner.clock;
        self.update(key, |messages| {
            let created_at = {
                let mut clock = lock(clock);
                if let Some(last) = messages.iter().map(|m| m.created_at).max() {
                    clock.1.observe(last);
                }
                let now = clock.0.now();
                clock.1.next(now)
            };
            let record = StoreMessage {
                id: MessageId::new(),
                conversation_key: key.clone(),
                sender_id: sender.clone(),
                text: text.to_string(),
                created_at,
                delivered: false,
                read: false,
            };
            messages.push(record.clone());
            Ok((record, true))
        })
        .await
    }

    async fn fetch(&self, key: &ConversationKey) -> Result<Vec<StoreMessage>, StoreError> {
        self.load(key).await
    }

    async fn subscribe(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<Vec<StoreMessage>>, StoreError> {
        let current = self.load(key).await?;
        Ok(self.inner.messages.subscribe(key, Some(current)))
    }

    async fn mark_read(
        &self,
        key: &ConversationKey,
        message_id: &MessageId,
    ) -> Result<(), StoreError> {
        self.update(key, |messages| Ok(((), mark_read_in(messages, message_id)?)))
            .await
    }

    async fn mark_delivered(
        &self,
        key: &ConversationKey,
        ids: &[MessageId],
    ) -> Result<(), StoreError> {
        self.update(key, |messages| Ok(((), mark_delivered_in(messages, ids))))
            .await
    }

    async fn subscribe_typing(
        &self,
        key: &ConversationKey,
    ) -> Result<StoreFeed<TypingUpdate>, StoreError> {
        Ok(self.inner.typing.subscribe(key, None))
    }

    async fn publish_typing(
        &self,
        key: &ConversationKey,
        participant: &ParticipantId,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        // Presence is ephemeral: never persisted, only fanned out in-process.
        self.inner.typing.publish(
            key,
            TypingUpdate {
                participant: participant.clone(),
                is_typing,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn key() -> ConversationKey {
        ConversationKey::derive(&pid("alice"), &pid("bob")).unwrap()
    }

    #[tokio::test]
    async fn open_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("store");
        let store = KvStore::open(&dir).await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(store.dir(), dir.as_path());
    }

    #[tokio::test]
    async fn append_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let store = KvStore::open(tmp.path()).await.unwrap();
        let first = store.append(&key(), &pid("alice"), "hello").await.unwrap();
        let second = store.append(&key(), &pid("bob"), "hi!").await.unwrap();
        assert!(first.created_at < second.created_at);
        assert!(store.path_for(&key()).exists());

        let reopened = KvStore::open(tmp.path()).await.unwrap();
        let messages = reopened.fetch(&key()).await.unwrap();
        assert_eq!(messages, vec![first, second.clone()]);

        // Timestamps keep increasing after reopening.
        let third = reopened.append(&key(), &pid("alice"), "again").await.unwrap();
        assert!(third.created_at > second.created_at);
    }

    #[tokio::test]
    async fn missing_document_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = KvStore::open(tmp.path()).await.unwrap();
        assert!(store.fetch(&key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_document_is_a_serialization_error() {
        let tmp = TempDir::new().unwrap();
        let store = KvStore::open(tmp.path()).await.unwrap();
        tokio::fs::write(store.path_for(&key()), b"{not json")
            .await
            .unwrap();
        assert!(matches!(
            store.fetch(&key()).await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_see_writes() {
        let tmp = TempDir::new().unwrap();
        let store = KvStore::open(tmp.path()).await.unwrap();
        let mut feed = store.subscribe(&key()).await.unwrap();
        assert!(feed.recv().await.unwrap().is_empty());

        let record = store.append(&key(), &pid("bob"), "ping").await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), vec![record.clone()]);

        store.mark_read(&key(), &record.id).await.unwrap();
        assert!(feed.recv().await.unwrap()[0].read);
    }

    #[tokio::test]
    async fn mark_delivered_persists() {
        let tmp = TempDir::new().unwrap();
        let store = KvStore::open(tmp.path()).await.unwrap();
        let record = store.append(&key(), &pid("bob"), "ping").await.unwrap();
        store
            .mark_delivered(&key(), &[record.id.clone()])
            .await
            .unwrap();

        let reopened = KvStore::open(tmp.path()).await.unwrap();
        assert!(reopened.fetch(&key()).await.unwrap()[0].delivered);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handles_sharing_a_directory_keep_every_write() {
        let tmp = TempDir::new().unwrap();
        let first = KvStore::open(tmp.path()).await.unwrap();
        let second = KvStore::open(tmp.path()).await.unwrap();

        let mut writers = Vec::new();
        for (store, who) in [(first.clone(), "alice"), (second.clone(), "bob")] {
            for i in 0..15 {
                let store = store.clone();
                writers.push(tokio::spawn(async move {
                    store
                        .append(&key(), &pid(who), &format!("{who} {i}"))
                        .await
                        .unwrap()
                }));
            }
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let messages = second.fetch(&key()).await.unwrap();
        assert_eq!(messages.len(), 30);
        assert!(messages
            .windows(2)
            .all(|pair| pair[0].created_at < pair[1].created_at));

        // Only the document and its lock file remain.
        let mut names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        let fingerprint = key().fingerprint();
        assert_eq!(
            names,
            vec![format!("{fingerprint}.json"), format!("{fingerprint}.lock")]
        );
    }

    #[tokio::test]
    async fn typing_is_fanned_out_not_persisted() {
        let tmp = TempDir::new().unwrap();
        let store = KvStore::open(tmp.path()).await.unwrap();
        let mut feed = store.subscribe_typing(&key()).await.unwrap();
        store
            .publish_typing(&key(), &pid("alice"), true)
            .await
            .unwrap();
        assert!(feed.recv().await.unwrap().is_typing);
        assert!(!store.path_for(&key()).exists());
    }
}
