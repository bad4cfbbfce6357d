//! Show a conversation, optionally marking it read.

use anyhow::{Context, Result};
use duet_chat_client::{ChatConfig, ConversationSession, KvStore, WallClock};
use duet_chat_types::ParticipantId;
use std::path::Path;
use std::sync::Arc;

use super::print_messages;
use crate::config::Profile;

/// Options for the history command.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryOptions {
    /// Print JSON instead of text.
    pub json: bool,
    /// Mark everything from the peer read.
    pub mark_read: bool,
}

/// Run the history command.
pub async fn run(
    data_dir: &Path,
    store_dir: &Path,
    config: &ChatConfig,
    peer: &str,
    options: HistoryOptions,
) -> Result<()> {
    let profile = Profile::load(data_dir).await?;
    let local = profile.participant_id;
    let peer = ParticipantId::new(peer).context("Invalid peer id")?;
    let store = Arc::new(
        KvStore::open(store_dir)
            .await
            .context("Failed to open message store")?,
    );

    let session = ConversationSession::new(local.clone(), store, config.clone());
    session
        .switch_to(&peer)
        .await
        .context("Failed to open conversation")?;

    if options.mark_read {
        let latest_incoming = session
            .messages()?
            .iter()
            .rev()
            .find(|m| !m.is_from(&local))
            .map(|m| m.id.clone());
        if let Some(id) = latest_incoming {
            session.mark_read(&id).await.context("Failed to mark read")?;
        }
    }

    let messages = session.messages()?;
    session.close().await;
    print_messages(&messages, &local, WallClock::system().now(), options.json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_chat_client::MessageStore;
    use duet_chat_types::ConversationKey;
    use tempfile::tempdir;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    #[tokio::test]
    async fn mark_read_updates_the_store() {
        let dir = tempdir().unwrap();
        let store_dir = dir.path().join("store");
        Profile::new(pid("alice")).save(dir.path()).await.unwrap();

        let key = ConversationKey::derive(&pid("alice"), &pid("bob")).unwrap();
        let store = KvStore::open(&store_dir).await.unwrap();
        store.append(&key, &pid("bob"), "ping").await.unwrap();

        let options = HistoryOptions {
            json: false,
            mark_read: true,
        };
        run(dir.path(), &store_dir, &ChatConfig::default(), "bob", options)
            .await
            .unwrap();

        let records = store.fetch(&key).await.unwrap();
        assert!(records[0].read);
    }

    #[tokio::test]
    async fn history_of_empty_conversation_succeeds() {
        let dir = tempdir().unwrap();
        Profile::new(pid("alice")).save(dir.path()).await.unwrap();
        let result = run(
            dir.path(),
            &dir.path().join("store"),
            &ChatConfig::default(),
            "bob",
            HistoryOptions::default(),
        )
        .await;
        assert!(result.is_ok());
    }
}
