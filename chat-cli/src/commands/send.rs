//! Send a message to a peer through the shared store.

use anyhow::{Context, Result};
use duet_chat_client::{ChatConfig, ConversationSession, KvStore};
use duet_chat_types::{DeliveryState, ParticipantId};
use std::path::Path;
use std::sync::Arc;

use crate::config::Profile;

/// Run the send command.
pub async fn run(
    data_dir: &Path,
    store_dir: &Path,
    config: &ChatConfig,
    peer: &str,
    text: &str,
) -> Result<()> {
    let profile = Profile::load(data_dir).await?;
    let peer = ParticipantId::new(peer).context("Invalid peer id")?;
    let store = Arc::new(
        KvStore::open(store_dir)
            .await
            .context("Failed to open message store")?,
    );

    let session = ConversationSession::new(profile.participant_id, store, config.clone());
    session
        .switch_to(&peer)
        .await
        .context("Failed to open conversation")?;
    let message = session.send(text).await.context("Failed to send")?;
    session.close().await;

    if message.delivery_state == DeliveryState::Failed {
        anyhow::bail!("Message to {} failed; nothing was stored", peer);
    }
    println!("Sent to {}", peer);
    println!("  ID: {}", message.id);
    println!("  At: {}", message.created_at);
    Ok(())
}
