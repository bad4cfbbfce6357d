//! Scripted two-party exchange over an in-process store.
//!
//! Useful for seeing optimistic sends, receipts and typing presence
//! without setting up two data directories.

use anyhow::{Context, Result};
use duet_chat_client::{ChatConfig, ConversationSession, MemoryStore, MessageStore, PollingStore, WallClock};
use duet_chat_types::{Message, ParticipantId};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::print_messages;

/// What the exchange produced.
#[derive(Debug)]
pub struct DemoOutcome {
    /// Alice's final message list.
    pub alice_view: Vec<Message>,
    /// Whether Bob saw Alice typing before her message arrived.
    pub bob_saw_typing: bool,
}

/// Run the demo command.
pub async fn run(config: &ChatConfig, poll: bool, json: bool) -> Result<()> {
    let memory = MemoryStore::new();
    let outcome = if poll {
        let store = PollingStore::new(memory, config.poll_interval());
        exchange(Arc::new(store), config, config.poll_interval() * 2).await?
    } else {
        exchange(Arc::new(memory), config, Duration::from_millis(50)).await?
    };

    let alice = participant("alice")?;
    if !json {
        println!("=== duet demo ===");
        println!();
        if outcome.bob_saw_typing {
            println!("bob saw: alice is typing...");
        }
        println!("alice's view:");
    }
    print_messages(&outcome.alice_view, &alice, WallClock::system().now(), json)
}

/// Alice and Bob exchange one message each; Bob reads Alice's.
///
/// `settle` is how long to wait for the other side to observe a write.
pub async fn exchange<S: MessageStore + 'static>(
    store: Arc<S>,
    config: &ChatConfig,
    settle: Duration,
) -> Result<DemoOutcome> {
    let alice_id = participant("alice")?;
    let bob_id = participant("bob")?;
    let alice = ConversationSession::new(alice_id.clone(), Arc::clone(&store), config.clone());
    let bob = ConversationSession::new(bob_id.clone(), store, config.clone());

    alice.switch_to(&bob_id).await?;
    bob.switch_to(&alice_id).await?;

    alice.keystroke().await?;
    tokio::time::sleep(settle).await;
    let bob_saw_typing = bob.peer_is_typing()?;

    let sent = alice.send("hey bob").await?;
    info!(id = %sent.id, state = ?sent.delivery_state, "alice sent");
    tokio::time::sleep(settle).await;

    bob.send("hi alice!").await?;
    let incoming = bob
        .messages()?
        .into_iter()
        .find(|m| m.is_from(&alice_id))
        .context("Bob never received Alice's message")?;
    bob.mark_read(&incoming.id).await?;
    tokio::time::sleep(settle).await;

    let alice_view = alice.messages()?;
    alice.close().await;
    bob.close().await;
    Ok(DemoOutcome {
        alice_view,
        bob_saw_typing,
    })
}

fn participant(name: &str) -> Result<ParticipantId> {
    ParticipantId::new(name).context("Invalid participant id")
}
