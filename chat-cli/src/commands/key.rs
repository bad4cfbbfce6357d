//! Show the conversation key for a pair of participants.

use anyhow::{Context, Result};
use duet_chat_types::{ConversationKey, ParticipantId};

/// Derive the key for `a` and `b`.
pub fn derive(a: &str, b: &str) -> Result<ConversationKey> {
    let a = ParticipantId::new(a).context("Invalid first participant")?;
    let b = ParticipantId::new(b).context("Invalid second participant")?;
    ConversationKey::derive(&a, &b).context("Cannot derive conversation key")
}

/// Run the key command.
pub fn run(a: &str, b: &str) -> Result<()> {
    let key = derive(a, b)?;
    println!("Key:         {}", key);
    println!("Fingerprint: {}", key.fingerprint());
    Ok(())
}
