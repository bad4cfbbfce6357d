//! CLI command implementations.

pub mod demo;
pub mod history;
pub mod init;
pub mod key;
pub mod send;
pub mod status;

use anyhow::Result;
use duet_chat_core::relative_label;
use duet_chat_types::{DeliveryState, Message, ParticipantId, Timestamp};

/// One line per message: `[label] sender: text (state)`.
///
/// The state is shown for the local participant's messages only.
pub fn render_lines(messages: &[Message], local: &ParticipantId, now: Timestamp) -> Vec<String> {
    messages
        .iter()
        .map(|m| {
            let label = relative_label(m.created_at, now);
            if m.is_from(local) {
                format!(
                    "[{label}] {}: {} ({})",
                    m.sender_id,
                    m.text,
                    state_label(m.delivery_state)
                )
            } else {
                format!("[{label}] {}: {}", m.sender_id, m.text)
            }
        })
        .collect()
}

/// Print a message list as text or pretty JSON.
pub fn print_messages(
    messages: &[Message],
    local: &ParticipantId,
    now: Timestamp,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        println!("(no messages)");
    }
    for line in render_lines(messages, local, now) {
        println!("{line}");
    }
    Ok(())
}

fn state_label(state: DeliveryState) -> &'static str {
    match state {
        DeliveryState::Pending => "sending",
        DeliveryState::Sent => "sent",
        DeliveryState::Delivered => "delivered",
        DeliveryState::Read => "read",
        DeliveryState::Failed => "failed",
    }
}
