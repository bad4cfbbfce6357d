//! Initialize the local participant profile.

use anyhow::{Context, Result};
use duet_chat_types::ParticipantId;
use std::path::Path;

use crate::config::Profile;

/// Run the init command.
pub async fn run(data_dir: &Path, name: &str) -> Result<()> {
    if Profile::exists(data_dir) {
        anyhow::bail!(
            "Profile already initialized. Delete {} to reinitialize.",
            Profile::path(data_dir).display()
        );
    }

    let participant = ParticipantId::new(name).context("Invalid participant id")?;
    let profile = Profile::new(participant);
    profile.save(data_dir).await?;

    println!("Profile initialized.");
    println!();
    println!("  Participant: {}", profile.participant_id);
    println!("  Data dir:    {}", data_dir.display());
    println!();
    println!("Next steps:");
    println!("  duet send <peer> \"hello\"");
    println!("  duet history <peer>");

    Ok(())
}
