//! Show the local profile and store contents.

use anyhow::Result;
use std::path::Path;

use crate::config::Profile;

/// Run the status command.
pub async fn run(data_dir: &Path, store_dir: &Path) -> Result<()> {
    println!("=== duet status ===");
    println!();

    match Profile::load(data_dir).await {
        Ok(profile) => {
            println!("Profile:");
            println!("  Participant: {}", profile.participant_id);
            println!("  Data dir:    {}", data_dir.display());
        }
        Err(_) => {
            println!("Profile: NOT INITIALIZED");
            println!();
            println!("Run 'duet init --name <id>' to initialize.");
            return Ok(());
        }
    }

    println!();
    println!("Store:");
    println!("  Dir:           {}", store_dir.display());
    println!("  Conversations: {}", count_documents(store_dir).await?);

    Ok(())
}

/// Number of conversation documents in `store_dir`.
async fn count_documents(store_dir: &Path) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(store_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().is_some_and(|ext| ext == "json") {
            count += 1;
        }
    }
    Ok(count)
}
