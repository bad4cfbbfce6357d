//! Configuration management for duet.

use anyhow::{Context, Result};
use duet_chat_client::ChatConfig;
use duet_chat_types::ParticipantId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const PROFILE_FILE: &str = "profile.json";
const CONFIG_FILE: &str = "duet.toml";

/// Local participant identity stored in the data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Who this data directory speaks for.
    pub participant_id: ParticipantId,
    /// When the profile was created (Unix seconds).
    pub created_at: u64,
}

impl Profile {
    /// Create a new profile for `participant_id`.
    pub fn new(participant_id: ParticipantId) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            participant_id,
            created_at,
        }
    }

    /// Load the profile from a data directory.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(PROFILE_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .context("Profile not initialized. Run 'duet init --name <id>' first.")?;
        serde_json::from_str(&contents).context("Invalid profile")
    }

    /// Save the profile to a data directory.
    pub async fn save(&self, data_dir: &Path) -> Result<()> {
        let path = data_dir.join(PROFILE_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, contents)
            .await
            .context("Failed to save profile")?;
        Ok(())
    }

    /// Check if a profile exists.
    pub fn exists(data_dir: &Path) -> bool {
        data_dir.join(PROFILE_FILE).exists()
    }

    /// Path of the profile file.
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(PROFILE_FILE)
    }
}

/// Load the engine configuration.
///
/// An explicit path must exist. Without one, `duet.toml` in the data
/// directory is used when present, and the defaults otherwise.
pub fn load_chat_config(data_dir: &Path, explicit: Option<&Path>) -> Result<ChatConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default = data_dir.join(CONFIG_FILE);
            if !default.exists() {
                return Ok(ChatConfig::default());
            }
            default
        }
    };
    ChatConfig::from_file(&path).with_context(|| format!("Failed to load {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn profile_roundtrips_through_data_dir() {
        let dir = tempdir().unwrap();
        assert!(!Profile::exists(dir.path()));

        let profile = Profile::new(ParticipantId::new("alice").unwrap());
        profile.save(dir.path()).await.unwrap();
        assert!(Profile::exists(dir.path()));

        let loaded = Profile::load(dir.path()).await.unwrap();
        assert_eq!(loaded.participant_id.as_str(), "alice");
        assert_eq!(loaded.created_at, profile.created_at);
    }

    #[tokio::test]
    async fn missing_profile_explains_how_to_init() {
        let dir = tempdir().unwrap();
        let err = Profile::load(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("duet init"), "got: {err}");
    }

    #[test]
    fn chat_config_defaults_without_file() {
        let dir = tempdir().unwrap();
        let config = load_chat_config(dir.path(), None).unwrap();
        assert_eq!(config.reconciliation_window_ms, 3_000);
    }

    #[test]
    fn chat_config_reads_data_dir_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "send_timeout_ms = 500\n").unwrap();
        let config = load_chat_config(dir.path(), None).unwrap();
        assert_eq!(config.send_timeout_ms, 500);
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_chat_config(dir.path(), Some(&missing)).is_err());
    }
}
