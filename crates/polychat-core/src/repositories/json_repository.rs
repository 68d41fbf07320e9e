use std::path::PathBuf;

use tracing::warn;

use crate::models::conversation::Conversation;

use super::conversation_repository::{BoxFuture, ConversationRepository};
use super::error::{RepositoryError, RepositoryResult};

/// Fixed storage file name for the conversation collection.
const STORE_FILE: &str = "conversations.json";

/// JSON file-based repository: the whole collection in one file under
/// the platform config directory (or an explicit directory).
pub struct JsonFileRepository {
    storage_dir: PathBuf,
}

impl JsonFileRepository {
    pub fn new() -> RepositoryResult<Self> {
        let storage_dir = dirs::config_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Could not determine config directory".to_string(),
            })?
            .join("polychat");

        Ok(Self { storage_dir })
    }

    pub fn with_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
        }
    }

    fn store_path(&self) -> PathBuf {
        self.storage_dir.join(STORE_FILE)
    }
}

impl ConversationRepository for JsonFileRepository {
    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>> {
        let path = self.store_path();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Vec::new());
                    }
                    Err(e) => return Err(RepositoryError::from(e)),
                };

                // Corruption degrades to an empty collection.
                match serde_json::from_str::<Vec<Conversation>>(&content) {
                    Ok(conversations) => Ok(conversations),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "corrupt conversation store, starting empty");
                        Ok(Vec::new())
                    }
                }
            })
            .await
            .map_err(|e| RepositoryError::InitializationError {
                message: format!("load task failed: {e}"),
            })?
        })
    }

    fn save_all(&self, snapshot: Vec<Conversation>) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.store_path();
        let storage_dir = self.storage_dir.clone();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&storage_dir)?;

                let json = serde_json::to_string_pretty(&snapshot)?;

                // Write atomically: temp file, then rename.
                let temp_path = path.with_extension("json.tmp");
                std::fs::write(&temp_path, json)?;
                std::fs::rename(&temp_path, &path)?;

                Ok(())
            })
            .await
            .map_err(|e| RepositoryError::InitializationError {
                message: format!("save task failed: {e}"),
            })?
        })
    }

    fn clear(&self) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.store_path();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                Ok(())
            })
            .await
            .map_err(|e| RepositoryError::InitializationError {
                message: format!("clear task failed: {e}"),
            })?
        })
    }
}
