//! Conversation state the orchestrator reads and updates: which agent
//! session a thread is linked to, and each conversation's project directory.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

/// A chat conversation: a chat plus an optional topic inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub chat_id: String,
    pub topic_id: Option<String>,
}

impl ConversationKey {
    pub fn new(chat_id: impl Into<String>, topic_id: Option<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            topic_id,
        }
    }

    pub fn thread(&self, agent_id: &str) -> ThreadKey {
        ThreadKey {
            conversation: self.clone(),
            agent_id: agent_id.to_string(),
        }
    }
}

/// `chat_id`, or `chat_id:topic_id` inside a topic.
impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.topic_id {
            Some(topic_id) => write!(f, "{}:{topic_id}", self.chat_id),
            None => f.write_str(&self.chat_id),
        }
    }
}

/// One agent's thread inside a conversation, `chat_id:topic_id:agent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey {
    pub conversation: ConversationKey,
    pub agent_id: String,
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.conversation.chat_id,
            self.conversation.topic_id.as_deref().unwrap_or_default(),
            self.agent_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadState {
    pub thread_key: String,
    pub thread_id: Option<String>,
    /// Carried over from a link stored under the conversation key alone.
    pub migrated: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access state file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid state file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("state write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn thread_state(&self, key: &ThreadKey) -> Option<ThreadState>;

    async fn set_thread_state(&self, key: &ThreadKey, thread_id: &str);

    async fn clear_thread_state(&self, key: &ThreadKey);

    async fn persist_threads(&self) -> Result<(), StoreError>;

    async fn project_override(&self, key: &ConversationKey) -> Option<PathBuf>;

    async fn set_project_override(&self, key: &ConversationKey, cwd: &Path);

    async fn persist_project_overrides(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoredThread {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
    #[serde(default)]
    migrated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    threads: BTreeMap<String, StoredThread>,
    #[serde(default)]
    project_overrides: BTreeMap<String, PathBuf>,
}

impl StoredState {
    fn lookup(&mut self, key: &ThreadKey) -> Option<ThreadState> {
        let thread_key = key.to_string();
        if !self.threads.contains_key(&thread_key) {
            let legacy = self.threads.remove(&key.conversation.to_string())?;
            tracing::info!(thread_key = %thread_key, "migrating thread link stored under conversation key");
            self.threads.insert(
                thread_key.clone(),
                StoredThread {
                    thread_id: legacy.thread_id,
                    migrated: true,
                },
            );
        }
        let stored = self.threads.get(&thread_key)?;
        Some(ThreadState {
            thread_id: stored.thread_id.clone(),
            migrated: stored.migrated,
            thread_key,
        })
    }
}

/// Keeps everything in memory; persisting is a no-op.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    state: RwLock<StoredState>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn thread_state(&self, key: &ThreadKey) -> Option<ThreadState> {
        self.state.write().await.lookup(key)
    }

    async fn set_thread_state(&self, key: &ThreadKey, thread_id: &str) {
        let mut state = self.state.write().await;
        let entry = state.threads.entry(key.to_string()).or_default();
        entry.thread_id = Some(thread_id.to_string());
    }

    async fn clear_thread_state(&self, key: &ThreadKey) {
        self.state.write().await.threads.remove(&key.to_string());
    }

    async fn persist_threads(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn project_override(&self, key: &ConversationKey) -> Option<PathBuf> {
        self.state
            .read()
            .await
            .project_overrides
            .get(&key.to_string())
            .cloned()
    }

    async fn set_project_override(&self, key: &ConversationKey, cwd: &Path) {
        self.state
            .write()
            .await
            .project_overrides
            .insert(key.to_string(), cwd.to_path_buf());
    }

    async fn persist_project_overrides(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory state mirrored to a TOML file. Writes replace the file
/// atomically.
#[derive(Debug)]
pub struct FileConversationStore {
    path: PathBuf,
    memory: InMemoryConversationStore,
    write_lock: Mutex<()>,
}

impl FileConversationStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => toml::from_str(&raw).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoredState::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            memory: InMemoryConversationStore {
                state: RwLock::new(state),
            },
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let encoded = toml::to_string_pretty(&*self.memory.state.read().await)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, encoded.as_bytes())).await??;
        tracing::debug!(path = %self.path.display(), "persisted conversation state");
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;
    file.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn thread_state(&self, key: &ThreadKey) -> Option<ThreadState> {
        self.memory.thread_state(key).await
    }

    async fn set_thread_state(&self, key: &ThreadKey, thread_id: &str) {
        self.memory.set_thread_state(key, thread_id).await;
    }

    async fn clear_thread_state(&self, key: &ThreadKey) {
        self.memory.clear_thread_state(key).await;
    }

    async fn persist_threads(&self) -> Result<(), StoreError> {
        self.persist().await
    }

    async fn project_override(&self, key: &ConversationKey) -> Option<PathBuf> {
        self.memory.project_override(key).await
    }

    async fn set_project_override(&self, key: &ConversationKey, cwd: &Path) {
        self.memory.set_project_override(key, cwd).await;
    }

    async fn persist_project_overrides(&self) -> Result<(), StoreError> {
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key() -> ThreadKey {
        ConversationKey::new("42", Some("7".to_string())).thread("codex")
    }

    #[test]
    fn keys_render_with_colons() {
        assert_eq!(key().to_string(), "42:7:codex");
        assert_eq!(ConversationKey::new("42", None).thread("a").to_string(), "42::a");
    }

    #[test]
    fn conversation_without_topic_has_no_trailing_separator() {
        assert_eq!(ConversationKey::new("42", None).to_string(), "42");
        assert_eq!(
            ConversationKey::new("42", Some("7".to_string())).to_string(),
            "42:7"
        );
    }

    #[tokio::test]
    async fn set_and_clear_thread_state() {
        let store = InMemoryConversationStore::new();
        assert_eq!(store.thread_state(&key()).await, None);

        store.set_thread_state(&key(), "thread-1").await;
        assert_eq!(
            store.thread_state(&key()).await,
            Some(ThreadState {
                thread_key: "42:7:codex".to_string(),
                thread_id: Some("thread-1".to_string()),
                migrated: false,
            })
        );

        store.clear_thread_state(&key()).await;
        assert_eq!(store.thread_state(&key()).await, None);
    }

    #[tokio::test]
    async fn file_store_round_trips_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.toml");
        let conversation = ConversationKey::new("42", Some("7".to_string()));

        let store = FileConversationStore::open(&path).await.expect("open");
        store.set_thread_state(&key(), "thread-1").await;
        store
            .set_project_override(&conversation, Path::new("/srv/app"))
            .await;
        store.persist_threads().await.expect("persist");

        let reopened = FileConversationStore::open(&path).await.expect("reopen");
        assert_eq!(
            reopened
                .thread_state(&key())
                .await
                .and_then(|state| state.thread_id),
            Some("thread-1".to_string())
        );
        assert_eq!(
            reopened.project_override(&conversation).await,
            Some(PathBuf::from("/srv/app"))
        );
    }

    #[tokio::test]
    async fn links_under_conversation_key_are_migrated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.toml");
        std::fs::write(&path, "[threads.\"42:7\"]\nthread_id = \"old-thread\"\n").expect("seed");

        let store = FileConversationStore::open(&path).await.expect("open");
        let state = store.thread_state(&key()).await.expect("migrated state");
        assert_eq!(state.thread_id.as_deref(), Some("old-thread"));
        assert!(state.migrated);
    }

    #[tokio::test]
    async fn topicless_links_are_migrated_from_the_chat_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.toml");
        std::fs::write(
            &path,
            "[threads.\"42\"]\nthread_id = \"old-thread\"\n\n[project_overrides]\n\"42\" = \"/srv/app\"\n",
        )
        .expect("seed");

        let conversation = ConversationKey::new("42", None);
        let store = FileConversationStore::open(&path).await.expect("open");
        let state = store
            .thread_state(&conversation.thread("codex"))
            .await
            .expect("migrated state");
        assert_eq!(state.thread_key, "42::codex");
        assert_eq!(state.thread_id.as_deref(), Some("old-thread"));
        assert!(state.migrated);
        assert_eq!(
            store.project_override(&conversation).await,
            Some(PathBuf::from("/srv/app"))
        );
    }
}
