//! Conversation memory backed by an external key/value store.
//!
//! The manager borrows the store; it never owns it. Load/append/save is not
//! transactional: two concurrent callers on the same session may race and
//! one update can be overwritten. Callers needing strict ordering must
//! serialize externally.
//!
//! Persisted layout: at key `{prefix}:{session_id}`, a JSON document with
//! `session_id`, `messages`, `created_at`/`updated_at` (RFC 3339) and an
//! optional `metadata` object. A deleted session is an empty string at the
//! key; the read path treats missing-or-empty as "new conversation".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::types::{Message, Role};

/// Minimal key/value store surface the memory manager needs.
///
/// `set_string_with_ttl` defaults to plain `set_string`; stores with native
/// expiry should override it. When the store cannot honor a TTL, expiry is
/// advisory and `updated_at` lets a higher-level sweeper implement it.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value at `key`, `None` when absent.
    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` at `key`.
    async fn set_string(&self, key: &str, value: &str) -> Result<()>;

    /// Store `value` at `key` with a time-to-live.
    async fn set_string_with_ttl(&self, key: &str, value: &str, _ttl: Duration) -> Result<()> {
        self.set_string(key, value).await
    }
}

/// Thread-safe in-process store. Useful for tests and single-process apps.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().expect("store lock").get(key).cloned())
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .expect("store lock")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Configuration for conversation memory.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Message cap per session; 0 disables the cap.
    pub max_messages: usize,

    /// Time-to-live for stored conversations; zero means no expiry.
    pub ttl: Duration,

    /// Prefix for storage keys.
    pub key_prefix: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            ttl: Duration::from_secs(24 * 60 * 60),
            key_prefix: "unillm:session".to_string(),
        }
    }
}

/// Stored conversation state. Value-typed snapshot: mutating one does not
/// alter stored state until [`MemoryManager::save_conversation`] runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, JsonValue>,
}

impl ConversationMemory {
    /// Freshly constructed empty conversation for `session_id`.
    pub fn empty(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }
}

/// Persists per-session message history in a [`KeyValueStore`].
#[derive(Clone)]
pub struct MemoryManager {
    store: Arc<dyn KeyValueStore>,
    config: MemoryConfig,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: MemoryConfig) -> Self {
        Self { store, config }
    }

    /// Storage key for a session: `{prefix}:{session_id}` exactly.
    pub fn build_key(&self, session_id: &str) -> String {
        format!("{}:{}", self.config.key_prefix, session_id)
    }

    /// Load a conversation. A missing, tombstoned or undecodable record
    /// yields a fresh empty conversation; this is not an error.
    pub async fn load_conversation(&self, session_id: &str) -> Result<ConversationMemory> {
        let key = self.build_key(session_id);
        match self.store.get_string(&key).await? {
            Some(raw) if !raw.is_empty() => match serde_json::from_str(&raw) {
                Ok(conversation) => Ok(conversation),
                Err(err) => {
                    tracing::warn!(session_id, error = %err, "undecodable conversation record, starting fresh");
                    Ok(ConversationMemory::empty(session_id))
                }
            },
            _ => Ok(ConversationMemory::empty(session_id)),
        }
    }

    /// Apply the message cap, bump `updated_at` and write the record.
    pub async fn save_conversation(&self, mut conversation: ConversationMemory) -> Result<()> {
        conversation.messages = self.apply_message_cap(conversation.messages);
        conversation.updated_at = Utc::now();

        let key = self.build_key(&conversation.session_id);
        let raw = serde_json::to_string(&conversation)?;
        if self.config.ttl.is_zero() {
            self.store.set_string(&key, &raw).await
        } else {
            self.store
                .set_string_with_ttl(&key, &raw, self.config.ttl)
                .await
        }
    }

    /// Append one message and save.
    pub async fn append_message(&self, session_id: &str, message: Message) -> Result<()> {
        self.append_messages(session_id, vec![message]).await
    }

    /// Append several messages and save. Not transactional with respect to
    /// concurrent callers on the same session.
    pub async fn append_messages(&self, session_id: &str, messages: Vec<Message>) -> Result<()> {
        let mut conversation = self.load_conversation(session_id).await?;
        conversation.messages.extend(messages);
        self.save_conversation(conversation).await
    }

    /// Logically delete a conversation by writing an empty-string tombstone.
    pub async fn delete_conversation(&self, session_id: &str) -> Result<()> {
        let key = self.build_key(session_id);
        self.store.set_string(&key, "").await
    }

    /// Just the messages of a conversation.
    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.load_conversation(session_id).await?.messages)
    }

    /// Merge `patch` into the conversation metadata, last writer wins per
    /// key, and save.
    pub async fn set_metadata(
        &self,
        session_id: &str,
        patch: HashMap<String, JsonValue>,
    ) -> Result<()> {
        let mut conversation = self.load_conversation(session_id).await?;
        conversation.metadata.extend(patch);
        self.save_conversation(conversation).await
    }

    /// Overwrite any existing conversation with a single system message.
    pub async fn create_conversation_with_system_message(
        &self,
        session_id: &str,
        system_message: impl Into<String>,
    ) -> Result<()> {
        let mut conversation = ConversationMemory::empty(session_id);
        conversation.messages.push(Message::system(system_message));
        self.save_conversation(conversation).await
    }

    /// Enforce `max_messages`, preserving system messages.
    ///
    /// Partition into system and non-system (original order kept within
    /// each), then keep all system messages plus the most recent non-system
    /// messages that fit. When system messages alone exceed the cap, keep
    /// the first `max_messages` of them.
    fn apply_message_cap(&self, messages: Vec<Message>) -> Vec<Message> {
        let max = self.config.max_messages;
        if max == 0 || messages.len() <= max {
            return messages;
        }

        let (mut system, other): (Vec<Message>, Vec<Message>) =
            messages.into_iter().partition(|m| m.role == Role::System);

        if system.len() >= max {
            system.truncate(max);
            return system;
        }

        let headroom = max - system.len();
        let skip = other.len().saturating_sub(headroom);
        system.extend(other.into_iter().skip(skip));
        system
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_messages: usize) -> (MemoryManager, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let config = MemoryConfig {
            max_messages,
            ttl: Duration::ZERO,
            key_prefix: "test:session".to_string(),
        };
        (MemoryManager::new(store.clone(), config), store)
    }

    #[test]
    fn test_build_key() {
        let (manager, _) = manager(0);
        assert_eq!(manager.build_key("abc"), "test:session:abc");
    }

    #[test]
    fn test_default_config() {
        let config = MemoryConfig::default();
        assert_eq!(config.max_messages, 50);
        assert_eq!(config.ttl, Duration::from_secs(86_400));
        assert_eq!(config.key_prefix, "unillm:session");
    }

    #[tokio::test]
    async fn test_load_missing_session_returns_fresh_record() {
        let (manager, _) = manager(0);
        let conversation = manager.load_conversation("nope").await.unwrap();
        assert_eq!(conversation.session_id, "nope");
        assert!(conversation.messages.is_empty());
        assert!(conversation.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_load_undecodable_record_returns_fresh_record() {
        let (manager, store) = manager(0);
        store
            .set_string("test:session:s1", "{broken json")
            .await
            .unwrap();
        let conversation = manager.load_conversation("s1").await.unwrap();
        assert!(conversation.messages.is_empty());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let (manager, _) = manager(0);
        manager
            .append_messages(
                "s1",
                vec![Message::user("hi"), Message::assistant("hello")],
            )
            .await
            .unwrap();

        let loaded = manager.load_conversation("s1").await.unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].content, "hi");
        assert_eq!(loaded.messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_system_preserved_under_pruning() {
        // Ten user turns over a cap of five: the system message survives and
        // the four most recent user messages are kept in order.
        let (manager, _) = manager(5);
        manager
            .append_message("s1", Message::system("You are helpful"))
            .await
            .unwrap();
        for letter in ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"] {
            manager
                .append_message("s1", Message::user(format!("Message {letter}")))
                .await
                .unwrap();
        }

        let messages = manager.get_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "You are helpful");
        let rest: Vec<&str> = messages[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            rest,
            vec!["Message G", "Message H", "Message I", "Message J"]
        );
    }

    #[tokio::test]
    async fn test_zero_max_messages_disables_cap() {
        let (manager, _) = manager(0);
        for i in 0..100 {
            manager
                .append_message("s1", Message::user(format!("m{i}")))
                .await
                .unwrap();
        }
        assert_eq!(manager.get_messages("s1").await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_excess_system_messages_truncated_in_order() {
        let (manager, _) = manager(2);
        let conversation = ConversationMemory {
            messages: vec![
                Message::system("s1"),
                Message::system("s2"),
                Message::system("s3"),
                Message::user("u1"),
            ],
            ..ConversationMemory::empty("sys")
        };
        manager.save_conversation(conversation).await.unwrap();

        let messages = manager.get_messages("sys").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "s1");
        assert_eq!(messages[1].content, "s2");
    }

    #[tokio::test]
    async fn test_delete_writes_tombstone_and_load_starts_fresh() {
        let (manager, store) = manager(0);
        manager
            .append_message("s1", Message::user("hi"))
            .await
            .unwrap();
        manager.delete_conversation("s1").await.unwrap();

        let raw = store.get_string("test:session:s1").await.unwrap();
        assert_eq!(raw.as_deref(), Some(""));

        let conversation = manager.load_conversation("s1").await.unwrap();
        assert!(conversation.messages.is_empty());
    }

    #[tokio::test]
    async fn test_set_metadata_merges_last_writer_wins() {
        let (manager, _) = manager(0);
        let mut first = HashMap::new();
        first.insert("topic".to_string(), serde_json::json!("rust"));
        first.insert("lang".to_string(), serde_json::json!("en"));
        manager.set_metadata("s1", first).await.unwrap();

        let mut second = HashMap::new();
        second.insert("topic".to_string(), serde_json::json!("llms"));
        manager.set_metadata("s1", second).await.unwrap();

        let conversation = manager.load_conversation("s1").await.unwrap();
        assert_eq!(conversation.metadata["topic"], serde_json::json!("llms"));
        assert_eq!(conversation.metadata["lang"], serde_json::json!("en"));
    }

    #[tokio::test]
    async fn test_create_with_system_message_overwrites() {
        let (manager, _) = manager(0);
        manager
            .append_message("s1", Message::user("old turn"))
            .await
            .unwrap();
        manager
            .create_conversation_with_system_message("s1", "Be brief")
            .await
            .unwrap();

        let messages = manager.get_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "Be brief");
    }

    #[tokio::test]
    async fn test_persisted_layout_fields() {
        let (manager, store) = manager(0);
        manager
            .append_message("s1", Message::user("hi"))
            .await
            .unwrap();

        let raw = store.get_string("test:session:s1").await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["session_id"], "s1");
        assert!(value["messages"].is_array());
        assert!(value["created_at"].is_string());
        assert!(value["updated_at"].is_string());
    }
}
