//! Persistence capability: the food journal store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::CapabilityError;

/// One logged meal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub user_id: String,
    pub logged_at: DateTime<Utc>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calories: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Persistence for journal entries, scoped per user.
#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn insert(&self, entry: JournalEntry) -> Result<JournalEntry, CapabilityError>;

    /// Most recent entries first.
    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<JournalEntry>, CapabilityError>;

    /// Returns false when nothing matched.
    async fn delete(&self, user_id: &str, entry_id: &str) -> Result<bool, CapabilityError>;

    /// Case-insensitive match on description and tags, most recent first.
    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, CapabilityError>;
}

/// In-process store. Default production binding for a single-node deployment.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<JournalEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut entries: Vec<JournalEntry>, limit: usize) -> Vec<JournalEntry> {
    entries.sort_by(|a, b| b.logged_at.cmp(&a.logged_at));
    entries.truncate(limit);
    entries
}

#[async_trait]
impl JournalStore for MemoryStore {
    async fn insert(&self, entry: JournalEntry) -> Result<JournalEntry, CapabilityError> {
        if entry.description.trim().is_empty() {
            return Err(CapabilityError::InvalidInput("description cannot be empty".into()));
        }
        let mut entries = self.entries.write().await;
        let user_entries = entries.entry(entry.user_id.clone()).or_default();
        if user_entries.iter().any(|e| e.id == entry.id) {
            return Err(CapabilityError::InvalidInput(format!("duplicate entry id: {}", entry.id)));
        }
        user_entries.push(entry.clone());
        Ok(entry)
    }

    async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<JournalEntry>, CapabilityError> {
        let entries = self.entries.read().await;
        let user_entries = entries.get(user_id).cloned().unwrap_or_default();
        Ok(newest_first(user_entries, limit))
    }

    async fn delete(&self, user_id: &str, entry_id: &str) -> Result<bool, CapabilityError> {
        let mut entries = self.entries.write().await;
        let Some(user_entries) = entries.get_mut(user_id) else {
            return Ok(false);
        };
        let before = user_entries.len();
        user_entries.retain(|e| e.id != entry_id);
        Ok(user_entries.len() != before)
    }

    async fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<JournalEntry>, CapabilityError> {
        let needle = query.to_lowercase();
        let entries = self.entries.read().await;
        let matches: Vec<JournalEntry> = entries
            .get(user_id)
            .map(|user_entries| {
                user_entries
                    .iter()
                    .filter(|e| {
                        e.description.to_lowercase().contains(&needle)
                            || e.tags.iter().any(|t| t.to_lowercase().contains(&needle))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(newest_first(matches, limit))
    }
}
