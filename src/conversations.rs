use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::messages::page_limit;
use crate::store::SharedStore;
use crate::types::{Conversation, ConversationMode, ConversationStatus, ConversationSummary};

#[derive(Clone)]
pub struct ConversationTracker {
    store: SharedStore,
}

impl ConversationTracker {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Returns the single conversation for `(tenant_id, contact_id, channel)`,
    /// creating it in `bot` mode when the contact writes for the first time.
    ///
    /// Two first messages racing each other both try the insert; the loser
    /// hits the unique triple and reads the winner's row instead.
    pub async fn get_or_create(
        &self,
        tenant_id: &str,
        contact_id: &str,
        channel: &str,
    ) -> Result<Conversation, StoreError> {
        if let Some(existing) = self
            .store
            .find_conversation(tenant_id, contact_id, channel)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            contact_id: contact_id.to_string(),
            channel: channel.to_string(),
            mode: ConversationMode::Bot,
            status: ConversationStatus::Open,
            last_message_at: None,
            session_window_expires_at: None,
            metadata: json!({}),
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_conversation(&conversation).await {
            Ok(()) => {
                debug!(tenant_id, conversation_id = %conversation.id, "created conversation");
            }
            Err(StoreError::Duplicate(constraint)) => {
                debug!(tenant_id, contact_id, %constraint, "conversation created concurrently");
            }
            Err(err) => return Err(err),
        }

        self.store
            .find_conversation(tenant_id, contact_id, channel)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "conversation for contact {contact_id} on {channel}"
                ))
            })
    }

    pub async fn get(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        self.store.get_conversation(tenant_id, conversation_id).await
    }

    /// The tenant's inbox, most recently active thread first.
    pub async fn list(
        &self,
        tenant_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        self.store
            .list_conversations(tenant_id, page_limit(limit), offset)
            .await
    }

    /// Best-effort recency marker; failures are only logged.
    pub async fn touch(&self, tenant_id: &str, conversation_id: &str) {
        if let Err(err) = self
            .store
            .touch_conversation(tenant_id, conversation_id, Utc::now())
            .await
        {
            warn!(tenant_id, conversation_id, error = %err, "failed to touch conversation");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{MemoryStore, Store};

    #[tokio::test]
    async fn returns_same_conversation_after_first_call() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ConversationTracker::new(store.clone());

        let first = tracker.get_or_create("t1", "p1", "whatsapp").await.unwrap();
        assert_eq!(first.mode, ConversationMode::Bot);
        assert_eq!(first.status, ConversationStatus::Open);

        for _ in 0..3 {
            let again = tracker.get_or_create("t1", "p1", "whatsapp").await.unwrap();
            assert_eq!(again.id, first.id);
        }
        assert_eq!(store.conversation_count().await, 1);

        let other_channel = tracker.get_or_create("t1", "p1", "sms").await.unwrap();
        assert_ne!(other_channel.id, first.id);
    }

    #[tokio::test]
    async fn concurrent_first_messages_share_a_conversation() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ConversationTracker::new(store.clone());
        let (a, b) = tokio::join!(
            tracker.get_or_create("t1", "p1", "whatsapp"),
            tracker.get_or_create("t1", "p1", "whatsapp")
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(store.conversation_count().await, 1);
    }

    #[tokio::test]
    async fn touch_sets_recency_and_ignores_missing_rows() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ConversationTracker::new(store.clone());
        let conversation = tracker.get_or_create("t1", "p1", "whatsapp").await.unwrap();
        assert!(conversation.last_message_at.is_none());

        tracker.touch("t1", &conversation.id).await;
        tracker.touch("t1", "missing").await;

        let touched = store
            .get_conversation("t1", &conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert!(touched.last_message_at.is_some());
        assert!(touched.updated_at >= conversation.updated_at);
    }

    #[tokio::test]
    async fn inbox_is_tenant_scoped_and_shows_latest_message() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ConversationTracker::new(store.clone());
        let messages = crate::messages::MessageStore::new(store.clone());

        let older = tracker.get_or_create("t1", "p1", "whatsapp").await.unwrap();
        let newer = tracker.get_or_create("t1", "p2", "whatsapp").await.unwrap();
        tracker.get_or_create("t2", "p1", "whatsapp").await.unwrap();

        let base = chrono::Utc::now();
        for (i, (conversation, text)) in [(&older, "first thread"), (&newer, "earlier"), (&newer, "latest")]
            .into_iter()
            .enumerate()
        {
            let mut new = crate::types::NewMessage::outbound(conversation, text);
            new.created_at = Some(base + chrono::Duration::seconds(i as i64));
            messages.insert(new).await.unwrap();
        }
        store
            .touch_conversation("t1", &newer.id, base + chrono::Duration::minutes(1))
            .await
            .unwrap();

        let inbox = tracker.list("t1", None, 0).await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert!(inbox.iter().all(|s| s.conversation.tenant_id == "t1"));
        assert_eq!(inbox[0].conversation.id, newer.id);
        assert_eq!(
            inbox[0]
                .last_message
                .as_ref()
                .and_then(|m| m.content.text.as_deref()),
            Some("latest")
        );

        assert_eq!(tracker.list("t2", None, 0).await.unwrap().len(), 1);
        assert!(tracker.get("t2", &older.id).await.unwrap().is_none());
        assert!(tracker.get("t1", &older.id).await.unwrap().is_some());
    }
}
