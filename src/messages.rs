use chrono::Utc;
use uuid::Uuid;

use crate::conversations::ConversationTracker;
use crate::error::StoreError;
use crate::store::SharedStore;
use crate::types::{Message, MessageFilter, NewMessage};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;

/// `None` means [`DEFAULT_PAGE_SIZE`]; anything else is clamped to
/// `1..=MAX_PAGE_SIZE`.
pub fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// Append-only message history.
#[derive(Clone)]
pub struct MessageStore {
    store: SharedStore,
    conversations: ConversationTracker,
}

impl MessageStore {
    pub fn new(store: SharedStore) -> Self {
        Self {
            conversations: ConversationTracker::new(store.clone()),
            store,
        }
    }

    /// Persists the message and touches its conversation.
    ///
    /// A redelivered provider message fails with [`StoreError::Duplicate`];
    /// the conversation is not touched in that case.
    pub async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
        let message = message.into_message(Uuid::new_v4().to_string(), Utc::now());
        self.store.insert_message(&message).await?;
        self.conversations
            .touch(&message.tenant_id, &message.conversation_id)
            .await;
        Ok(message)
    }

    /// Newest first unless the filter asks otherwise. See [`page_limit`].
    pub async fn find(
        &self,
        filter: &MessageFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.store
            .find_messages(filter, page_limit(limit), offset)
            .await
    }

    /// One conversation, oldest message first.
    pub async fn transcript(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let filter = MessageFilter::for_tenant(tenant_id)
            .conversation(conversation_id)
            .oldest_first();
        self.find(&filter, limit, offset).await
    }
}
