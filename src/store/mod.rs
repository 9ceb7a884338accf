//! Document store abstraction over the four tenant-scoped collections.
//!
//! The process builds exactly one store at start-up and hands an
//! [`SharedStore`] to every component. Tests substitute [`MemoryStore`].

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    Contact, ContactUpsert, Conversation, ConversationSummary, Message, MessageFilter, Tenant,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type SharedStore = Arc<dyn Store>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Exact match on the provider channel id.
    async fn find_tenant_by_channel(&self, phone_number_id: &str)
        -> Result<Option<Tenant>, StoreError>;

    /// Finds the tenant an onboarding call should update: any tenant whose
    /// channel id, business account id or phone hash matches.
    async fn find_tenant_for_onboarding(
        &self,
        phone_number_id: &str,
        waba_id: Option<&str>,
        phone_hash: Option<&str>,
    ) -> Result<Option<Tenant>, StoreError>;

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    /// Atomic upsert keyed on `(tenant_id, wa_phone_hash)`. `last_seen_at`
    /// never moves backwards.
    async fn upsert_contact(&self, upsert: &ContactUpsert) -> Result<Contact, StoreError>;

    async fn find_conversation(
        &self,
        tenant_id: &str,
        contact_id: &str,
        channel: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Fails with [`StoreError::Duplicate`] when the
    /// `(tenant_id, contact_id, channel)` triple already exists.
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    async fn get_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    /// The tenant's conversations, most recently active first, each with its
    /// contact and latest message.
    async fn list_conversations(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn touch_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Duplicate`] when a message with the same
    /// `(tenant_id, wa_message_id, contact_id)` exists. Messages without a
    /// provider id never conflict.
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Ordered by `filter.order`, then `offset`/`limit`.
    async fn find_messages(
        &self,
        filter: &MessageFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError>;
}
