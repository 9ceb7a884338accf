use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::error::StoreError;
use crate::types::{
    Contact, ContactUpsert, Conversation, ConversationSummary, Message, MessageFilter, SortOrder,
    Tenant,
};

#[derive(Default)]
struct Collections {
    tenants: HashMap<String, Tenant>,
    contacts: HashMap<(String, String), Contact>,
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
}

/// In-process store with the same uniqueness rules as the Postgres schema.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tenant_count(&self) -> usize {
        self.inner.read().await.tenants.len()
    }

    pub async fn contact_count(&self) -> usize {
        self.inner.read().await.contacts.len()
    }

    pub async fn conversation_count(&self) -> usize {
        self.inner.read().await.conversations.len()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

fn tenant_conflict(existing: &Tenant, candidate: &Tenant) -> Option<&'static str> {
    if existing.id == candidate.id {
        return None;
    }
    if existing.phone_number_id == candidate.phone_number_id {
        return Some("tenants_phone_number_id_key");
    }
    match (&existing.phone_hash, &candidate.phone_hash) {
        (Some(a), Some(b)) if a == b => Some("tenants_phone_hash_key"),
        _ => None,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_tenant_by_channel(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Tenant>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tenants
            .values()
            .find(|tenant| tenant.phone_number_id == phone_number_id)
            .cloned())
    }

    async fn find_tenant_for_onboarding(
        &self,
        phone_number_id: &str,
        waba_id: Option<&str>,
        phone_hash: Option<&str>,
    ) -> Result<Option<Tenant>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches = inner
            .tenants
            .values()
            .filter(|tenant| {
                tenant.phone_number_id == phone_number_id
                    || (waba_id.is_some() && tenant.waba_id.as_deref() == waba_id)
                    || (phone_hash.is_some() && tenant.phone_hash.as_deref() == phone_hash)
            })
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(matches.first().map(|tenant| (*tenant).clone()))
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tenants.contains_key(&tenant.id) {
            return Err(StoreError::Duplicate("tenants_pkey".to_string()));
        }
        if let Some(constraint) = inner
            .tenants
            .values()
            .find_map(|existing| tenant_conflict(existing, tenant))
        {
            return Err(StoreError::Duplicate(constraint.to_string()));
        }
        inner.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.tenants.contains_key(&tenant.id) {
            return Err(StoreError::NotFound(format!("tenant {}", tenant.id)));
        }
        if let Some(constraint) = inner
            .tenants
            .values()
            .find_map(|existing| tenant_conflict(existing, tenant))
        {
            return Err(StoreError::Duplicate(constraint.to_string()));
        }
        inner.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn upsert_contact(&self, upsert: &ContactUpsert) -> Result<Contact, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (upsert.tenant_id.clone(), upsert.wa_phone_hash.clone());
        let contact = inner
            .contacts
            .entry(key)
            .and_modify(|contact| {
                contact.last_seen_at = contact.last_seen_at.max(upsert.seen_at);
                contact.updated_at = upsert.seen_at;
                if upsert.display_name.is_some() {
                    contact.display_name = upsert.display_name.clone();
                }
                if upsert.wa_phone_e164_enc.is_some() {
                    contact.wa_phone_e164_enc = upsert.wa_phone_e164_enc.clone();
                }
            })
            .or_insert_with(|| Contact {
                id: Uuid::new_v4().to_string(),
                tenant_id: upsert.tenant_id.clone(),
                wa_phone_hash: upsert.wa_phone_hash.clone(),
                wa_phone_e164_enc: upsert.wa_phone_e164_enc.clone(),
                display_name: upsert.display_name.clone(),
                last_seen_at: upsert.seen_at,
                created_at: upsert.seen_at,
                updated_at: upsert.seen_at,
            });
        Ok(contact.clone())
    }

    async fn find_conversation(
        &self,
        tenant_id: &str,
        contact_id: &str,
        channel: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .values()
            .find(|c| c.tenant_id == tenant_id && c.contact_id == contact_id && c.channel == channel)
            .cloned())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let triple_taken = inner.conversations.values().any(|c| {
            c.tenant_id == conversation.tenant_id
                && c.contact_id == conversation.contact_id
                && c.channel == conversation.channel
        });
        if triple_taken || inner.conversations.contains_key(&conversation.id) {
            return Err(StoreError::Duplicate(
                "conversations_tenant_contact_channel_key".to_string(),
            ));
        }
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .get(conversation_id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_conversations(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut conversations = inner
            .conversations
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .collect::<Vec<_>>();
        // Untouched threads sort last.
        conversations.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(conversations
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|conversation| ConversationSummary {
                contact: inner
                    .contacts
                    .values()
                    .find(|c| c.tenant_id == tenant_id && c.id == conversation.contact_id)
                    .cloned(),
                last_message: inner
                    .messages
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.tenant_id == tenant_id && m.conversation_id == conversation.id)
                    .max_by(|(ia, a), (ib, b)| a.created_at.cmp(&b.created_at).then(ia.cmp(ib)))
                    .map(|(_, m)| m.clone()),
                conversation: conversation.clone(),
            })
            .collect())
    }

    async fn touch_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .filter(|c| c.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        conversation.last_message_at = Some(at);
        conversation.updated_at = at;
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(wa_message_id) = &message.wa_message_id {
            let duplicate = inner.messages.iter().any(|m| {
                m.tenant_id == message.tenant_id
                    && m.contact_id == message.contact_id
                    && m.wa_message_id.as_ref() == Some(wa_message_id)
            });
            if duplicate {
                return Err(StoreError::Duplicate(
                    "messages_tenant_wa_message_contact_key".to_string(),
                ));
            }
        }
        if inner.messages.iter().any(|m| m.id == message.id) {
            return Err(StoreError::Duplicate("messages_pkey".to_string()));
        }
        inner.messages.push(message.clone());
        Ok(())
    }

    async fn find_messages(
        &self,
        filter: &MessageFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        // Insertion order breaks created_at ties.
        let mut found = inner
            .messages
            .iter()
            .enumerate()
            .filter(|(_, message)| filter.matches(message))
            .collect::<Vec<_>>();
        found.sort_by(|(ia, a), (ib, b)| a.created_at.cmp(&b.created_at).then(ia.cmp(ib)));
        if filter.order == SortOrder::NewestFirst {
            found.reverse();
        }
        Ok(found
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, message)| message.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationMode, ConversationStatus, NewMessage, TenantStatus};
    use chrono::Duration;
    use serde_json::Value;

    fn tenant(id: &str, phone_number_id: &str, phone_hash: Option<&str>) -> Tenant {
        let now = Utc::now();
        Tenant {
            id: id.into(),
            name: id.into(),
            slug: id.into(),
            status: TenantStatus::Active,
            phone_number_id: phone_number_id.into(),
            waba_id: None,
            phone_e164_enc: None,
            phone_hash: phone_hash.map(str::to_string),
            access_token_enc: None,
            verify_token_enc: None,
            password_hash: None,
            settings: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    fn conversation(id: &str, tenant_id: &str, contact_id: &str) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: id.into(),
            tenant_id: tenant_id.into(),
            contact_id: contact_id.into(),
            channel: "whatsapp".into(),
            mode: ConversationMode::Bot,
            status: ConversationStatus::Open,
            last_message_at: None,
            session_window_expires_at: None,
            metadata: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn tenant_channel_and_phone_hash_are_unique() {
        let store = MemoryStore::new();
        store.insert_tenant(&tenant("a", "pid1", Some("h1"))).await.unwrap();

        let err = store
            .insert_tenant(&tenant("b", "pid1", None))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
        let err = store
            .insert_tenant(&tenant("c", "pid2", Some("h1")))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
        store.insert_tenant(&tenant("d", "pid3", None)).await.unwrap();
        assert_eq!(store.tenant_count().await, 2);
    }

    #[tokio::test]
    async fn conversation_lookups_are_tenant_scoped() {
        let store = MemoryStore::new();
        store
            .insert_conversation(&conversation("c1", "t1", "p1"))
            .await
            .unwrap();
        assert!(store.get_conversation("t2", "c1").await.unwrap().is_none());
        assert!(store
            .touch_conversation("t2", "c1", Utc::now())
            .await
            .is_err());
        assert!(store
            .find_conversation("t1", "p1", "whatsapp")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn find_messages_orders_newest_first_with_pagination() {
        let store = MemoryStore::new();
        let conv = conversation("c1", "t1", "p1");
        let base = Utc::now();
        for i in 0..5 {
            let mut new = NewMessage::outbound(&conv, format!("reply {i}"));
            new.created_at = Some(base + Duration::seconds(i));
            store
                .insert_message(&new.into_message(format!("m{i}"), base))
                .await
                .unwrap();
        }
        let page = store
            .find_messages(&MessageFilter::for_tenant("t1"), 2, 1)
            .await
            .unwrap();
        let ids = page.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["m3", "m2"]);

        let oldest = store
            .find_messages(&MessageFilter::for_tenant("t1").oldest_first(), 2, 1)
            .await
            .unwrap();
        let ids = oldest.iter().map(|m| m.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn conversation_list_carries_contact_and_latest_message() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let contact = store
            .upsert_contact(&ContactUpsert {
                tenant_id: "t1".into(),
                wa_phone_hash: "h1".into(),
                wa_phone_e164_enc: None,
                display_name: Some("Asha".into()),
                seen_at: now,
            })
            .await
            .unwrap();
        let quiet = conversation("c-quiet", "t1", "nobody");
        let mut busy = conversation("c-busy", "t1", &contact.id);
        busy.channel = "sms".into();
        store.insert_conversation(&quiet).await.unwrap();
        store.insert_conversation(&busy).await.unwrap();
        store
            .insert_conversation(&conversation("c-other", "t2", &contact.id))
            .await
            .unwrap();

        for (i, text) in ["first", "second"].iter().enumerate() {
            let mut new = NewMessage::outbound(&busy, *text);
            new.created_at = Some(now + Duration::seconds(i as i64));
            store
                .insert_message(&new.into_message(format!("m{i}"), now))
                .await
                .unwrap();
        }
        store
            .touch_conversation("t1", "c-busy", now + Duration::seconds(1))
            .await
            .unwrap();

        let inbox = store.list_conversations("t1", 10, 0).await.unwrap();
        let ids = inbox
            .iter()
            .map(|s| s.conversation.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["c-busy", "c-quiet"]);
        assert_eq!(
            inbox[0].contact.as_ref().and_then(|c| c.display_name.as_deref()),
            Some("Asha")
        );
        assert_eq!(
            inbox[0]
                .last_message
                .as_ref()
                .and_then(|m| m.content.text.as_deref()),
            Some("second")
        );
        assert!(inbox[1].contact.is_none());
        assert!(inbox[1].last_message.is_none());

        let page = store.list_conversations("t1", 1, 1).await.unwrap();
        assert_eq!(page[0].conversation.id, "c-quiet");
    }
}
