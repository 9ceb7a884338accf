use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::error;

use crate::store::SharedStore;
use crate::types::{Contact, ContactUpsert};

/// Digits only; `None` when nothing numeric is left.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Turns a raw phone number into the stable hash contacts are keyed on.
///
/// With a key the digest is HMAC-SHA256, otherwise plain SHA-256. Either way
/// `"+1 (555) 010"` and `"1555010"` hash identically.
#[derive(Clone, Default)]
pub struct PhoneHasher {
    key: Option<Vec<u8>>,
}

impl PhoneHasher {
    pub fn new(key: Option<&str>) -> Self {
        Self {
            key: key
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(|key| key.as_bytes().to_vec()),
        }
    }

    pub fn hash(&self, raw_phone: &str) -> Option<String> {
        let digits = normalize_phone(raw_phone)?;
        let digest = match &self.key {
            Some(key) => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key).ok()?;
                mac.update(digits.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            None => Sha256::digest(digits.as_bytes()).to_vec(),
        };
        Some(hex::encode(digest))
    }
}

#[derive(Clone)]
pub struct ContactRegistry {
    store: SharedStore,
}

impl ContactRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Upserts on `(tenant_id, wa_phone_hash)`. Store failures are logged and
    /// come back as `None`; the caller drops the event.
    pub async fn upsert(
        &self,
        tenant_id: &str,
        wa_phone_hash: &str,
        display_name: Option<&str>,
        wa_phone_e164: Option<&str>,
    ) -> Option<Contact> {
        let upsert = ContactUpsert {
            tenant_id: tenant_id.to_string(),
            wa_phone_hash: wa_phone_hash.to_string(),
            wa_phone_e164_enc: wa_phone_e164
                .map(str::trim)
                .filter(|phone| !phone.is_empty())
                .map(str::to_string),
            display_name: display_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            seen_at: Utc::now(),
        };
        match self.store.upsert_contact(&upsert).await {
            Ok(contact) => Some(contact),
            Err(err) => {
                error!(tenant_id, error = %err, "failed to upsert contact");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, Store};
    use crate::types::{Conversation, ConversationSummary, Message, MessageFilter, Tenant};

    #[test]
    fn normalize_keeps_digits_only() {
        assert_eq!(normalize_phone("+1 (555) 010-99"), Some("155501099".into()));
        assert_eq!(normalize_phone("n/a"), None);
    }

    #[test]
    fn hashing_ignores_formatting() {
        let hasher = PhoneHasher::new(None);
        assert_eq!(hasher.hash("+1 555 0100"), hasher.hash("15550100"));
        assert_eq!(hasher.hash("+1 555 0100").unwrap().len(), 64);
        assert_eq!(hasher.hash("---"), None);
    }

    #[test]
    fn keyed_hash_differs_from_plain_hash() {
        let plain = PhoneHasher::new(None).hash("+15550100");
        let keyed = PhoneHasher::new(Some("pepper")).hash("+15550100");
        assert_ne!(plain, keyed);
        assert_eq!(PhoneHasher::new(Some("  ")).hash("+15550100"), plain);
    }

    #[tokio::test]
    async fn repeated_upserts_keep_one_contact_and_advance_last_seen() {
        let store = Arc::new(MemoryStore::new());
        let registry = ContactRegistry::new(store.clone());

        let first = registry.upsert("t1", "hash", None, None).await.unwrap();
        let second = registry
            .upsert("t1", "hash", Some("Asha"), Some("+15550100"))
            .await
            .unwrap();
        let third = registry.upsert("t1", "hash", None, None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.id, third.id);
        assert!(second.last_seen_at >= first.last_seen_at);
        assert!(third.last_seen_at >= second.last_seen_at);
        assert_eq!(third.display_name.as_deref(), Some("Asha"));
        assert_eq!(third.created_at, first.created_at);
        assert_eq!(store.contact_count().await, 1);

        registry.upsert("t2", "hash", None, None).await.unwrap();
        assert_eq!(store.contact_count().await, 2);
    }

    #[tokio::test]
    async fn concurrent_upserts_do_not_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let registry = ContactRegistry::new(store.clone());
        let (a, b) = tokio::join!(
            registry.upsert("t1", "hash", None, None),
            registry.upsert("t1", "hash", None, None)
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(store.contact_count().await, 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl Store for BrokenStore {
        async fn find_tenant_by_channel(&self, _: &str) -> Result<Option<Tenant>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn find_tenant_for_onboarding(
            &self,
            _: &str,
            _: Option<&str>,
            _: Option<&str>,
        ) -> Result<Option<Tenant>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn insert_tenant(&self, _: &Tenant) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn update_tenant(&self, _: &Tenant) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn upsert_contact(&self, _: &ContactUpsert) -> Result<Contact, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn find_conversation(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Option<Conversation>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn insert_conversation(&self, _: &Conversation) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn get_conversation(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<Conversation>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn list_conversations(
            &self,
            _: &str,
            _: usize,
            _: usize,
        ) -> Result<Vec<ConversationSummary>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn touch_conversation(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn insert_message(&self, _: &Message) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn find_messages(
            &self,
            _: &MessageFilter,
            _: usize,
            _: usize,
        ) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_yields_none() {
        let registry = ContactRegistry::new(Arc::new(BrokenStore));
        assert!(registry.upsert("t1", "hash", None, None).await.is_none());
    }
}
