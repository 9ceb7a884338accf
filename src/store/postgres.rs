use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool, Row};
use uuid::Uuid;

use super::Store;
use crate::error::StoreError;
use crate::types::{
    AiAttribution, Contact, ContactUpsert, Conversation, ConversationSummary, Message,
    MessageContent, MessageFilter, SortOrder, Tenant,
};

const TENANT_COLUMNS: &str = "id, name, slug, status, phone_number_id, waba_id, phone_e164_enc, \
     phone_hash, access_token_enc, verify_token_enc, password_hash, settings, created_at, updated_at";

const CONTACT_COLUMNS: &str = "id, tenant_id, wa_phone_hash, wa_phone_e164_enc, display_name, \
     last_seen_at, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, tenant_id, contact_id, channel, mode, status, \
     last_message_at, session_window_expires_at, metadata, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, tenant_id, conversation_id, contact_id, direction, \
     wa_message_id, wa_timestamp, wa_type, channel, content, status, error_code, error_message, \
     ai, created_at";

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Backend(format!("migrations failed: {err}")))?;
        Ok(Self { pool })
    }
}

fn parse_text<T>(row: &sqlx::postgres::PgRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    row.try_get::<String, _>(column)?
        .parse::<T>()
        .map_err(StoreError::Corrupt)
}

fn parse_tenant_row(row: &sqlx::postgres::PgRow) -> Result<Tenant, StoreError> {
    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        status: parse_text(row, "status")?,
        phone_number_id: row.try_get("phone_number_id")?,
        waba_id: row.try_get("waba_id")?,
        phone_e164_enc: row.try_get("phone_e164_enc")?,
        phone_hash: row.try_get("phone_hash")?,
        access_token_enc: row.try_get("access_token_enc")?,
        verify_token_enc: row.try_get("verify_token_enc")?,
        password_hash: row.try_get("password_hash")?,
        settings: row.try_get::<Value, _>("settings")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_contact_row(row: &sqlx::postgres::PgRow) -> Result<Contact, StoreError> {
    Ok(Contact {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        wa_phone_hash: row.try_get("wa_phone_hash")?,
        wa_phone_e164_enc: row.try_get("wa_phone_e164_enc")?,
        display_name: row.try_get("display_name")?,
        last_seen_at: row.try_get("last_seen_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_conversation_row(row: &sqlx::postgres::PgRow) -> Result<Conversation, StoreError> {
    Ok(Conversation {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        contact_id: row.try_get("contact_id")?,
        channel: row.try_get("channel")?,
        mode: parse_text(row, "mode")?,
        status: parse_text(row, "status")?,
        last_message_at: row.try_get("last_message_at")?,
        session_window_expires_at: row.try_get("session_window_expires_at")?,
        metadata: row.try_get::<Value, _>("metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_message_row(row: &sqlx::postgres::PgRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        conversation_id: row.try_get("conversation_id")?,
        contact_id: row.try_get("contact_id")?,
        direction: parse_text(row, "direction")?,
        wa_message_id: row.try_get("wa_message_id")?,
        wa_timestamp: row.try_get("wa_timestamp")?,
        wa_type: row.try_get("wa_type")?,
        channel: row.try_get("channel")?,
        content: row.try_get::<Json<MessageContent>, _>("content")?.0,
        status: parse_text(row, "status")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        ai: row
            .try_get::<Option<Json<AiAttribution>>, _>("ai")?
            .map(|json| json.0),
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn find_tenant_by_channel(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE phone_number_id = $1"
        ))
        .bind(phone_number_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_tenant_row).transpose()
    }

    async fn find_tenant_for_onboarding(
        &self,
        phone_number_id: &str,
        waba_id: Option<&str>,
        phone_hash: Option<&str>,
    ) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants \
             WHERE phone_number_id = $1 \
                OR ($2::text IS NOT NULL AND waba_id = $2) \
                OR ($3::text IS NOT NULL AND phone_hash = $3) \
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(phone_number_id)
        .bind(waba_id)
        .bind(phone_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_tenant_row).transpose()
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tenants \
             (id, name, slug, status, phone_number_id, waba_id, phone_e164_enc, phone_hash, \
              access_token_enc, verify_token_enc, password_hash, settings, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.slug)
        .bind(tenant.status.as_str())
        .bind(&tenant.phone_number_id)
        .bind(&tenant.waba_id)
        .bind(&tenant.phone_e164_enc)
        .bind(&tenant.phone_hash)
        .bind(&tenant.access_token_enc)
        .bind(&tenant.verify_token_enc)
        .bind(&tenant.password_hash)
        .bind(Json(&tenant.settings))
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tenants SET name = $2, slug = $3, status = $4, phone_number_id = $5, \
             waba_id = $6, phone_e164_enc = $7, phone_hash = $8, access_token_enc = $9, \
             verify_token_enc = $10, password_hash = $11, settings = $12, updated_at = $13 \
             WHERE id = $1",
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.slug)
        .bind(tenant.status.as_str())
        .bind(&tenant.phone_number_id)
        .bind(&tenant.waba_id)
        .bind(&tenant.phone_e164_enc)
        .bind(&tenant.phone_hash)
        .bind(&tenant.access_token_enc)
        .bind(&tenant.verify_token_enc)
        .bind(&tenant.password_hash)
        .bind(Json(&tenant.settings))
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("tenant {}", tenant.id)));
        }
        Ok(())
    }

    async fn upsert_contact(&self, upsert: &ContactUpsert) -> Result<Contact, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO contacts \
             (id, tenant_id, wa_phone_hash, wa_phone_e164_enc, display_name, last_seen_at, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$6,$6) \
             ON CONFLICT (tenant_id, wa_phone_hash) DO UPDATE SET \
                 last_seen_at = GREATEST(contacts.last_seen_at, EXCLUDED.last_seen_at), \
                 updated_at = EXCLUDED.updated_at, \
                 display_name = COALESCE(EXCLUDED.display_name, contacts.display_name), \
                 wa_phone_e164_enc = COALESCE(EXCLUDED.wa_phone_e164_enc, contacts.wa_phone_e164_enc) \
             RETURNING {CONTACT_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&upsert.tenant_id)
        .bind(&upsert.wa_phone_hash)
        .bind(&upsert.wa_phone_e164_enc)
        .bind(&upsert.display_name)
        .bind(upsert.seen_at)
        .fetch_one(&self.pool)
        .await?;
        parse_contact_row(&row)
    }

    async fn find_conversation(
        &self,
        tenant_id: &str,
        contact_id: &str,
        channel: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE tenant_id = $1 AND contact_id = $2 AND channel = $3 \
             ORDER BY created_at ASC LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(contact_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_conversation_row).transpose()
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversations \
             (id, tenant_id, contact_id, channel, mode, status, last_message_at, \
              session_window_expires_at, metadata, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(&conversation.id)
        .bind(&conversation.tenant_id)
        .bind(&conversation.contact_id)
        .bind(&conversation.channel)
        .bind(conversation.mode.as_str())
        .bind(conversation.status.as_str())
        .bind(conversation.last_message_at)
        .bind(conversation.session_window_expires_at)
        .bind(Json(&conversation.metadata))
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_conversation_row).transpose()
    }

    async fn list_conversations(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.*, \
                (SELECT to_jsonb(ct) FROM contacts ct \
                  WHERE ct.tenant_id = c.tenant_id AND ct.id = c.contact_id) AS contact, \
                (SELECT to_jsonb(m) FROM messages m \
                  WHERE m.tenant_id = c.tenant_id AND m.conversation_id = c.id \
                  ORDER BY m.created_at DESC, m.id DESC LIMIT 1) AS last_message \
             FROM conversations c \
             WHERE c.tenant_id = $1 \
             ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC, c.id \
             OFFSET $2 LIMIT $3",
        )
        .bind(tenant_id)
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ConversationSummary {
                    conversation: parse_conversation_row(row)?,
                    contact: row
                        .try_get::<Option<Json<Contact>>, _>("contact")?
                        .map(|json| json.0),
                    last_message: row
                        .try_get::<Option<Json<Message>>, _>("last_message")?
                        .map(|json| json.0),
                })
            })
            .collect()
    }

    async fn touch_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE conversations SET last_message_at = $3, updated_at = $3 \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(conversation_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages \
             (id, tenant_id, conversation_id, contact_id, direction, wa_message_id, wa_timestamp, \
              wa_type, channel, content, status, error_code, error_message, ai, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(&message.id)
        .bind(&message.tenant_id)
        .bind(&message.conversation_id)
        .bind(&message.contact_id)
        .bind(message.direction.as_str())
        .bind(&message.wa_message_id)
        .bind(message.wa_timestamp)
        .bind(&message.wa_type)
        .bind(&message.channel)
        .bind(Json(&message.content))
        .bind(message.status.as_str())
        .bind(&message.error_code)
        .bind(&message.error_message)
        .bind(message.ai.as_ref().map(Json))
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_messages(
        &self,
        filter: &MessageFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let order = match filter.order {
            SortOrder::NewestFirst => "DESC",
            SortOrder::OldestFirst => "ASC",
        };
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE tenant_id = $1 \
               AND ($2::text IS NULL OR conversation_id = $2) \
               AND ($3::text IS NULL OR contact_id = $3) \
               AND ($4::text IS NULL OR wa_message_id = $4) \
               AND ($5::text IS NULL OR direction = $5) \
             ORDER BY created_at {order}, id {order} \
             OFFSET $6 LIMIT $7"
        ))
        .bind(&filter.tenant_id)
        .bind(&filter.conversation_id)
        .bind(&filter.contact_id)
        .bind(&filter.wa_message_id)
        .bind(filter.direction.map(|d| d.as_str()))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }
}
