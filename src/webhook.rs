//! Webhook orchestration: flatten a provider delivery into message events and
//! walk each one from tenant resolution to outbound dispatch.
//!
//! Every event runs on its own task. Whatever happens inside one event,
//! including a panic, ends up as that event's [`EventReport`]; the sibling
//! events of the same delivery still run.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::contacts::{normalize_phone, ContactRegistry, PhoneHasher};
use crate::conversations::ConversationTracker;
use crate::error::{PipelineError, StoreError};
use crate::messages::MessageStore;
use crate::replies::ReplyGenerator;
use crate::store::SharedStore;
use crate::tenants::TenantDirectory;
use crate::types::{MessageContent, NewMessage};
use crate::whatsapp::WhatsAppClient;

/// One inbound provider message with the delivery-level context it came with.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub phone_number_id: Option<String>,
    pub from: Option<String>,
    pub wa_message_id: Option<String>,
    pub wa_timestamp: Option<DateTime<Utc>>,
    pub profile_name: Option<String>,
    pub message: Value,
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn profile_names(value: &Value) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for contact in value
        .get("contacts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(digits) = text_field(contact, "wa_id")
            .or_else(|| text_field(contact, "input"))
            .and_then(|id| normalize_phone(&id))
        else {
            continue;
        };
        if let Some(name) = contact.get("profile").and_then(|p| text_field(p, "name")) {
            names.insert(digits, name);
        }
    }
    names
}

fn parse_wa_timestamp(message: &Value) -> Option<DateTime<Utc>> {
    let seconds = match message.get("timestamp")? {
        Value::String(raw) => raw.trim().parse::<i64>().ok()?,
        Value::Number(number) => number.as_i64()?,
        _ => return None,
    };
    DateTime::from_timestamp(seconds, 0)
}

/// Flattens `entry[].changes[].value.messages[]` in delivery order. Segments
/// with the wrong shape are skipped; a payload without messages (status
/// callbacks, for instance) yields nothing.
pub fn extract_events(payload: &Value) -> Vec<InboundEvent> {
    let mut events = Vec::new();
    let entries = payload.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(Value::as_array);
        for change in changes.into_iter().flatten() {
            let Some(value) = change.get("value").filter(|v| v.is_object()) else {
                continue;
            };
            let phone_number_id = value
                .get("metadata")
                .and_then(|metadata| text_field(metadata, "phone_number_id"));
            let names = profile_names(value);
            let messages = value.get("messages").and_then(Value::as_array);
            for message in messages.into_iter().flatten() {
                if !message.is_object() {
                    continue;
                }
                let from = text_field(message, "from");
                let profile_name = from
                    .as_deref()
                    .and_then(normalize_phone)
                    .and_then(|digits| names.get(&digits).cloned());
                events.push(InboundEvent {
                    phone_number_id: phone_number_id.clone(),
                    from,
                    wa_message_id: text_field(message, "id"),
                    wa_timestamp: parse_wa_timestamp(message),
                    profile_name,
                    message: message.clone(),
                });
            }
        }
    }
    events
}

/// What an inbound message carries, reduced to the text the bot answers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundContent {
    pub wa_type: String,
    pub text: String,
    pub content: MessageContent,
}

pub fn inbound_content(message: &Value) -> Option<InboundContent> {
    let wa_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("text")
        .trim()
        .to_ascii_lowercase();
    let section = message.get(wa_type.as_str()).cloned().unwrap_or_else(|| json!({}));

    let (text, content) = match wa_type.as_str() {
        "text" => {
            let text = text_field(&section, "body")?;
            (text.clone(), MessageContent::text(text))
        }
        "button" => {
            let text = text_field(&section, "text")?;
            let content = MessageContent {
                payload: section.get("payload").cloned(),
                ..MessageContent::text(text.clone())
            };
            (text, content)
        }
        "interactive" => {
            let text = ["button_reply", "list_reply"]
                .iter()
                .find_map(|kind| section.get(*kind).and_then(|reply| text_field(reply, "title")))?;
            let content = MessageContent {
                interactive: Some(section.clone()),
                ..MessageContent::text(text.clone())
            };
            (text, content)
        }
        "location" => {
            let text = match text_field(&section, "name").or_else(|| text_field(&section, "address")) {
                Some(place) => format!("Shared location: {place}"),
                None => "Shared a location".to_string(),
            };
            let content = MessageContent {
                payload: Some(section.clone()),
                ..MessageContent::text(text.clone())
            };
            (text, content)
        }
        "image" | "audio" | "video" | "document" | "sticker" => {
            let caption = text_field(&section, "caption");
            let placeholder = match wa_type.as_str() {
                "image" => "Sent an image",
                "audio" => "Sent an audio message",
                "video" => "Sent a video",
                "document" => "Sent a document",
                _ => "Sent a sticker",
            };
            let text = caption.clone().unwrap_or_else(|| placeholder.to_string());
            let content = MessageContent {
                text: Some(text.clone()),
                media_id: text_field(&section, "id"),
                caption,
                ..MessageContent::default()
            };
            (text, content)
        }
        _ => return None,
    };

    Some(InboundContent {
        wa_type,
        text,
        content,
    })
}

/// Furthest point an event reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStage {
    Extracted,
    TenantResolved,
    ContactResolved,
    ConversationResolved,
    InboundPersisted,
    ReplyGenerated,
    OutboundPersisted,
    Dispatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingChannel,
    UnknownTenant,
    InactiveTenant,
    MissingSender,
    UnsupportedContent,
    ContactUnavailable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::MissingChannel => "delivery has no phone_number_id",
            Self::UnknownTenant => "no tenant for phone_number_id",
            Self::InactiveTenant => "tenant is inactive",
            Self::MissingSender => "message has no usable sender",
            Self::UnsupportedContent => "message has no usable text",
            Self::ContactUnavailable => "contact could not be recorded",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum EventOutcome {
    Dispatched,
    /// Inbound and outbound rows are stored; only the provider send failed.
    DeliveryFailed(String),
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventReport {
    pub wa_message_id: Option<String>,
    pub tenant_id: Option<String>,
    pub conversation_id: Option<String>,
    pub inbound_id: Option<String>,
    pub outbound_id: Option<String>,
    /// The inbound message had already been recorded by an earlier delivery.
    pub duplicate: bool,
    pub stage: EventStage,
    pub outcome: EventOutcome,
}

impl EventReport {
    fn new(event: &InboundEvent) -> Self {
        Self {
            wa_message_id: event.wa_message_id.clone(),
            tenant_id: None,
            conversation_id: None,
            inbound_id: None,
            outbound_id: None,
            duplicate: false,
            stage: EventStage::Extracted,
            outcome: EventOutcome::Failed("event not processed".to_string()),
        }
    }

    fn skip(mut self, reason: SkipReason) -> Self {
        info!(
            wa_message_id = ?self.wa_message_id,
            stage = ?self.stage,
            %reason,
            "skipping inbound event"
        );
        self.outcome = EventOutcome::Skipped(reason);
        self
    }

    fn fail(mut self, err: PipelineError) -> Self {
        error!(
            wa_message_id = ?self.wa_message_id,
            tenant_id = ?self.tenant_id,
            stage = ?self.stage,
            error = %err,
            "inbound event failed"
        );
        self.outcome = EventOutcome::Failed(err.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub events: Vec<EventReport>,
}

impl DeliveryReport {
    fn count(&self, predicate: impl Fn(&EventOutcome) -> bool) -> usize {
        self.events.iter().filter(|e| predicate(&e.outcome)).count()
    }

    pub fn processed(&self) -> usize {
        self.count(|o| matches!(o, EventOutcome::Dispatched | EventOutcome::DeliveryFailed(_)))
    }

    pub fn undelivered(&self) -> usize {
        self.count(|o| matches!(o, EventOutcome::DeliveryFailed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, EventOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, EventOutcome::Failed(_)))
    }
}

#[derive(Clone)]
pub struct Pipeline {
    tenants: TenantDirectory,
    contacts: ContactRegistry,
    conversations: ConversationTracker,
    messages: MessageStore,
    replies: Arc<ReplyGenerator>,
    dispatcher: WhatsAppClient,
    hasher: PhoneHasher,
    channel: String,
}

impl Pipeline {
    pub fn new(
        store: SharedStore,
        hasher: PhoneHasher,
        replies: Arc<ReplyGenerator>,
        dispatcher: WhatsAppClient,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            tenants: TenantDirectory::new(store.clone(), hasher.clone()),
            contacts: ContactRegistry::new(store.clone()),
            conversations: ConversationTracker::new(store.clone()),
            messages: MessageStore::new(store),
            replies,
            dispatcher,
            hasher,
            channel: channel.into(),
        }
    }

    pub fn tenants(&self) -> &TenantDirectory {
        &self.tenants
    }

    pub fn dispatcher(&self) -> &WhatsAppClient {
        &self.dispatcher
    }

    pub fn conversations(&self) -> &ConversationTracker {
        &self.conversations
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    /// Runs every event of a delivery in order. Never fails as a whole.
    pub async fn process_delivery(&self, payload: &Value) -> DeliveryReport {
        let events = extract_events(payload);
        if events.is_empty() {
            debug!("webhook delivery carried no messages");
            return DeliveryReport::default();
        }

        let mut report = DeliveryReport::default();
        for event in events {
            let fallback = EventReport::new(&event);
            let pipeline = self.clone();
            let result = tokio::spawn(async move { pipeline.process_event(event).await }).await;
            report.events.push(match result {
                Ok(event_report) => event_report,
                Err(join_err) => fallback.fail(PipelineError::Aborted(join_err.to_string())),
            });
        }
        info!(
            processed = report.processed(),
            undelivered = report.undelivered(),
            skipped = report.skipped(),
            failed = report.failed(),
            "webhook delivery handled"
        );
        report
    }

    pub async fn process_event(&self, event: InboundEvent) -> EventReport {
        let mut report = EventReport::new(&event);

        let Some(phone_number_id) = event.phone_number_id.as_deref() else {
            return report.skip(SkipReason::MissingChannel);
        };
        let Some(tenant) = self.tenants.resolve(phone_number_id).await else {
            return report.skip(SkipReason::UnknownTenant);
        };
        report.tenant_id = Some(tenant.id.clone());
        if !tenant.is_active() {
            return report.skip(SkipReason::InactiveTenant);
        }
        report.stage = EventStage::TenantResolved;

        let Some(from) = event.from.as_deref() else {
            return report.skip(SkipReason::MissingSender);
        };
        let Some(phone_hash) = self.hasher.hash(from) else {
            return report.skip(SkipReason::MissingSender);
        };
        let Some(inbound) = inbound_content(&event.message) else {
            return report.skip(SkipReason::UnsupportedContent);
        };
        let Some(contact) = self
            .contacts
            .upsert(&tenant.id, &phone_hash, event.profile_name.as_deref(), Some(from))
            .await
        else {
            return report.skip(SkipReason::ContactUnavailable);
        };
        report.stage = EventStage::ContactResolved;

        let conversation = match self
            .conversations
            .get_or_create(&tenant.id, &contact.id, &self.channel)
            .await
        {
            Ok(conversation) => conversation,
            Err(err) => return report.fail(PipelineError::Conversation(err)),
        };
        report.conversation_id = Some(conversation.id.clone());
        report.stage = EventStage::ConversationResolved;

        let mut message = NewMessage::inbound(&conversation, event.wa_message_id.clone());
        message.wa_type = inbound.wa_type.clone();
        message.wa_timestamp = event.wa_timestamp;
        message.content = inbound.content.clone();
        match self.messages.insert(message).await {
            Ok(stored) => {
                debug!(tenant_id = %tenant.id, message_id = %stored.id, text = %inbound.text, "inbound message stored");
                report.inbound_id = Some(stored.id);
            }
            Err(StoreError::Duplicate(constraint)) => {
                info!(
                    tenant_id = %tenant.id,
                    wa_message_id = ?event.wa_message_id,
                    %constraint,
                    "inbound message already recorded, continuing to reply"
                );
                report.duplicate = true;
            }
            Err(err) => return report.fail(PipelineError::Inbound(err)),
        }
        report.stage = EventStage::InboundPersisted;

        let reply = self.replies.reply(&tenant.name, &inbound.text).await;
        report.stage = EventStage::ReplyGenerated;

        let mut outbound = NewMessage::outbound(&conversation, reply.text.clone());
        outbound.ai = Some(reply.attribution());
        let outbound = match self.messages.insert(outbound).await {
            Ok(stored) => stored,
            Err(err) => return report.fail(PipelineError::Outbound(err)),
        };
        report.outbound_id = Some(outbound.id.clone());
        report.stage = EventStage::OutboundPersisted;

        let token = tenant.access_token().unwrap_or_default();
        match self
            .dispatcher
            .send_text(token, &tenant.phone_number_id, from, &reply.text)
            .await
        {
            Ok(_) => {
                report.stage = EventStage::Dispatched;
                report.outcome = EventOutcome::Dispatched;
                info!(
                    tenant_id = %tenant.id,
                    conversation_id = %conversation.id,
                    model = ?reply.model,
                    "reply dispatched"
                );
            }
            Err(err) => {
                warn!(
                    tenant_id = %tenant.id,
                    conversation_id = %conversation.id,
                    status = ?err.status_code(),
                    error = %err,
                    "reply stored but not delivered"
                );
                report.outcome = EventOutcome::DeliveryFailed(err.to_string());
            }
        }
        report
    }
}
