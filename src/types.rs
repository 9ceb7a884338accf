use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CHANNEL: &str = "whatsapp";

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} value '{}'",
                        stringify!($name),
                        other
                    )),
                }
            }
        }
    };
}

text_enum!(TenantStatus {
    Active => "active",
    Inactive => "inactive",
});

text_enum!(
    /// `Human` marks a conversation taken over by an operator; the bot still
    /// records messages but the takeover policy lives outside this crate.
    ConversationMode {
        Bot => "bot",
        Human => "human",
    }
);

text_enum!(ConversationStatus {
    Open => "open",
    Closed => "closed",
});

text_enum!(Direction {
    Inbound => "inbound",
    Outbound => "outbound",
});

text_enum!(MessageStatus {
    Received => "received",
    Queued => "queued",
    Sent => "sent",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub status: TenantStatus,
    pub phone_number_id: String,
    #[serde(default)]
    pub waba_id: Option<String>,
    #[serde(default)]
    pub phone_e164_enc: Option<String>,
    #[serde(default)]
    pub phone_hash: Option<String>,
    #[serde(default, skip_serializing)]
    pub access_token_enc: Option<String>,
    #[serde(default, skip_serializing)]
    pub verify_token_enc: Option<String>,
    #[serde(default, skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    /// The provider credential, if one has been onboarded.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token_enc
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub tenant_id: String,
    pub wa_phone_hash: String,
    #[serde(default)]
    pub wa_phone_e164_enc: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to the contact upsert. `seen_at` doubles as `created_at` on insert.
#[derive(Debug, Clone)]
pub struct ContactUpsert {
    pub tenant_id: String,
    pub wa_phone_hash: String,
    pub wa_phone_e164_enc: Option<String>,
    pub display_name: Option<String>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub channel: String,
    pub mode: ConversationMode,
    pub status: ConversationStatus,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_window_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: Some(body.into()),
            ..Self::default()
        }
    }
}

/// Which model produced an outbound reply, and how hard it was to get one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiAttribution {
    #[serde(default)]
    pub model: Option<String>,
    pub attempts: u32,
    pub fallback_used: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub contact_id: String,
    pub direction: Direction,
    #[serde(default)]
    pub wa_message_id: Option<String>,
    #[serde(default)]
    pub wa_timestamp: Option<DateTime<Utc>>,
    pub wa_type: String,
    pub channel: String,
    #[serde(default)]
    pub content: MessageContent,
    pub status: MessageStatus,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub ai: Option<AiAttribution>,
    pub created_at: DateTime<Utc>,
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: String,
    pub conversation_id: String,
    pub contact_id: String,
    pub direction: Direction,
    pub wa_message_id: Option<String>,
    pub wa_timestamp: Option<DateTime<Utc>>,
    pub wa_type: String,
    pub channel: String,
    pub content: MessageContent,
    pub status: MessageStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub ai: Option<AiAttribution>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn inbound(conversation: &Conversation, wa_message_id: Option<String>) -> Self {
        Self {
            tenant_id: conversation.tenant_id.clone(),
            conversation_id: conversation.id.clone(),
            contact_id: conversation.contact_id.clone(),
            direction: Direction::Inbound,
            wa_message_id: wa_message_id.filter(|id| !id.trim().is_empty()),
            wa_timestamp: None,
            wa_type: "text".to_string(),
            channel: conversation.channel.clone(),
            content: MessageContent::default(),
            status: MessageStatus::Received,
            error_code: None,
            error_message: None,
            ai: None,
            created_at: None,
        }
    }

    pub fn outbound(conversation: &Conversation, text: impl Into<String>) -> Self {
        Self {
            tenant_id: conversation.tenant_id.clone(),
            conversation_id: conversation.id.clone(),
            contact_id: conversation.contact_id.clone(),
            direction: Direction::Outbound,
            wa_message_id: None,
            wa_timestamp: None,
            wa_type: "text".to_string(),
            channel: conversation.channel.clone(),
            content: MessageContent::text(text),
            status: MessageStatus::Queued,
            error_code: None,
            error_message: None,
            ai: None,
            created_at: None,
        }
    }

    pub fn into_message(self, id: String, now: DateTime<Utc>) -> Message {
        Message {
            id,
            tenant_id: self.tenant_id,
            conversation_id: self.conversation_id,
            contact_id: self.contact_id,
            direction: self.direction,
            wa_message_id: self.wa_message_id,
            wa_timestamp: self.wa_timestamp,
            wa_type: self.wa_type,
            channel: self.channel,
            content: self.content,
            status: self.status,
            error_code: self.error_code,
            error_message: self.error_message,
            ai: self.ai,
            created_at: self.created_at.unwrap_or(now),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Message lookup. `tenant_id` is mandatory so no query can cross tenants.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub tenant_id: String,
    pub conversation_id: Option<String>,
    pub contact_id: Option<String>,
    pub wa_message_id: Option<String>,
    pub direction: Option<Direction>,
    pub order: SortOrder,
}

impl MessageFilter {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn contact(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }

    pub fn wa_message_id(mut self, wa_message_id: impl Into<String>) -> Self {
        self.wa_message_id = Some(wa_message_id.into());
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Chronological order, as a transcript reads.
    pub fn oldest_first(mut self) -> Self {
        self.order = SortOrder::OldestFirst;
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        message.tenant_id == self.tenant_id
            && self
                .conversation_id
                .as_ref()
                .map_or(true, |id| *id == message.conversation_id)
            && self
                .contact_id
                .as_ref()
                .map_or(true, |id| *id == message.contact_id)
            && self
                .wa_message_id
                .as_ref()
                .map_or(true, |id| message.wa_message_id.as_ref() == Some(id))
            && self.direction.map_or(true, |d| d == message.direction)
    }
}

/// One row of a tenant's inbox: the thread, who it is with, and the latest
/// message in it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub contact: Option<Contact>,
    pub last_message: Option<Message>,
}

/// Onboarding / credential-rotation request for one tenant channel.
#[derive(Debug, Clone, Deserialize)]
pub struct OnboardingRequest {
    #[serde(default)]
    pub business_name: Option<String>,
    pub whatsapp_number: String,
    pub phone_number_id: String,
    #[serde(default)]
    pub waba_id: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub verify_token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub settings: Option<Value>,
}
