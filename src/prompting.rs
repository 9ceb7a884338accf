use std::path::Path;

use minijinja::{context, Environment};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_SYSTEM_TEMPLATE: &str = "You are a polite and professional AI assistant for \
{% if business_name %}{{ business_name }}, {% endif %}a small local business on WhatsApp. \
Answer clearly and concisely to help customers with product availability, pricing, and order support. \
If you don't know the answer, politely say so and ask the customer to wait.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

fn default_examples() -> Vec<ChatMessage> {
    vec![
        ChatMessage::new("user", "Do you have basmati rice 5kg?"),
        ChatMessage::new(
            "assistant",
            "Yes, we have 5kg basmati rice available. Would you like to place an order?",
        ),
        ChatMessage::new("user", "What is the price of 2-liter mustard oil?"),
        ChatMessage::new(
            "assistant",
            "The 2-liter mustard oil is ₹280. Would you like it delivered today?",
        ),
    ]
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_TEMPLATE.to_string()
}

/// System prompt template plus few-shot exchanges, loaded from a JSON file
/// shaped like `{"system_prompt": "...", "conversation_examples": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_examples")]
    pub conversation_examples: Vec<ChatMessage>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            conversation_examples: default_examples(),
        }
    }
}

impl PromptConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let prompts_error = |message: String| ConfigError::Prompts {
            path: path.display().to_string(),
            message,
        };
        let raw = std::fs::read_to_string(path).map_err(|err| prompts_error(err.to_string()))?;
        serde_json::from_str(&raw).map_err(|err| prompts_error(err.to_string()))
    }

    pub fn render_system_prompt(&self, business_name: &str) -> String {
        let mut env = Environment::new();
        if env
            .add_template("system_prompt", &self.system_prompt)
            .is_err()
        {
            return fallback_system_prompt(business_name);
        }
        let Ok(template) = env.get_template("system_prompt") else {
            return fallback_system_prompt(business_name);
        };
        template
            .render(context! { business_name => business_name.trim() })
            .map(|prompt| prompt.trim().to_string())
            .unwrap_or_else(|_| fallback_system_prompt(business_name))
    }

    /// `[system, few-shot..., user]`. The system message is dropped when the
    /// template renders empty.
    pub fn build_messages(&self, business_name: &str, user_text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.conversation_examples.len() + 2);
        let system = self.render_system_prompt(business_name);
        if !system.is_empty() {
            messages.push(ChatMessage::new("system", system));
        }
        messages.extend(self.conversation_examples.iter().cloned());
        messages.push(ChatMessage::new("user", user_text));
        messages
    }
}

fn fallback_system_prompt(business_name: &str) -> String {
    let business_name = business_name.trim();
    if business_name.is_empty() {
        "You are a polite and professional AI assistant for a small local business on WhatsApp."
            .to_string()
    } else {
        format!(
            "You are a polite and professional AI assistant for {business_name}, a small local business on WhatsApp."
        )
    }
}
