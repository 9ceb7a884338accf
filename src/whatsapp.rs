//! Graph API client for outbound sends and credential diagnostics.

use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use tracing::{error, info};

use crate::config::WhatsAppConfig;
use crate::error::DispatchError;

/// `abcdefgh...wxyz`; never the whole credential.
pub fn mask_token(token: &str) -> String {
    let chars = token.chars().collect::<Vec<_>>();
    match chars.len() {
        0 => "<no-token>".to_string(),
        n if n <= 10 => format!("{}...", chars.iter().take(4).collect::<String>()),
        n => format!(
            "{}...{}",
            chars[..8].iter().collect::<String>(),
            chars[n - 4..].iter().collect::<String>()
        ),
    }
}

/// Checks `x-hub-signature-256` against the raw request body. Always passes
/// when no app secret is configured.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let provided = signature_header.map(str::trim).unwrap_or_default();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided).trim();
    let Ok(expected) = hex::decode(provided) else {
        return false;
    };
    if expected.is_empty() {
        return false;
    }
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Send payload minus the message body, for logs.
fn loggable_payload(payload: &Value) -> Value {
    match payload {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(key, _)| key.as_str() != "text")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

#[derive(Clone)]
pub struct WhatsAppClient {
    client: reqwest::Client,
    config: WhatsAppConfig,
}

impl WhatsAppClient {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// One send attempt; retries are the caller's business.
    pub async fn send_text(
        &self,
        access_token: &str,
        phone_number_id: &str,
        to: &str,
        text: &str,
    ) -> Result<Value, DispatchError> {
        let access_token = access_token.trim();
        let phone_number_id = phone_number_id.trim();
        if access_token.is_empty() || phone_number_id.is_empty() {
            return Err(DispatchError::Config(
                "missing whatsapp access token or phone_number_id".to_string(),
            ));
        }

        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "body": text },
        });
        info!(
            phone_number_id,
            token = %mask_token(access_token),
            to,
            payload = %loggable_payload(&payload),
            "whatsapp send"
        );

        let response = self
            .client
            .post(format!("{}/{}/messages", self.config.api_url, phone_number_id))
            .bearer_auth(access_token)
            .timeout(self.config.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                error!(phone_number_id, to, error = %err, "whatsapp send request failed");
                DispatchError::from(err)
            })?;

        let result = read_response(response).await;
        match &result {
            Ok(_) => info!(phone_number_id, to, "whatsapp send accepted"),
            Err(err) => error!(phone_number_id, to, error = %err, "whatsapp send rejected"),
        }
        result
    }

    /// Graph `debug_token` lookup for a tenant credential.
    pub async fn debug_token(&self, token: &str) -> Result<Value, DispatchError> {
        info!(token = %mask_token(token), "debug_token lookup");
        let response = self
            .client
            .get(format!("{}/debug_token", self.config.api_url))
            .query(&[("input_token", token)])
            .bearer_auth(token)
            .timeout(self.config.diagnostics_timeout)
            .send()
            .await?;
        read_response(response).await
    }

    /// Phone number metadata as seen with the given credential.
    pub async fn debug_phone(
        &self,
        token: &str,
        phone_number_id: &str,
    ) -> Result<Value, DispatchError> {
        info!(phone_number_id, token = %mask_token(token), "phone number lookup");
        let response = self
            .client
            .get(format!("{}/{}", self.config.api_url, phone_number_id.trim()))
            .query(&[("fields", "id,phone_number,whatsapp_business_account")])
            .bearer_auth(token)
            .timeout(self.config.diagnostics_timeout)
            .send()
            .await?;
        read_response(response).await
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value, DispatchError> {
    let status = response.status();
    let raw_body = response.text().await.unwrap_or_default();
    let body =
        serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
    if status.is_success() {
        Ok(body)
    } else {
        Err(DispatchError::Api {
            status: status.as_u16(),
            body,
        })
    }
}
