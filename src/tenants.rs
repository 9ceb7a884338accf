use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::contacts::{normalize_phone, PhoneHasher};
use crate::error::OnboardingError;
use crate::store::SharedStore;
use crate::types::{OnboardingRequest, Tenant, TenantStatus};

pub fn is_valid_e164(phone: &str) -> bool {
    Regex::new(r"^\+\d{10,15}$")
        .map(|re| re.is_match(phone.trim()))
        .unwrap_or(false)
}

pub fn slugify(value: &str) -> String {
    let mut slug = value
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    slug.trim_matches('-').to_string()
}

fn tenant_slug(business_name: &str, phone_number_id: &str) -> String {
    let slug = slugify(business_name);
    if !slug.is_empty() {
        return slug;
    }
    match normalize_phone(phone_number_id) {
        Some(digits) => format!("tenant-{digits}"),
        None => "tenant".to_string(),
    }
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, OnboardingError> {
    let value = value.trim();
    if value.is_empty() {
        Err(OnboardingError::MissingField(field))
    } else {
        Ok(value)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Maps provider channel ids to tenants and owns tenant onboarding.
#[derive(Clone)]
pub struct TenantDirectory {
    store: SharedStore,
    hasher: PhoneHasher,
}

impl TenantDirectory {
    pub fn new(store: SharedStore, hasher: PhoneHasher) -> Self {
        Self { store, hasher }
    }

    /// Exact match on `phone_number_id`. Unknown channels and store failures
    /// both come back as `None`.
    pub async fn resolve(&self, phone_number_id: &str) -> Option<Tenant> {
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return None;
        }
        match self.store.find_tenant_by_channel(phone_number_id).await {
            Ok(tenant) => tenant,
            Err(err) => {
                error!(phone_number_id, error = %err, "tenant lookup failed");
                None
            }
        }
    }

    /// Creates the tenant for a channel, or rotates the credentials of the
    /// tenant already matching its channel id, business account or number.
    pub async fn onboard(&self, request: OnboardingRequest) -> Result<Tenant, OnboardingError> {
        let phone = request.whatsapp_number.trim();
        if !is_valid_e164(phone) {
            return Err(OnboardingError::InvalidPhone(phone.to_string()));
        }
        let phone_number_id = required(&request.phone_number_id, "phone_number_id")?;
        let access_token = required(&request.access_token, "access_token")?;
        let waba_id = non_empty(request.waba_id.as_deref());
        let phone_hash = self.hasher.hash(phone);

        let password_hash = match non_empty(request.password.as_deref()) {
            Some(password) => Some(bcrypt::hash(password, bcrypt::DEFAULT_COST)?),
            None => None,
        };

        let existing = self
            .store
            .find_tenant_for_onboarding(phone_number_id, waba_id.as_deref(), phone_hash.as_deref())
            .await?;

        let now = Utc::now();
        let business_name = non_empty(request.business_name.as_deref());

        if let Some(mut tenant) = existing {
            if let Some(name) = business_name {
                tenant.slug = tenant_slug(&name, phone_number_id);
                tenant.name = name;
            }
            tenant.status = TenantStatus::Active;
            tenant.phone_number_id = phone_number_id.to_string();
            tenant.waba_id = waba_id.or(tenant.waba_id);
            tenant.phone_e164_enc = Some(phone.to_string());
            tenant.phone_hash = phone_hash;
            tenant.access_token_enc = Some(access_token.to_string());
            if let Some(verify_token) = non_empty(request.verify_token.as_deref()) {
                tenant.verify_token_enc = Some(verify_token);
            }
            if password_hash.is_some() {
                tenant.password_hash = password_hash;
            }
            if let Some(settings) = request.settings {
                tenant.settings = merge_settings(tenant.settings, settings);
            }
            tenant.updated_at = now;
            self.store.update_tenant(&tenant).await?;
            info!(tenant_id = %tenant.id, phone_number_id, "tenant credentials updated");
            return Ok(tenant);
        }

        let name = business_name.unwrap_or_else(|| phone.to_string());
        let tenant = Tenant {
            id: Uuid::new_v4().to_string(),
            slug: tenant_slug(&name, phone_number_id),
            name,
            status: TenantStatus::Active,
            phone_number_id: phone_number_id.to_string(),
            waba_id,
            phone_e164_enc: Some(phone.to_string()),
            phone_hash,
            access_token_enc: Some(access_token.to_string()),
            verify_token_enc: non_empty(request.verify_token.as_deref()),
            password_hash,
            settings: request.settings.unwrap_or_else(|| json!({})),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_tenant(&tenant).await?;
        info!(tenant_id = %tenant.id, phone_number_id, "tenant onboarded");
        Ok(tenant)
    }
}

/// Shallow merge of object settings; anything else replaces.
fn merge_settings(current: Value, incoming: Value) -> Value {
    match (current, incoming) {
        (Value::Object(mut current), Value::Object(incoming)) => {
            current.extend(incoming);
            Value::Object(current)
        }
        (_, incoming) => incoming,
    }
}
