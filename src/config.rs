use std::{collections::HashMap, env, path::PathBuf, str::FromStr, time::Duration};

use crate::error::ConfigError;

pub const DEFAULT_WHATSAPP_API_URL: &str = "https://graph.facebook.com/v19.0";
pub const DEFAULT_LLM_API_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODELS: &[&str] = &["llama3-70b-8192", "llama-3.1-8b-instant"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub models: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Retries of the same model after a 429, before falling back.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Retry hints longer than this abandon the model instead of sleeping.
    pub max_retry_wait: Duration,
    pub timeout: Duration,
    pub prompts_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub api_url: String,
    pub verify_token: String,
    pub app_secret: String,
    pub timeout: Duration,
    pub diagnostics_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub default_channel: String,
    pub contact_hash_key: Option<String>,
    pub whatsapp: WhatsAppConfig,
    pub llm: LlmConfig,
}

impl Config {
    /// Reads settings from the process environment. `main` loads `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let store_backend = match get("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    message: format!("expected 'postgres' or 'memory', got '{other}'"),
                })
            }
        };

        let models = get("LLM_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|model| !model.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| DEFAULT_MODELS.iter().map(|m| m.to_string()).collect());
        if models.is_empty() {
            return Err(ConfigError::Invalid {
                key: "LLM_MODELS",
                message: "at least one model is required".to_string(),
            });
        }

        let llm = LlmConfig {
            api_url: get("LLM_API_URL")
                .unwrap_or_else(|| DEFAULT_LLM_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: get("LLM_API_KEY")
                .or_else(|| get("GROQ_API_KEY"))
                .unwrap_or_default(),
            models,
            max_tokens: parse_or(&get, "LLM_MAX_TOKENS", 512)?,
            temperature: parse_or(&get, "LLM_TEMPERATURE", 0.3)?,
            max_retries: parse_or(&get, "LLM_MAX_RETRIES", 3)?,
            retry_backoff: Duration::from_millis(parse_or(&get, "LLM_RETRY_BACKOFF_MS", 2_000)?),
            max_retry_wait: Duration::from_millis(parse_or(
                &get,
                "LLM_MAX_RETRY_WAIT_MS",
                20_000,
            )?),
            timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 30)?),
            prompts_path: get("PROMPTS_PATH").map(PathBuf::from),
        };

        let whatsapp = WhatsAppConfig {
            api_url: get("WHATSAPP_API_URL")
                .unwrap_or_else(|| DEFAULT_WHATSAPP_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            verify_token: get("VERIFY_TOKEN").unwrap_or_default(),
            app_secret: get("WHATSAPP_APP_SECRET").unwrap_or_default(),
            timeout: Duration::from_secs(parse_or(&get, "WHATSAPP_TIMEOUT_SECS", 30)?),
            diagnostics_timeout: Duration::from_secs(parse_or(
                &get,
                "DIAGNOSTICS_TIMEOUT_SECS",
                15,
            )?),
        };

        Ok(Self {
            port: parse_or(&get, "PORT", 4000)?,
            store_backend,
            database_url: resolve_database_url(&get),
            default_channel: get("DEFAULT_CHANNEL")
                .unwrap_or_else(|| crate::types::DEFAULT_CHANNEL.to_string()),
            contact_hash_key: get("CONTACT_HASH_KEY"),
            whatsapp,
            llm,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            key,
            message: format!("'{raw}': {err}"),
        }),
    }
}

fn resolve_database_url<G>(get: &G) -> String
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(url) = get("DATABASE_URL") {
        return url;
    }
    let host = get("POSTGRES_HOST")
        .or_else(|| get("PGHOST"))
        .unwrap_or_else(|| "localhost".to_string());
    let port = get("POSTGRES_PORT")
        .or_else(|| get("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = get("POSTGRES_USER")
        .or_else(|| get("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = get("POSTGRES_PASSWORD")
        .or_else(|| get("PGPASSWORD"))
        .unwrap_or_default();
    let db = get("POSTGRES_DB")
        .or_else(|| get("PGDATABASE"))
        .unwrap_or_else(|| "wa_relay".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_map(&map)
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.store_backend, StoreBackend::Postgres);
        assert_eq!(cfg.llm.models, vec!["llama3-70b-8192", "llama-3.1-8b-instant"]);
        assert_eq!(cfg.llm.max_retries, 3);
        assert_eq!(cfg.llm.timeout, Duration::from_secs(30));
        assert_eq!(cfg.whatsapp.api_url, DEFAULT_WHATSAPP_API_URL);
        assert_eq!(cfg.whatsapp.diagnostics_timeout, Duration::from_secs(15));
        assert_eq!(cfg.default_channel, "whatsapp");
        assert_eq!(
            cfg.database_url,
            "postgres://postgres:@localhost:5432/wa_relay"
        );
    }

    #[test]
    fn model_list_is_parsed_in_declared_order() {
        let cfg = config(&[("LLM_MODELS", " primary , , secondary,tertiary ")]).unwrap();
        assert_eq!(cfg.llm.models, vec!["primary", "secondary", "tertiary"]);
    }

    #[test]
    fn groq_key_is_used_as_fallback() {
        let cfg = config(&[("GROQ_API_KEY", "gsk_test")]).unwrap();
        assert_eq!(cfg.llm.api_key, "gsk_test");
        let cfg = config(&[("GROQ_API_KEY", "gsk_test"), ("LLM_API_KEY", "primary")]).unwrap();
        assert_eq!(cfg.llm.api_key, "primary");
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = config(&[("LLM_MAX_RETRIES", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LLM_MAX_RETRIES", .. }));
    }

    #[test]
    fn empty_model_list_is_rejected() {
        assert!(config(&[("LLM_MODELS", " , ")]).is_err());
    }

    #[test]
    fn urls_drop_trailing_slashes() {
        let cfg = config(&[
            ("LLM_API_URL", "http://localhost:9000/v1/"),
            ("WHATSAPP_API_URL", "http://localhost:9001/"),
            ("STORE_BACKEND", "memory"),
        ])
        .unwrap();
        assert_eq!(cfg.llm.api_url, "http://localhost:9000/v1");
        assert_eq!(cfg.whatsapp.api_url, "http://localhost:9001");
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
    }
}
