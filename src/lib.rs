//! Multi-tenant WhatsApp relay: webhook intake, conversation history, and
//! model-generated replies sent back through the Graph API.

pub mod app;
pub mod config;
pub mod contacts;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod prompting;
pub mod replies;
pub mod store;
pub mod tenants;
pub mod types;
pub mod webhook;
pub mod whatsapp;

pub use app::{router, run, AppState};
pub use config::Config;
pub use webhook::{DeliveryReport, EventOutcome, EventReport, Pipeline};
