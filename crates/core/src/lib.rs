//! # attestgate-core
//!
//! Domain types and error taxonomy shared across the gateway: chat messages
//! and requests, capability-token chain shapes, accounts and rate-limit
//! overrides, the service-registry view, the query-log record, the
//! aggregate `AppConfig`, and the `Provider` trait backends implement.
//!
//! This crate has no HTTP/KV/DB dependencies of its own — every other crate
//! in the workspace depends inward on it.

pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod provider;
pub mod query_log;
pub mod registry;
pub mod user;

pub use capability::{CapabilityToken, DocumentBinding, Principal, RateLimitAttenuation, TokenNode};
pub use config::AppConfig;
pub use error::GatewayError;
pub use message::{ChatMessage, ChatRequest, ContentPart, Role, Source};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use query_log::QueryLog;
pub use registry::{ModelEndpoint, ModelMetadata};
pub use user::{EffectiveRateLimits, RateLimitDefaults, RateLimits, User};
