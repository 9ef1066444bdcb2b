//! A single OpenAI-compatible client implementing `attestgate_core::Provider`.
//!
//! Unlike a typical multi-vendor router, this crate has exactly one shape of
//! backend to speak to: whichever inference server the service registry
//! (`attestgate-registry`) currently has leased for the requested model. No
//! upstream credentials are sent — inference backends behind the gateway are
//! trusted network peers, not third-party APIs.

pub mod openai_compat;
pub mod query_planner;

pub use openai_compat::OpenAiCompatProvider;
pub use query_planner::RegistryQueryPlanner;
