//! Bridges the chat orchestrator to two external-facing concerns: the credit
//! service (metering) and the `query_logs`/`users` tables (persistence).
//! Neither the credit service nor the database's operational migration story
//! is this crate's problem to fully own — it owns the client/DAO code, using
//! `attestgate_core::error::TelemetryError` for both.

pub mod meter;
pub mod querylog;
pub mod users;

pub use meter::{CreditMeter, HttpCreditMeter, MeteringContext, NoopMeter, ResponseUsage};
pub use querylog::{QueryLogStore, SqlxQueryLogStore, UsageTotals};
pub use users::SqlxUserRepository;
