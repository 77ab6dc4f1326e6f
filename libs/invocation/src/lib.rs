//! # cloudtun-invocation
//!
//! Canonical tunnel invocation records for cloudtun.
//!
//! ## Design Principles
//!
//! - An invocation is the immutable description of one tunnel request:
//!   what to connect, and on which ports
//! - Its rendered record string IS its identity: two invocations denote
//!   the same session if and only if their records are equal
//! - Records round-trip (parse → format → parse) and are strict to parse
//! - The record doubles as the persisted history entry, so it stays
//!   human-readable and argument-shaped
//!
//! ## Record Format
//!
//! ```text
//! --project=acme-prod --cluster=main --namespace=web --pod=api --local-port=3000 --remote-port=8080 --proxy-type=pod
//! --project=acme-prod --sql-instance=acme-prod:europe-west1:db --local-port=3306 --proxy-type=sql
//! ```

mod error;
mod types;

pub use error::InvocationError;
pub use types::*;
