//! Compliance Advisor: WhatsApp front end over a four-stage compliance pipeline.

pub mod channels;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod format;
pub mod metrics;
pub mod rate_limit;
pub mod session;
pub mod state;
pub mod store;
pub mod webhook;
pub mod workflow;
