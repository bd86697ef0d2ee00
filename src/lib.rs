//! Sentinel Gateway Library
//!
//! A policy-driven gateway for untrusted code: each submission is risk
//! assessed, routed to a container sandbox or a host subprocess according to
//! policy and runtime availability, executed under time and memory bounds,
//! and recorded in an append-only audit log and a rolling performance
//! history.

pub mod analysis;
pub mod audit;
pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod metrics_server;
pub mod notify;
pub mod performance;
pub mod policy;
pub mod router;
pub mod submission;

pub use error::{GatewayError, Result};
pub use gateway::Gateway;
