//! Panel-driven node controller
//!
//! Architecture:
//! - `core/`: data model, collaborator traits, limiter, traffic counters, audit rules
//! - `business/`: node sync engine, controller, panel client, handler registry
//! - `config`: CLI and TOML configuration
//! - `logger`: tracing setup and log helpers

pub mod business;
pub mod config;
pub mod core;
pub mod error;
pub mod logger;
