//! Catlet orchestrator - saga runtime for fleet-wide infrastructure changes.
//!
//! Drives long-running catlet, disk and network changes across autonomous
//! host agents that talk to the controller only through a message bus.

pub mod agent;
pub mod bus;
pub mod catlets;
pub mod config;
pub mod controller;
pub mod dlq;
pub mod error;
pub mod genes;
pub mod interfaces;
pub mod locks;
pub mod operations;
pub mod routing;
pub mod saga;
pub mod storage;
pub mod tasks;
pub mod utils;
