//! # OpenCode Tasks
//!
//! Task delegation and lateral broadcast for agents running on an OpenCode
//! server.
//!
//! An agent session can:
//! - spawn child task sessions running another agent, synchronously or in the
//!   background
//! - collect a finished task's latest turn as a message in its own history
//! - follow up with or cancel a running task
//! - share short notices with sibling and child tasks
//!
//! ## Architecture
//!
//! ```text
//!   task-mcp (stdio JSON-RPC)
//!            │
//!            ▼
//!       TaskTools ──────────────┐
//!   ┌────────┼─────────┐        │
//!   ▼        ▼         ▼        ▼
//! TaskLauncher  CancellationController  BroadcastBus
//!   │  CompletionOracle  ResultHarvester   │
//!   └────────────┬─────────────────────────┘
//!                ▼
//!        dyn SessionService  ◄── OpenCodeClient (HTTP + SSE)
//! ```
//!
//! ## Modules
//! - `opencode`: host session API and its HTTP client
//! - `task`: launching, completion detection, harvesting, cancellation
//! - `broadcast`: envelope codec and delivery to related sessions
//! - `notifier`: completion notices for background tasks
//! - `tools`: tool-facing facade
//! - `cache`: bounded TTL set for de-duplicated delivery
//! - `config`: file and environment configuration

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod notifier;
pub mod opencode;
pub mod task;
pub mod tools;

#[cfg(test)]
mod testing;

pub use cache::DeliveryCache;
pub use config::Config;
pub use opencode::{OpenCodeClient, SessionService};
pub use tools::{TaskTools, ToolContext};
