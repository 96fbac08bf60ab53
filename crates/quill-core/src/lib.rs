// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent execution engine: per-turn orchestration of the model ⇄ tool
//! loop, context compaction, cancellation, and the single-in-flight-turn
//! session coordinator.

mod agent;
mod compact;
mod coordinator;
mod events;
mod session;

pub use agent::{Agent, TurnLimitDecision, TurnLimitHandler};
pub use compact::{compact_session, truncate_fallback, CompactionOutcome};
pub use coordinator::{Coordinator, CoordinatorState, SubmitOutcome};
pub use events::AgentEvent;
pub use session::Session;

pub use quill_model::CancelToken;
