//! Safety Module
//!
//! Guardrails around every mutation the control plane performs on a live
//! platform.

mod action_guard;

pub use action_guard::{ActionGuard, GuardLimits};
