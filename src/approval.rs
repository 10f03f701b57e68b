//! Auto-approval gate.
//!
//! Counts the requests a task makes without explicit confirmation and the money they cost.
//! When a ceiling is crossed the task must stop and ask before continuing.
//!
//! # Invariants
//! - `requests` counts requests since the last reset (creation or an approved breach).
//! - `cost_baseline <= total cost` passed to [`AutoApprovalGate::check`].

use serde::{Deserialize, Serialize};

use crate::config::ApprovalLimits;
use crate::messages::AskKind;

/// Outcome of consulting the gate before a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateDecision {
    Proceed,
    RequestLimitReached { limit: u32 },
    CostLimitReached { limit: f64, spent: f64 },
}

impl GateDecision {
    /// The blocking ask that reports this breach, if it is one.
    pub fn ask_kind(&self) -> Option<AskKind> {
        match self {
            GateDecision::Proceed => None,
            GateDecision::RequestLimitReached { .. } => Some(AskKind::AutoApprovalMaxReqReached),
            GateDecision::CostLimitReached { .. } => Some(AskKind::AutoApprovalMaxCostReached),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            GateDecision::Proceed => String::new(),
            GateDecision::RequestLimitReached { limit } => format!(
                "Auto-approved request limit of {} reached. Continue with another {} requests?",
                limit, limit
            ),
            GateDecision::CostLimitReached { limit, spent } => format!(
                "Auto-approved cost limit of ${:.2} reached (${:.2} spent). Continue?",
                limit, spent
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoApprovalGate {
    limits: ApprovalLimits,
    requests: u32,
    cost_baseline: f64,
}

impl AutoApprovalGate {
    pub fn new(limits: ApprovalLimits) -> Self {
        Self {
            limits,
            requests: 0,
            cost_baseline: 0.0,
        }
    }

    /// Count one more request and check both ceilings.
    ///
    /// `total_cost` is the task's cumulative cost so far, in USD.
    pub fn check(&mut self, total_cost: f64) -> GateDecision {
        self.requests = self.requests.saturating_add(1);

        if let Some(limit) = self.limits.max_requests {
            if self.requests > limit {
                return GateDecision::RequestLimitReached { limit };
            }
        }

        if let Some(limit) = self.limits.max_cost {
            let spent = (total_cost - self.cost_baseline).max(0.0);
            if spent > limit {
                return GateDecision::CostLimitReached { limit, spent };
            }
        }

        GateDecision::Proceed
    }

    /// Start a fresh allowance after the caller approved continuing.
    ///
    /// # Postcondition
    /// The next `check` counts as the first request of a new window.
    pub fn reset(&mut self, total_cost: f64) {
        self.requests = 0;
        self.cost_baseline = total_cost;
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }
}
