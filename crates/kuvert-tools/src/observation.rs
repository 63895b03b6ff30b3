// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_false(b: &bool) -> bool {
    !*b
}

/// The normalised result of one tool call, fed back to the model as context
/// on the next cycle.  Failures are carried in `error`, never thrown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub success: bool,
    pub tool: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Measured on a monotonic clock.
    pub duration_ms: f64,
    /// Set when a dangerous tool was invoked without `arguments.approved`.
    #[serde(default, skip_serializing_if = "is_false")]
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Observation {
    pub fn success(tool: impl Into<String>, result: Value, duration_ms: f64) -> Self {
        Self {
            success: true,
            tool: tool.into(),
            result: Some(result),
            error: None,
            duration_ms,
            approval_required: false,
            reason: None,
        }
    }

    pub fn failure(tool: impl Into<String>, error: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            success: false,
            tool: tool.into(),
            result: None,
            error: Some(error.into()),
            duration_ms,
            approval_required: false,
            reason: None,
        }
    }

    /// Flow-control observation: the call was withheld pending approval.
    pub fn approval_required(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            tool: tool.into(),
            result: None,
            error: None,
            duration_ms: 0.0,
            approval_required: true,
            reason: Some(reason.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("observation serialization is infallible")
    }
}

/// Aggregate of one `tools` batch, keyed by `tool_id`.  Member completion
/// order is not observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchObservation {
    #[serde(rename = "_multi_tool")]
    pub multi_tool: bool,
    pub count: usize,
    pub all_success: bool,
    pub results: BTreeMap<String, Observation>,
}

impl BatchObservation {
    pub fn from_results(results: BTreeMap<String, Observation>) -> Self {
        Self {
            multi_tool: true,
            count: results.len(),
            all_success: results.values().all(|o| o.success),
            results,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("observation serialization is infallible")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
