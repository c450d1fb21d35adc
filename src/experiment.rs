//! Contact-form experiment: visitor bucketing and conversion counters.
//!
//! All counters live in one [`ExperimentState`] owned by an
//! [`ExperimentCounterService`]. The service holds the state behind a single
//! lock, so every operation is one atomic read-modify-write even when the
//! runtime dispatches requests across worker threads.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Variant1,
    Variant2,
}

impl Variant {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "variant1" => Some(Variant::Variant1),
            "variant2" => Some(Variant::Variant2),
            _ => None,
        }
    }

    /// Odd visits see the short form, even visits the one with an email field.
    pub fn for_visit(visit_number: u64) -> Self {
        if visit_number % 2 == 1 {
            Variant::Variant1
        } else {
            Variant::Variant2
        }
    }

    pub fn fields(self) -> &'static [FormField] {
        match self {
            Variant::Variant1 => &[FormField::Name, FormField::Message],
            Variant::Variant2 => &[FormField::Name, FormField::Email, FormField::Message],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Variant1 => "variant1",
            Variant::Variant2 => "variant2",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormField {
    Name,
    Email,
    Message,
}

impl FormField {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "name" => Some(FormField::Name),
            "email" => Some(FormField::Email),
            "message" => Some(FormField::Message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantCounters {
    pub visitors: u64,
    pub submissions: u64,
    pub field_fills: BTreeMap<FormField, u64>,
}

impl VariantCounters {
    fn new(variant: Variant) -> Self {
        Self {
            visitors: 0,
            submissions: 0,
            field_fills: variant.fields().iter().map(|f| (*f, 0)).collect(),
        }
    }

    /// Two decimals plus `%`; a variant nobody has seen reports `0.00%`.
    pub fn conversion_rate(&self) -> String {
        if self.visitors == 0 {
            return "0.00%".to_string();
        }
        let rate = self.submissions as f64 / self.visitors as f64 * 100.0;
        format!("{rate:.2}%")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentState {
    pub total_visitors: u64,
    pub variant1: VariantCounters,
    pub variant2: VariantCounters,
}

impl Default for ExperimentState {
    fn default() -> Self {
        Self {
            total_visitors: 0,
            variant1: VariantCounters::new(Variant::Variant1),
            variant2: VariantCounters::new(Variant::Variant2),
        }
    }
}

impl ExperimentState {
    fn counters_mut(&mut self, variant: Variant) -> &mut VariantCounters {
        match variant {
            Variant::Variant1 => &mut self.variant1,
            Variant::Variant2 => &mut self.variant2,
        }
    }

    pub fn assign_visitor(&mut self) -> Assignment {
        self.total_visitors += 1;
        let visit_number = self.total_visitors;
        let variant = Variant::for_visit(visit_number);
        self.counters_mut(variant).visitors += 1;

        Assignment {
            variant,
            visit_number,
            total_visitors: self.total_visitors,
        }
    }

    /// Returns whether anything was counted. Unknown variants and fields
    /// outside the variant's form are accepted and ignored.
    pub fn record_field_fill(&mut self, variant: &str, field_name: &str) -> Result<bool> {
        if variant.is_empty() || field_name.is_empty() {
            return Err(ApiError::Validation(
                "Missing variant or fieldName".to_string(),
            ));
        }

        let (Some(variant), Some(field)) = (Variant::parse(variant), FormField::parse(field_name))
        else {
            return Ok(false);
        };

        match self.counters_mut(variant).field_fills.get_mut(&field) {
            Some(count) => {
                *count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Returns the variant's new submission count.
    pub fn record_submission(&mut self, variant: &str) -> Result<(Variant, u64)> {
        if variant.is_empty() {
            return Err(ApiError::Validation("Missing variant".to_string()));
        }
        let parsed = Variant::parse(variant)
            .ok_or_else(|| ApiError::Validation(format!("Unknown variant: {variant}")))?;

        let counters = self.counters_mut(parsed);
        counters.submissions += 1;
        Ok((parsed, counters.submissions))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_visitors: self.total_visitors,
            variant1: VariantStats::from(&self.variant1),
            variant2: VariantStats::from(&self.variant2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub variant: Variant,
    pub visit_number: u64,
    pub total_visitors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStats {
    pub visitors: u64,
    pub submissions: u64,
    pub field_fills: BTreeMap<FormField, u64>,
    pub conversion_rate: String,
}

impl From<&VariantCounters> for VariantStats {
    fn from(counters: &VariantCounters) -> Self {
        Self {
            visitors: counters.visitors,
            submissions: counters.submissions,
            field_fills: counters.field_fills.clone(),
            conversion_rate: counters.conversion_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_visitors: u64,
    pub variant1: VariantStats,
    pub variant2: VariantStats,
}

/// Process-wide experiment counters, shared between request handlers.
#[derive(Debug, Default)]
pub struct ExperimentCounterService {
    state: Mutex<ExperimentState>,
}

impl ExperimentCounterService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_visitor(&self) -> Assignment {
        let (assignment, v1, v2) = {
            let mut state = self.state.lock();
            let assignment = state.assign_visitor();
            (assignment, state.variant1.visitors, state.variant2.visitors)
        };

        info!(
            visit = assignment.visit_number,
            variant = %assignment.variant,
            v1,
            v2,
            "visitor assigned"
        );

        assignment
    }

    pub fn record_field_fill(&self, variant: &str, field_name: &str) -> Result<bool> {
        let counted = self.state.lock().record_field_fill(variant, field_name)?;

        if counted {
            info!(variant, field = field_name, "field filled");
        } else {
            debug!(variant, field = field_name, "ignoring fill for unknown field");
        }

        Ok(counted)
    }

    pub fn record_submission(&self, variant: &str) -> Result<u64> {
        let result = self.state.lock().record_submission(variant);
        let (variant, total) = result.inspect_err(|e| warn!("Rejected submission: {}", e))?;

        info!(variant = %variant, total, "form submitted");
        Ok(total)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.lock().snapshot()
    }

    pub fn reset(&self) {
        *self.state.lock() = ExperimentState::default();
        info!("statistics reset");
    }
}
