//! Operation filter
//!
//! Drops events whose operation belongs to a static excluded set, parsed
//! from the `skipped.operations` configuration. Skipped events are
//! dropped but their positions are not: the pipeline records every
//! observed position so offset tracking never stalls.

use crate::error::{PipelineError, Result};
use crate::event::{ChangeEvent, Operation};
use std::collections::HashSet;

/// Decides, per event, whether it is skipped based on a static set of
/// excluded operation kinds.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    skipped: HashSet<Operation>,
}

impl OperationFilter {
    /// Build from an explicit skip set.
    pub fn new(skipped: HashSet<Operation>) -> Self {
        Self { skipped }
    }

    /// Parse a comma-separated list of operation codes restricted to the
    /// closed set {r, c, u, d}. Any other entry is a fatal configuration
    /// error. An empty list skips nothing.
    pub fn from_codes(codes: &str) -> Result<Self> {
        let mut skipped = HashSet::new();
        for code in codes.split(',') {
            let code = code.trim();
            if code.is_empty() {
                continue;
            }
            match Operation::for_code(code) {
                Some(op) => {
                    skipped.insert(op);
                }
                None => {
                    return Err(PipelineError::configuration(format!(
                        "skipped.operations = '{}': Invalid operation",
                        code
                    )));
                }
            }
        }
        Ok(Self { skipped })
    }

    /// Whether the event's operation is excluded.
    pub fn should_skip(&self, event: &ChangeEvent) -> bool {
        self.skipped.contains(&event.operation)
    }

    /// Whether the filter passes everything through.
    pub fn is_empty(&self) -> bool {
        self.skipped.is_empty()
    }
}
