//! Scripted predicate filtering
//!
//! A user-supplied boolean expression decides event retention. The
//! expression engine is an injected capability: the pipeline only knows
//! `compile(text) -> CompiledPredicate` and
//! `evaluate(bindings) -> bool | error`. Engines are looked up in an
//! [`EngineRegistry`] by the namespaced `language` identifier from the
//! filter configuration.
//!
//! Expressions must be side-effect-free. The contract is not enforced at
//! runtime; it is a correctness requirement for reproducible filtering.
//!
//! ## Bindings
//!
//! Each invocation binds four read-only named values: `key`, `value`,
//! `key_schema`, `value_schema`. For tombstone-shaped events evaluated
//! under [`NullHandlingMode::Evaluate`], `value` and `value_schema` are
//! null and the expression must tolerate that, or the evaluation failure
//! policy applies.

use crate::config::{FilterConfig, NullHandlingMode};
use crate::error::{PipelineError, Result};
use crate::event::{ChangeEvent, SchemaDescriptor};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Read-only named values bound for one predicate invocation.
#[derive(Debug, Clone, Copy)]
pub struct PredicateBindings<'a> {
    pub key: Option<&'a Value>,
    pub value: Option<&'a Value>,
    pub key_schema: Option<&'a SchemaDescriptor>,
    pub value_schema: Option<&'a SchemaDescriptor>,
}

impl<'a> PredicateBindings<'a> {
    pub fn from_event(event: &'a ChangeEvent) -> Self {
        Self {
            key: event.key.as_ref(),
            value: event.value.as_ref(),
            key_schema: event.key_schema.as_ref(),
            value_schema: event.value_schema.as_ref(),
        }
    }
}

/// A compiled, reusable, side-effect-free predicate.
///
/// Errors are engine diagnostics (the expression threw, or produced a
/// non-boolean); the filter maps them onto the event's position.
pub trait CompiledPredicate: Send + Sync {
    fn evaluate(&self, bindings: &PredicateBindings<'_>) -> std::result::Result<bool, String>;
}

/// A pluggable expression-evaluation engine.
pub trait PredicateEngine: Send + Sync {
    /// The namespaced language identifier this engine answers to.
    fn language(&self) -> &str;

    /// Compile an expression once; the result is evaluated per event.
    fn compile(&self, expression: &str)
        -> std::result::Result<Box<dyn CompiledPredicate>, String>;
}

/// Registry of expression engines, keyed by language identifier.
///
/// Populated at startup; immutable afterwards.
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn PredicateEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine under its language identifier.
    pub fn register(mut self, engine: Arc<dyn PredicateEngine>) -> Self {
        self.engines.insert(engine.language().to_string(), engine);
        self
    }

    /// Look up the engine for a language; unknown languages are a fatal
    /// configuration error.
    pub fn bootstrap(&self, language: &str) -> Result<Arc<dyn PredicateEngine>> {
        self.engines.get(language).cloned().ok_or_else(|| {
            PipelineError::configuration(format!(
                "language = '{}': No expression engine registered",
                language
            ))
        })
    }
}

/// A predicate backed by a plain function, for embedders and tests.
pub struct FnPredicate<F>(pub F);

impl<F> CompiledPredicate for FnPredicate<F>
where
    F: Fn(&PredicateBindings<'_>) -> std::result::Result<bool, String> + Send + Sync,
{
    fn evaluate(&self, bindings: &PredicateBindings<'_>) -> std::result::Result<bool, String> {
        (self.0)(bindings)
    }
}

/// An engine backed by a compile closure, for embedders and tests.
pub struct ClosureEngine {
    language: String,
    #[allow(clippy::type_complexity)]
    compile_fn: Box<
        dyn Fn(&str) -> std::result::Result<Box<dyn CompiledPredicate>, String> + Send + Sync,
    >,
}

impl ClosureEngine {
    pub fn new<F>(language: impl Into<String>, compile_fn: F) -> Self
    where
        F: Fn(&str) -> std::result::Result<Box<dyn CompiledPredicate>, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            language: language.into(),
            compile_fn: Box::new(compile_fn),
        }
    }
}

impl PredicateEngine for ClosureEngine {
    fn language(&self) -> &str {
        &self.language
    }

    fn compile(
        &self,
        expression: &str,
    ) -> std::result::Result<Box<dyn CompiledPredicate>, String> {
        (self.compile_fn)(expression)
    }
}

/// Counters for filter activity.
#[derive(Debug, Default)]
pub struct FilterStats {
    evaluated: AtomicU64,
    retained: AtomicU64,
    dropped: AtomicU64,
    tombstones_bypassed: AtomicU64,
}

impl FilterStats {
    pub fn snapshot(&self) -> FilterStatsSnapshot {
        FilterStatsSnapshot {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            retained: self.retained.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            tombstones_bypassed: self.tombstones_bypassed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`FilterStats`].
#[derive(Debug, Clone)]
pub struct FilterStatsSnapshot {
    /// Expression invocations
    pub evaluated: u64,
    /// Events retained
    pub retained: u64,
    /// Events dropped by the expression or the null-handling mode
    pub dropped: u64,
    /// Tombstones passed or dropped without evaluation
    pub tombstones_bypassed: u64,
}

/// Applies a compiled predicate to events, with a null-event policy for
/// tombstone markers.
pub struct EventFilter {
    predicate: Box<dyn CompiledPredicate>,
    null_handling: NullHandlingMode,
    stats: FilterStats,
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter").finish_non_exhaustive()
    }
}

impl EventFilter {
    pub fn new(predicate: Box<dyn CompiledPredicate>, null_handling: NullHandlingMode) -> Self {
        Self {
            predicate,
            null_handling,
            stats: FilterStats::default(),
        }
    }

    /// Bootstrap the configured engine and compile the expression.
    /// Compilation failure is fatal at startup.
    pub fn from_config(config: &FilterConfig, engines: &EngineRegistry) -> Result<Self> {
        let engine = engines.bootstrap(&config.language)?;
        let predicate = engine.compile(&config.condition).map_err(|reason| {
            PipelineError::configuration(format!(
                "condition = '{}': Filter expression failed to compile: {}",
                config.condition, reason
            ))
        })?;
        Ok(Self::new(predicate, config.null_handling))
    }

    /// Decide whether the event is retained.
    ///
    /// Tombstone-shaped (null value) events follow the null-handling
    /// mode; everything else is evaluated. Evaluation failures carry the
    /// event's position and are governed by the failure policy upstream.
    pub fn retain(&self, event: &ChangeEvent) -> Result<bool> {
        if event.is_tombstone() {
            match self.null_handling {
                NullHandlingMode::Keep => {
                    self.stats.tombstones_bypassed.fetch_add(1, Ordering::Relaxed);
                    self.stats.retained.fetch_add(1, Ordering::Relaxed);
                    return Ok(true);
                }
                NullHandlingMode::Drop => {
                    self.stats.tombstones_bypassed.fetch_add(1, Ordering::Relaxed);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(false);
                }
                NullHandlingMode::Evaluate => {}
            }
        }

        self.stats.evaluated.fetch_add(1, Ordering::Relaxed);
        let bindings = PredicateBindings::from_event(event);
        match self.predicate.evaluate(&bindings) {
            Ok(true) => {
                self.stats.retained.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Ok(false) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(reason) => Err(PipelineError::evaluation(event.source_position, reason)),
        }
    }

    pub fn stats(&self) -> FilterStatsSnapshot {
        self.stats.snapshot()
    }
}
