//! Custom field converters
//!
//! Rewrites individual field values and schemas using user-supplied
//! converters. Converters are declared in configuration as an ordered
//! list of prefixes; each prefix names a converter type resolved through
//! a [`ConverterFactory`] (a registry of constructors, no runtime
//! reflection) and configured with its `<prefix>.<option>` sub-options.
//!
//! Lookup is first-match-wins in registration order: the first converter
//! whose matcher accepts a field supplies its conversion; unmatched
//! fields keep the default conversion behavior, which is external to
//! this crate.

use crate::config::ConverterSpec;
use crate::error::{PipelineError, Result};
use crate::event::{ChangeEvent, FieldDescriptor};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Glob-style field-name matcher (`*` and `?` wildcards).
#[derive(Debug, Clone)]
pub struct FieldMatcher {
    pattern: Regex,
}

impl FieldMatcher {
    /// Compile a glob pattern; invalid patterns are configuration errors.
    pub fn new(glob: &str) -> Result<Self> {
        let escaped = regex::escape(glob);
        let pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
        let pattern = Regex::new(&format!("^{}$", pattern)).map_err(|e| {
            PipelineError::configuration(format!("Invalid field pattern '{}': {}", glob, e))
        })?;
        Ok(Self { pattern })
    }

    pub fn matches(&self, field_name: &str) -> bool {
        self.pattern.is_match(field_name)
    }
}

/// The rewriting a converter applies to a matched field: a replacement
/// schema plus a value transformation.
pub struct FieldConversion {
    schema: FieldDescriptor,
    #[allow(clippy::type_complexity)]
    convert: Box<dyn Fn(&Value) -> std::result::Result<Value, String> + Send + Sync>,
}

impl FieldConversion {
    pub fn new<F>(schema: FieldDescriptor, convert: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            schema,
            convert: Box::new(convert),
        }
    }

    /// The rewritten field schema.
    pub fn schema(&self) -> &FieldDescriptor {
        &self.schema
    }

    /// Rewrite one value. Errors are converter diagnostics; the registry
    /// maps them onto the field and event position.
    pub fn apply(&self, value: &Value) -> std::result::Result<Value, String> {
        (self.convert)(value)
    }
}

/// A configured custom converter: inspects field descriptors and offers
/// a conversion for the ones it handles.
pub trait CustomConverter: Send + Sync {
    fn converter_for(&self, field: &FieldDescriptor) -> Option<Arc<FieldConversion>>;
}

/// A converter handling the fields matched by one glob pattern; the
/// common building block for configured converters.
pub struct MatchingConverter {
    matcher: FieldMatcher,
    conversion: Arc<FieldConversion>,
}

impl MatchingConverter {
    pub fn new(matcher: FieldMatcher, conversion: FieldConversion) -> Self {
        Self {
            matcher,
            conversion: Arc::new(conversion),
        }
    }
}

impl CustomConverter for MatchingConverter {
    fn converter_for(&self, field: &FieldDescriptor) -> Option<Arc<FieldConversion>> {
        if self.matcher.matches(&field.name) {
            Some(Arc::clone(&self.conversion))
        } else {
            None
        }
    }
}

/// Constructor for a converter type: builds an instance from the
/// prefix-scoped sub-options. Missing or invalid sub-options are
/// configuration errors.
pub type ConverterConstructor =
    Arc<dyn Fn(&BTreeMap<String, String>) -> Result<Box<dyn CustomConverter>> + Send + Sync>;

/// Registry of converter constructors keyed by declared type identifier.
///
/// Replaces class-name reflection: the host registers every available
/// converter type at startup, and configuration resolves against it.
#[derive(Default, Clone)]
pub struct ConverterFactory {
    constructors: HashMap<String, ConverterConstructor>,
}

impl ConverterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a type identifier.
    pub fn register<F>(mut self, type_id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&BTreeMap<String, String>) -> Result<Box<dyn CustomConverter>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(type_id.into(), Arc::new(constructor));
        self
    }

    /// Instantiate a declared converter; an unresolvable type identifier
    /// is a fatal configuration error.
    pub fn instantiate(
        &self,
        spec: &ConverterSpec,
    ) -> Result<Box<dyn CustomConverter>> {
        let constructor = self.constructors.get(&spec.type_id).ok_or_else(|| {
            PipelineError::configuration(format!(
                "{}.type = '{}': Unresolvable converter type",
                spec.prefix, spec.type_id
            ))
        })?;
        constructor(&spec.options)
    }
}

/// Ordered list of configured converters with first-match-wins lookup.
///
/// Immutable after startup and safely shared across threads.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: Vec<(String, Box<dyn CustomConverter>)>,
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterRegistry").finish_non_exhaustive()
    }
}

impl ConverterRegistry {
    /// An empty registry; every field keeps default conversion.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the registry from the declared converter specs, in
    /// registration order. Any misconfigured declaration aborts startup.
    pub fn from_config(specs: &[ConverterSpec], factory: &ConverterFactory) -> Result<Self> {
        let mut converters = Vec::with_capacity(specs.len());
        for spec in specs {
            let converter = factory.instantiate(spec)?;
            debug!(prefix = %spec.prefix, type_id = %spec.type_id, "registered converter");
            converters.push((spec.prefix.clone(), converter));
        }
        Ok(Self { converters })
    }

    /// The first registered converter accepting the field, if any. Ties
    /// are broken by registration order, not match quality.
    pub fn converter_for(&self, field: &FieldDescriptor) -> Option<Arc<FieldConversion>> {
        self.converters
            .iter()
            .find_map(|(_, c)| c.converter_for(field))
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Rewrite the matched fields of an event's value and value schema.
    ///
    /// Unmatched fields are untouched; tombstone markers (null value)
    /// pass through unchanged. A converter failure is a per-event
    /// [`PipelineError::Conversion`] carrying the field name and the
    /// event's position, governed upstream by the failure policy.
    pub fn apply(&self, event: &ChangeEvent) -> Result<ChangeEvent> {
        if self.is_empty() || event.is_tombstone() {
            return Ok(event.clone());
        }
        let Some(schema) = &event.value_schema else {
            // No structural descriptor means nothing to match against.
            return Ok(event.clone());
        };

        let mut rewritten = event.clone();
        for (index, field) in schema.fields.iter().enumerate() {
            let Some(conversion) = self.converter_for(field) else {
                continue;
            };
            if let Some(Value::Object(obj)) = rewritten.value.as_mut() {
                if let Some(current) = obj.get(&field.name) {
                    let converted = conversion.apply(current).map_err(|reason| {
                        PipelineError::conversion(
                            field.name.clone(),
                            event.source_position,
                            reason,
                        )
                    })?;
                    obj.insert(field.name.clone(), converted);
                }
            }
            if let Some(schema) = rewritten.value_schema.as_mut() {
                let mut replacement = conversion.schema().clone();
                replacement.name = field.name.clone();
                schema.fields[index] = replacement;
            }
        }
        Ok(rewritten)
    }
}
