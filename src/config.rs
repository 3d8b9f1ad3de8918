//! Pipeline configuration
//!
//! One immutable [`PipelineConfig`] value is constructed at process start
//! (from typed builder calls or a flat property map) and passed by
//! reference to every component that needs it. Validation is a pure
//! function returning a list of problem descriptors; the caller decides
//! how to aggregate them. All configuration problems are fatal at startup
//! and are never governed by the failure handling mode.

use crate::error::{PipelineError, Result};
use crate::event::Operation;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

/// Default capacity of the change event queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 8192;
/// Default upper bound per drained batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 2048;
/// Default maximum wait when the queue is empty.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

const CONVERTER_TYPE_SUFFIX: &str = ".type";
const AVRO_CONVERTER: &str = "io.confluent.connect.avro.AvroConverter";

/// How failures during per-event processing are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureHandlingMode {
    /// Propagate a fatal error that stops the pipeline. The default.
    #[default]
    Fail,
    /// Log the event's position and cause, drop the event, continue.
    Warn,
    /// Silently drop the event and continue.
    Skip,
}

impl FailureHandlingMode {
    /// Deprecated alias for `skip`, accepted for backward compatibility.
    pub const OBSOLETE_NAME_FOR_SKIP: &'static str = "ignore";

    /// Parse the canonical string codes, accepting the deprecated
    /// `ignore` alias for [`FailureHandlingMode::Skip`]. Returns `None`
    /// for unknown codes.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case(Self::OBSOLETE_NAME_FOR_SKIP) {
            return Some(Self::Skip);
        }
        if value.eq_ignore_ascii_case("fail") {
            Some(Self::Fail)
        } else if value.eq_ignore_ascii_case("warn") {
            Some(Self::Warn)
        } else if value.eq_ignore_ascii_case("skip") {
            Some(Self::Skip)
        } else {
            None
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Warn => "warn",
            Self::Skip => "skip",
        }
    }
}

/// How tombstone-shaped (null value) events are treated by the predicate
/// filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullHandlingMode {
    /// Pass through unconditionally, bypassing evaluation. The default.
    #[default]
    Keep,
    /// Remove unconditionally, bypassing evaluation.
    Drop,
    /// Evaluate the expression with null value/value-schema bindings.
    Evaluate,
}

impl NullHandlingMode {
    /// Parse the canonical string codes; `None` for unknown codes.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("keep") {
            Some(Self::Keep)
        } else if value.eq_ignore_ascii_case("drop") {
            Some(Self::Drop)
        } else if value.eq_ignore_ascii_case("evaluate") {
            Some(Self::Evaluate)
        } else {
            None
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Drop => "drop",
            Self::Evaluate => "evaluate",
        }
    }
}

/// Version of the publicly visible source-metadata format. External to
/// this core; recognized and carried for the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStructVersion {
    V1,
    #[default]
    V2,
}

impl SourceStructVersion {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("v1") {
            Some(Self::V1)
        } else if value.eq_ignore_ascii_case("v2") {
            Some(Self::V2)
        } else {
            None
        }
    }
}

/// A single configuration problem found by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigProblem {
    /// The offending option name
    pub option: String,
    /// The offending value, if one was supplied
    pub value: Option<String>,
    /// Human-readable description
    pub message: String,
}

impl ConfigProblem {
    pub fn new(option: impl Into<String>, value: Option<String>, message: impl Into<String>) -> Self {
        Self {
            option: option.into(),
            value,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{} = '{}': {}", self.option, v, self.message),
            None => write!(f, "{}: {}", self.option, self.message),
        }
    }
}

/// A declared custom converter: its configuration prefix, resolved type
/// identifier and the sub-options scoped to the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterSpec {
    /// The prefix from the `converters` list
    pub prefix: String,
    /// Value of `<prefix>.type`
    pub type_id: String,
    /// Remaining `<prefix>.<option>` sub-options, prefix stripped
    pub options: BTreeMap<String, String>,
}

/// Predicate filter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Namespaced identifier of the expression engine to bootstrap
    pub language: String,
    /// The predicate expression text, compiled once at startup
    pub condition: String,
    /// Treatment of tombstone-shaped events
    pub null_handling: NullHandlingMode,
}

/// Configuration of the change-event processing pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Emit a tombstone marker after each delete event.
    pub tombstones_on_delete: bool,
    /// Queue capacity; must strictly exceed `max_batch_size`.
    pub max_queue_size: usize,
    /// Upper bound per drained batch.
    pub max_batch_size: usize,
    /// Maximum wait when the queue is empty.
    pub poll_interval: Duration,
    /// Delay before the snapshot phase begins (consumed by the external
    /// snapshot reader).
    pub snapshot_delay: Duration,
    /// External snapshot reader fetch hint; falls back to the
    /// connector-specific default passed at parse time.
    pub snapshot_fetch_size: usize,
    /// External source-metadata format version.
    pub source_struct_version: SourceStructVersion,
    /// External naming concern; forced true when the known schema-registry
    /// value converter is configured.
    pub sanitize_field_names: bool,
    /// External transaction-boundary event emission.
    pub provide_transaction_metadata: bool,
    /// Failure policy for per-event processing errors.
    pub failure_handling_mode: FailureHandlingMode,
    /// Operations dropped by the operation filter.
    pub skipped_operations: HashSet<Operation>,
    /// Declared custom converters, in registration order.
    pub converters: Vec<ConverterSpec>,
    /// Predicate filter, if configured.
    pub filter: Option<FilterConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tombstones_on_delete: true,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            snapshot_delay: Duration::ZERO,
            snapshot_fetch_size: 0,
            source_struct_version: SourceStructVersion::default(),
            sanitize_field_names: false,
            provide_transaction_metadata: false,
            failure_handling_mode: FailureHandlingMode::default(),
            skipped_operations: HashSet::new(),
            converters: Vec::new(),
            filter: None,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Parse a flat property map as produced by the host runtime.
    ///
    /// `default_snapshot_fetch_size` is the connector-specific fallback
    /// used when `snapshot.fetch.size` is absent. All problems are
    /// collected and reported together as a single fatal
    /// [`PipelineError::Configuration`].
    pub fn from_properties(
        props: &HashMap<String, String>,
        default_snapshot_fetch_size: usize,
    ) -> Result<Self> {
        let mut problems = Vec::new();
        let mut config = PipelineConfig {
            snapshot_fetch_size: default_snapshot_fetch_size,
            ..Default::default()
        };

        if let Some(v) = props.get("tombstones.on.delete") {
            match parse_bool(v) {
                Some(b) => config.tombstones_on_delete = b,
                None => problems.push(ConfigProblem::new(
                    "tombstones.on.delete",
                    Some(v.clone()),
                    "A boolean value is required",
                )),
            }
        }
        if let Some(v) = props.get("max.queue.size") {
            match v.trim().parse::<usize>() {
                Ok(n) => config.max_queue_size = n,
                Err(_) => problems.push(ConfigProblem::new(
                    "max.queue.size",
                    Some(v.clone()),
                    "A positive integer is required",
                )),
            }
        }
        if let Some(v) = props.get("max.batch.size") {
            match v.trim().parse::<usize>() {
                Ok(n) => config.max_batch_size = n,
                Err(_) => problems.push(ConfigProblem::new(
                    "max.batch.size",
                    Some(v.clone()),
                    "A positive integer is required",
                )),
            }
        }
        if let Some(v) = props.get("poll.interval.ms") {
            match v.trim().parse::<u64>() {
                Ok(ms) => config.poll_interval = Duration::from_millis(ms),
                Err(_) => problems.push(ConfigProblem::new(
                    "poll.interval.ms",
                    Some(v.clone()),
                    "A positive integer is required",
                )),
            }
        }
        if let Some(v) = props.get("snapshot.delay.ms") {
            match v.trim().parse::<u64>() {
                Ok(ms) => config.snapshot_delay = Duration::from_millis(ms),
                Err(_) => problems.push(ConfigProblem::new(
                    "snapshot.delay.ms",
                    Some(v.clone()),
                    "A non-negative integer is required",
                )),
            }
        }
        if let Some(v) = props.get("snapshot.fetch.size") {
            match v.trim().parse::<usize>() {
                Ok(n) => config.snapshot_fetch_size = n,
                Err(_) => problems.push(ConfigProblem::new(
                    "snapshot.fetch.size",
                    Some(v.clone()),
                    "A non-negative integer is required",
                )),
            }
        }
        if let Some(v) = props.get("source.struct.version") {
            match SourceStructVersion::parse(v) {
                Some(version) => config.source_struct_version = version,
                None => problems.push(ConfigProblem::new(
                    "source.struct.version",
                    Some(v.clone()),
                    "Expected one of: v1, v2",
                )),
            }
        }
        if let Some(v) = props.get("sanitize.field.names") {
            match parse_bool(v) {
                Some(b) => config.sanitize_field_names = b,
                None => problems.push(ConfigProblem::new(
                    "sanitize.field.names",
                    Some(v.clone()),
                    "A boolean value is required",
                )),
            }
        }
        // The known schema-registry converter requires sanitized names.
        if is_using_avro_converter(props) {
            config.sanitize_field_names = true;
        }
        if let Some(v) = props.get("provide.transaction.metadata") {
            match parse_bool(v) {
                Some(b) => config.provide_transaction_metadata = b,
                None => problems.push(ConfigProblem::new(
                    "provide.transaction.metadata",
                    Some(v.clone()),
                    "A boolean value is required",
                )),
            }
        }
        if let Some(v) = props.get("event.processing.failure.handling.mode") {
            match FailureHandlingMode::parse(v) {
                Some(mode) => config.failure_handling_mode = mode,
                None => problems.push(ConfigProblem::new(
                    "event.processing.failure.handling.mode",
                    Some(v.clone()),
                    "Expected one of: fail, warn, skip",
                )),
            }
        }
        if let Some(v) = props.get("skipped.operations") {
            match parse_skipped_operations(v) {
                Ok(ops) => config.skipped_operations = ops,
                Err(mut ps) => problems.append(&mut ps),
            }
        }
        if let Some(v) = props.get("converters") {
            match parse_converter_specs(v, props) {
                Ok(specs) => config.converters = specs,
                Err(mut ps) => problems.append(&mut ps),
            }
        }
        if let Some(condition) = props.get("condition") {
            let language = props.get("language").cloned().unwrap_or_default();
            if language.trim().is_empty() {
                problems.push(ConfigProblem::new(
                    "language",
                    None,
                    "An expression engine identifier is required when 'condition' is set",
                ));
            }
            let null_handling = match props.get("null.handling.mode") {
                Some(v) => match NullHandlingMode::parse(v) {
                    Some(mode) => mode,
                    None => {
                        problems.push(ConfigProblem::new(
                            "null.handling.mode",
                            Some(v.clone()),
                            "Expected one of: keep, drop, evaluate",
                        ));
                        NullHandlingMode::Keep
                    }
                },
                None => NullHandlingMode::Keep,
            };
            config.filter = Some(FilterConfig {
                language,
                condition: condition.clone(),
                null_handling,
            });
        }

        problems.extend(config.validate());
        if problems.is_empty() {
            Ok(config)
        } else {
            Err(aggregate_problems(&problems))
        }
    }

    /// Validate the configuration, returning every problem found.
    ///
    /// Pure; aggregation happens at the call site.
    pub fn validate(&self) -> Vec<ConfigProblem> {
        let mut problems = Vec::new();
        if self.max_queue_size == 0 {
            problems.push(ConfigProblem::new(
                "max.queue.size",
                Some(self.max_queue_size.to_string()),
                "A positive queue size is required",
            ));
        }
        if self.max_queue_size <= self.max_batch_size {
            problems.push(ConfigProblem::new(
                "max.queue.size",
                Some(self.max_queue_size.to_string()),
                "Must be larger than the maximum batch size",
            ));
        }
        if self.max_batch_size == 0 {
            problems.push(ConfigProblem::new(
                "max.batch.size",
                Some(self.max_batch_size.to_string()),
                "A positive batch size is required",
            ));
        }
        if self.poll_interval.is_zero() {
            problems.push(ConfigProblem::new(
                "poll.interval.ms",
                Some(self.poll_interval.as_millis().to_string()),
                "A positive poll interval is required",
            ));
        }
        problems
    }

    /// Validate and convert any problems into a fatal configuration error.
    pub fn ensure_valid(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(aggregate_problems(&problems))
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn tombstones_on_delete(mut self, enabled: bool) -> Self {
        self.config.tombstones_on_delete = enabled;
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.config.max_queue_size = n;
        self
    }

    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.config.max_batch_size = n;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.poll_interval = d;
        self
    }

    pub fn snapshot_delay(mut self, d: Duration) -> Self {
        self.config.snapshot_delay = d;
        self
    }

    pub fn snapshot_fetch_size(mut self, n: usize) -> Self {
        self.config.snapshot_fetch_size = n;
        self
    }

    pub fn source_struct_version(mut self, v: SourceStructVersion) -> Self {
        self.config.source_struct_version = v;
        self
    }

    pub fn sanitize_field_names(mut self, enabled: bool) -> Self {
        self.config.sanitize_field_names = enabled;
        self
    }

    pub fn provide_transaction_metadata(mut self, enabled: bool) -> Self {
        self.config.provide_transaction_metadata = enabled;
        self
    }

    pub fn failure_handling_mode(mut self, mode: FailureHandlingMode) -> Self {
        self.config.failure_handling_mode = mode;
        self
    }

    pub fn skipped_operations(mut self, ops: HashSet<Operation>) -> Self {
        self.config.skipped_operations = ops;
        self
    }

    pub fn skip_operation(mut self, op: Operation) -> Self {
        self.config.skipped_operations.insert(op);
        self
    }

    pub fn converter(mut self, spec: ConverterSpec) -> Self {
        self.config.converters.push(spec);
        self
    }

    pub fn filter(mut self, filter: FilterConfig) -> Self {
        self.config.filter = Some(filter);
        self
    }

    /// Build and validate; configuration problems are fatal.
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.ensure_valid()?;
        Ok(self.config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Parse the `skipped.operations` list; every code must belong to the
/// closed set {r, c, u, d}.
fn parse_skipped_operations(
    value: &str,
) -> std::result::Result<HashSet<Operation>, Vec<ConfigProblem>> {
    let mut ops = HashSet::new();
    let mut problems = Vec::new();
    for code in value.split(',') {
        let code = code.trim();
        if code.is_empty() {
            continue;
        }
        match Operation::for_code(code) {
            Some(op) => {
                ops.insert(op);
            }
            None => problems.push(ConfigProblem::new(
                "skipped.operations",
                Some(code.to_string()),
                "Invalid operation",
            )),
        }
    }
    if problems.is_empty() {
        Ok(ops)
    } else {
        Err(problems)
    }
}

/// Parse the `converters` prefix list. Each prefix requires a
/// `<prefix>.type` sub-option; further `<prefix>.<option>` entries become
/// the converter's own options, prefix stripped.
fn parse_converter_specs(
    value: &str,
    props: &HashMap<String, String>,
) -> std::result::Result<Vec<ConverterSpec>, Vec<ConfigProblem>> {
    let mut specs = Vec::new();
    let mut problems = Vec::new();
    for prefix in value.split(',') {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            continue;
        }
        let type_key = format!("{}{}", prefix, CONVERTER_TYPE_SUFFIX);
        let type_id = match props.get(&type_key) {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => {
                problems.push(ConfigProblem::new(
                    type_key,
                    None,
                    "A converter type is required",
                ));
                continue;
            }
        };
        let scope = format!("{}.", prefix);
        let options: BTreeMap<String, String> = props
            .iter()
            .filter(|(k, _)| k.starts_with(&scope) && *k != &type_key)
            .map(|(k, v)| (k[scope.len()..].to_string(), v.clone()))
            .collect();
        specs.push(ConverterSpec {
            prefix: prefix.to_string(),
            type_id,
            options,
        });
    }
    if problems.is_empty() {
        Ok(specs)
    } else {
        Err(problems)
    }
}

fn is_using_avro_converter(props: &HashMap<String, String>) -> bool {
    props.get("key.converter").map(String::as_str) == Some(AVRO_CONVERTER)
        || props.get("value.converter").map(String::as_str) == Some(AVRO_CONVERTER)
}

fn aggregate_problems(problems: &[ConfigProblem]) -> PipelineError {
    let joined = problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    PipelineError::configuration(joined)
}
