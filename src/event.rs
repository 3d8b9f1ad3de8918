//! Change event representation
//!
//! Unified event structure handed from the database-log reader to the
//! processing pipeline.
//!
//! ## Position Tracking
//!
//! Every event carries a [`SourcePosition`]: an opaque, totally ordered
//! token identifying its place in the source log. Positions increase
//! monotonically per source partition and are preserved end-to-end; no
//! pipeline stage may reorder events within a partition.
//!
//! ```ignore
//! // Positions from the same partition are comparable
//! assert!(event1.source_position < event2.source_position);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Change operation type, a closed set with single-letter wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Snapshot read (initial sync)
    Read,
    /// Row inserted
    Create,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl Operation {
    /// The single-letter code used in configuration and envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Operation::Read => "r",
            Operation::Create => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
        }
    }

    /// Parse a single-letter operation code.
    ///
    /// Returns `None` for anything outside the closed set; callers decide
    /// whether that is a configuration error.
    pub fn for_code(code: &str) -> Option<Operation> {
        match code.trim() {
            "r" => Some(Operation::Read),
            "c" => Some(Operation::Create),
            "u" => Some(Operation::Update),
            "d" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Read => write!(f, "READ"),
            Operation::Create => write!(f, "CREATE"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// Opaque, totally ordered token identifying an event's place in the
/// source log.
///
/// Ordering is `(partition, offset, seq)`. Within a partition the log
/// reader produces strictly increasing offsets; `seq` is a sub-sequence
/// used for events synthesized from a source event (tombstone markers),
/// so they sort after their origin and before the next source offset.
/// Cross-partition ordering is unspecified by the pipeline contract but
/// well-defined here so positions can live in ordered collections.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SourcePosition {
    /// Source partition the event originated from.
    pub partition: u32,
    /// Offset within the partition's log (LSN, binlog position, ...).
    pub offset: u64,
    /// Sub-sequence for synthesized events; 0 for source-log events.
    pub seq: u32,
}

impl SourcePosition {
    /// Position of a source-log event.
    pub fn new(partition: u32, offset: u64) -> Self {
        Self {
            partition,
            offset,
            seq: 0,
        }
    }

    /// The immediately following logical position: same offset, bumped
    /// sub-sequence. Sorts after `self` and before the partition's next
    /// source offset.
    pub fn successor(&self) -> Self {
        Self {
            partition: self.partition,
            offset: self.offset,
            seq: self.seq + 1,
        }
    }
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.seq == 0 {
            write!(f, "{}/{}", self.partition, self.offset)
        } else {
            write!(f, "{}/{}+{}", self.partition, self.offset, self.seq)
        }
    }
}

/// Structural descriptor for a single field of a structured value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// Logical type name (e.g. "int64", "string", "isbn")
    pub type_name: String,
    /// Whether the field may be absent or null
    pub optional: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Structural descriptor paired with a structured value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Schema name (usually the qualified table name)
    pub name: String,
    /// Ordered field descriptors
    pub fields: Vec<FieldDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Look up a field descriptor by name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// An immutable change event captured from a source log.
///
/// A `None` value denotes a tombstone (delete marker): downstream log
/// compaction removes all events for the key once it sees one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Structured key; `None` for keyless tables.
    pub key: Option<Value>,
    /// Structured value; `None` denotes a tombstone.
    pub value: Option<Value>,
    /// Descriptor for `key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_schema: Option<SchemaDescriptor>,
    /// Descriptor for `value`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_schema: Option<SchemaDescriptor>,
    /// Operation that produced this event
    pub operation: Operation,
    /// Place of this event in the source log
    pub source_position: SourcePosition,
}

impl ChangeEvent {
    /// Create an event with the given operation, key and value.
    pub fn new(
        operation: Operation,
        key: Option<Value>,
        value: Option<Value>,
        source_position: SourcePosition,
    ) -> Self {
        Self {
            key,
            value,
            key_schema: None,
            value_schema: None,
            operation,
            source_position,
        }
    }

    /// Create a snapshot-read event.
    pub fn read(key: Value, value: Value, position: SourcePosition) -> Self {
        Self::new(Operation::Read, Some(key), Some(value), position)
    }

    /// Create an insert event.
    pub fn create(key: Value, value: Value, position: SourcePosition) -> Self {
        Self::new(Operation::Create, Some(key), Some(value), position)
    }

    /// Create an update event.
    pub fn update(key: Value, value: Value, position: SourcePosition) -> Self {
        Self::new(Operation::Update, Some(key), Some(value), position)
    }

    /// Create a delete event. The value typically carries the row's final
    /// state under `before`.
    pub fn delete(key: Value, value: Value, position: SourcePosition) -> Self {
        Self::new(Operation::Delete, Some(key), Some(value), position)
    }

    /// Attach a key schema.
    pub fn with_key_schema(mut self, schema: SchemaDescriptor) -> Self {
        self.key_schema = Some(schema);
        self
    }

    /// Attach a value schema.
    pub fn with_value_schema(mut self, schema: SchemaDescriptor) -> Self {
        self.value_schema = Some(schema);
        self
    }

    /// Whether this event is a tombstone (null value).
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Synthesize the tombstone marker following a delete event: same key
    /// and key schema, null value, position immediately after the delete.
    pub fn tombstone_for(delete: &ChangeEvent) -> ChangeEvent {
        ChangeEvent {
            key: delete.key.clone(),
            value: None,
            key_schema: delete.key_schema.clone(),
            value_schema: None,
            operation: Operation::Delete,
            source_position: delete.source_position.successor(),
        }
    }
}
