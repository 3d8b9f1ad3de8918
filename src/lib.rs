//! # cdc-pipeline - Change event processing pipeline
//!
//! The connector-independent stretch of a change-data-capture system:
//! everything between the database log reader and the publishing layer.
//! Source events flow through operation filtering, scripted predicate
//! filtering, tombstone expansion and field conversion into a bounded
//! FIFO queue; a single consumer assembles batches and commits source
//! positions after delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  Log reader  │  (external producer, possibly several)
//! └──────┬───────┘
//!        ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                   EventProcessor                     │
//! │  op filter → predicate → tombstones → converters     │
//! └──────┬───────────────────────────────────────────────┘
//!        ▼
//! ┌──────────────────┐     ┌──────────────────┐
//! │ ChangeEventQueue │ ──▶ │  BatchAssembler  │ ──▶ PublishingHarness
//! │ (bounded, FIFO)  │     │ (size-or-time)   │      deliver + commit
//! └──────────────────┘     └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> cdc_pipeline::Result<()> {
//! use cdc_pipeline::{
//!     ChangeEventQueue, ConverterFactory, EngineRegistry, EventProcessor, PipelineConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::builder()
//!     .max_queue_size(4096)
//!     .max_batch_size(512)
//!     .build()?;
//!
//! let queue = Arc::new(ChangeEventQueue::from_config(&config)?);
//! let processor = EventProcessor::from_config(
//!     &config,
//!     &EngineRegistry::new(),
//!     &ConverterFactory::new(),
//!     Arc::clone(&queue),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! Core types are re-exported at the crate root; engine- and
//! converter-plumbing traits stay in their modules (`predicate`,
//! `converters`) for embedders wiring in their own implementations.

pub mod batch;
pub mod config;
pub mod converters;
pub mod error;
pub mod event;
pub mod operation_filter;
pub mod pipeline;
pub mod predicate;
pub mod queue;
pub mod tombstone;

// Core event and error types
pub use error::{ErrorCategory, PipelineError, Result};
pub use event::{ChangeEvent, FieldDescriptor, Operation, SchemaDescriptor, SourcePosition};

// Configuration
pub use config::{
    ConfigProblem, ConverterSpec, FailureHandlingMode, FilterConfig, NullHandlingMode,
    PipelineConfig, PipelineConfigBuilder, SourceStructVersion,
};

// Pipeline stages
pub use converters::{ConverterFactory, ConverterRegistry, CustomConverter};
pub use operation_filter::OperationFilter;
pub use pipeline::{EventProcessor, PositionTracker};
pub use predicate::{EngineRegistry, EventFilter, PredicateEngine};
pub use tombstone::TombstonePolicy;

// Queue and batching
pub use batch::{Batch, BatchAssembler, PublishingHarness};
pub use queue::{ChangeEventQueue, QueueEntry};
