//! Pipeline integration tests
//!
//! End-to-end tests wiring the full event path: processor stages, the
//! bounded queue and the batch assembler with a recording harness.
//! Covers:
//! - Configuration validation
//! - Operation and predicate filtering
//! - Tombstone expansion and ordering
//! - Field conversion scoped by glob pattern
//! - Failure handling modes
//! - Backpressure and shutdown with final delivery
//!
//! Run with: cargo test --test pipeline_integration

use async_trait::async_trait;
use cdc_pipeline::batch::{Batch, BatchAssembler, PublishingHarness};
use cdc_pipeline::converters::{
    ConverterFactory, CustomConverter, FieldConversion, FieldMatcher, MatchingConverter,
};
use cdc_pipeline::predicate::{
    ClosureEngine, CompiledPredicate, FnPredicate, PredicateBindings,
};
use cdc_pipeline::{
    ChangeEvent, ChangeEventQueue, EngineRegistry, EventProcessor, FailureHandlingMode,
    FieldDescriptor, FilterConfig, NullHandlingMode, Operation, PipelineConfig, PipelineError,
    Result, SchemaDescriptor, SourcePosition,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cdc_pipeline=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Engine mirroring the shape of real scripting filters: compiles
/// `value.op == '<code>' && value.before.id == <n>` style conditions
/// down to a closure over the bindings.
fn scripting_engine() -> ClosureEngine {
    ClosureEngine::new("test.script", |expression| {
        let expression = expression.to_string();
        Ok(Box::new(FnPredicate(move |bindings: &PredicateBindings<'_>| {
            let value = match bindings.value {
                Some(v) => v,
                None => return Err("value binding is null".to_string()),
            };
            for clause in expression.split("&&") {
                let clause = clause.trim();
                let (path, wanted) = clause
                    .split_once("==")
                    .ok_or_else(|| format!("unparseable clause: {clause}"))?;
                let mut current = value;
                for segment in path.trim().split('.').skip(1) {
                    current = current
                        .get(segment)
                        .ok_or_else(|| format!("no such field: {segment}"))?;
                }
                let wanted = wanted.trim().trim_matches('\'');
                let matches = match current {
                    Value::String(s) => s == wanted,
                    other => other.to_string() == wanted,
                };
                if !matches {
                    return Ok(false);
                }
            }
            Ok(true)
        })) as Box<dyn CompiledPredicate>)
    })
}

/// Converter factory with one type: rewrites matched numeric fields
/// into fixed-scale decimal strings.
fn decimal_factory() -> ConverterFactory {
    ConverterFactory::new().register("decimal-string", |options| {
        let pattern = options
            .get("field")
            .cloned()
            .ok_or_else(|| PipelineError::configuration("decimal-string: 'field' is required"))?;
        let matcher = FieldMatcher::new(&pattern)?;
        let conversion = FieldConversion::new(FieldDescriptor::new("", "decimal-string"), |v| {
            let n = v.as_f64().ok_or_else(|| format!("not a number: {v}"))?;
            Ok(Value::String(format!("{n:.2}")))
        });
        Ok(Box::new(MatchingConverter::new(matcher, conversion)) as Box<dyn CustomConverter>)
    })
}

fn engines() -> EngineRegistry {
    EngineRegistry::new().register(Arc::new(scripting_engine()))
}

fn order_event(op: Operation, partition: u32, offset: u64, id: u64) -> ChangeEvent {
    let code = op.code().to_string();
    ChangeEvent::new(
        op,
        Some(json!({"id": id})),
        Some(json!({
            "op": code,
            "amount": 12.5,
            "before": {"id": id},
            "after": {"id": id},
        })),
        SourcePosition::new(partition, offset),
    )
    .with_value_schema(
        SchemaDescriptor::new("orders.Value")
            .with_field(FieldDescriptor::new("op", "string"))
            .with_field(FieldDescriptor::new("amount", "float64"))
            .with_field(FieldDescriptor::new("before", "struct").optional())
            .with_field(FieldDescriptor::new("after", "struct").optional()),
    )
}

fn build_processor(config: PipelineConfig) -> (EventProcessor, Arc<ChangeEventQueue>) {
    let queue = Arc::new(ChangeEventQueue::from_config(&config).unwrap());
    let processor =
        EventProcessor::from_config(&config, &engines(), &decimal_factory(), Arc::clone(&queue))
            .unwrap();
    (processor, queue)
}

/// Records delivered batches and committed positions.
#[derive(Default)]
struct RecordingHarness {
    batches: Mutex<Vec<Vec<ChangeEvent>>>,
    commits: Mutex<Vec<SourcePosition>>,
}

#[async_trait]
impl PublishingHarness for RecordingHarness {
    async fn deliver(&self, batch: &Batch) -> Result<()> {
        self.batches.lock().await.push(batch.events.clone());
        Ok(())
    }

    async fn commit(&self, position: SourcePosition) -> Result<()> {
        self.commits.lock().await.push(position);
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_queue_size_must_exceed_batch_size() {
    let err = PipelineConfig::builder()
        .max_queue_size(100)
        .max_batch_size(100)
        .build()
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(err.to_string().contains("larger than the maximum batch size"));
}

#[test]
fn test_unknown_converter_type_fails_startup() {
    let config = PipelineConfig::builder()
        .converter(cdc_pipeline::ConverterSpec {
            prefix: "money".to_string(),
            type_id: "no-such-type".to_string(),
            options: Default::default(),
        })
        .build()
        .unwrap();
    let queue = Arc::new(ChangeEventQueue::from_config(&config).unwrap());
    let err = EventProcessor::from_config(&config, &engines(), &decimal_factory(), queue)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Configuration(_)));
}

// ============================================================================
// End-to-end flow
// ============================================================================

#[tokio::test]
async fn test_full_pipeline_filters_converts_and_delivers() {
    init_test_logging();
    let config = PipelineConfig::builder()
        .max_queue_size(64)
        .max_batch_size(16)
        .poll_interval(Duration::from_millis(20))
        .skip_operation(Operation::Read)
        .filter(FilterConfig {
            language: "test.script".to_string(),
            condition: "value.op == 'u' && value.before.id == 2".to_string(),
            null_handling: NullHandlingMode::Keep,
        })
        .converter(cdc_pipeline::ConverterSpec {
            prefix: "money".to_string(),
            type_id: "decimal-string".to_string(),
            options: [("field".to_string(), "amount".to_string())].into(),
        })
        .build()
        .unwrap();
    let (processor, queue) = build_processor(config.clone());

    processor.process(order_event(Operation::Read, 0, 1, 2)).await.unwrap();
    processor.process(order_event(Operation::Update, 0, 2, 1)).await.unwrap();
    processor.process(order_event(Operation::Update, 0, 3, 2)).await.unwrap();
    processor.process(order_event(Operation::Create, 0, 4, 2)).await.unwrap();
    queue.shutdown().await;

    let mut assembler = BatchAssembler::new(queue, &config);
    let harness = Arc::new(RecordingHarness::default());
    assembler
        .run(Arc::clone(&harness) as Arc<dyn PublishingHarness>)
        .await
        .unwrap();

    let batches = harness.batches.lock().await;
    let delivered: Vec<&ChangeEvent> = batches.iter().flatten().collect();
    // Only the update at offset 3 survives: the read is skipped by
    // operation, the others fail the predicate.
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].source_position, SourcePosition::new(0, 3));
    // The converter rewrote the amount field and its schema.
    let value = delivered[0].value.as_ref().unwrap();
    assert_eq!(value["amount"], json!("12.50"));
    let schema = delivered[0].value_schema.as_ref().unwrap();
    assert_eq!(schema.field("amount").unwrap().type_name, "decimal-string");

    let commits = harness.commits.lock().await;
    assert_eq!(commits.as_slice(), &[SourcePosition::new(0, 3)]);

    let stats = processor.stats();
    assert_eq!(stats.events_seen, 4);
    assert_eq!(stats.skipped_operations, 1);
    assert_eq!(stats.filtered_out, 2);
    assert_eq!(stats.enqueued, 1);
}

#[tokio::test]
async fn test_tombstone_pair_survives_to_delivery_in_order() {
    let config = PipelineConfig::builder()
        .max_queue_size(64)
        .max_batch_size(16)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let (processor, queue) = build_processor(config.clone());

    processor.process(order_event(Operation::Delete, 0, 7, 1)).await.unwrap();
    queue.shutdown().await;

    let mut assembler = BatchAssembler::new(queue, &config);
    let harness = Arc::new(RecordingHarness::default());
    assembler
        .run(Arc::clone(&harness) as Arc<dyn PublishingHarness>)
        .await
        .unwrap();

    let batches = harness.batches.lock().await;
    let delivered: Vec<&ChangeEvent> = batches.iter().flatten().collect();
    assert_eq!(delivered.len(), 2);
    assert!(!delivered[0].is_tombstone());
    assert!(delivered[1].is_tombstone());
    assert_eq!(delivered[1].key, delivered[0].key);
    assert!(delivered[1].source_position > delivered[0].source_position);

    // The committed position covers the marker, not just the delete.
    let commits = harness.commits.lock().await;
    assert_eq!(commits.last(), Some(&SourcePosition::new(0, 7).successor()));
}

#[tokio::test]
async fn test_tombstones_disabled_delivers_single_delete() {
    let config = PipelineConfig::builder()
        .tombstones_on_delete(false)
        .max_queue_size(64)
        .max_batch_size(16)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let (processor, queue) = build_processor(config.clone());

    processor.process(order_event(Operation::Delete, 0, 7, 1)).await.unwrap();
    queue.shutdown().await;

    let mut assembler = BatchAssembler::new(queue, &config);
    let harness = Arc::new(RecordingHarness::default());
    assembler
        .run(Arc::clone(&harness) as Arc<dyn PublishingHarness>)
        .await
        .unwrap();

    let batches = harness.batches.lock().await;
    assert_eq!(batches.iter().flatten().count(), 1);
}

// ============================================================================
// Null handling
// ============================================================================

#[tokio::test]
async fn test_null_handling_drop_removes_tombstones() {
    let config = PipelineConfig::builder()
        .filter(FilterConfig {
            language: "test.script".to_string(),
            condition: "value.op == 'd'".to_string(),
            null_handling: NullHandlingMode::Drop,
        })
        .build()
        .unwrap();
    let (processor, queue) = build_processor(config);

    // Delete matches the predicate, expands into delete + marker; under
    // `drop` an upstream tombstone-shaped event would be removed before
    // evaluation, while synthesized markers are not re-filtered.
    let tombstone = ChangeEvent::new(
        Operation::Delete,
        Some(json!({"id": 1})),
        None,
        SourcePosition::new(0, 1),
    );
    processor.process(tombstone).await.unwrap();
    assert_eq!(processor.stats().enqueued, 0);

    processor.process(order_event(Operation::Delete, 0, 2, 1)).await.unwrap();
    assert_eq!(processor.stats().enqueued, 2);
    assert_eq!(queue.depth(), 2);
}

#[tokio::test]
async fn test_null_handling_evaluate_governed_by_failure_mode() {
    let config = PipelineConfig::builder()
        .failure_handling_mode(FailureHandlingMode::Warn)
        .filter(FilterConfig {
            language: "test.script".to_string(),
            condition: "value.op == 'u'".to_string(),
            null_handling: NullHandlingMode::Evaluate,
        })
        .build()
        .unwrap();
    let (processor, _queue) = build_processor(config);

    // The engine rejects the null value binding; warn mode drops and
    // continues.
    let tombstone = ChangeEvent::new(
        Operation::Delete,
        Some(json!({"id": 1})),
        None,
        SourcePosition::new(0, 1),
    );
    processor.process(tombstone).await.unwrap();
    assert_eq!(processor.stats().dropped_on_error, 1);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_conversion_failure_fail_mode_stops_pipeline() {
    let config = PipelineConfig::builder()
        .converter(cdc_pipeline::ConverterSpec {
            prefix: "money".to_string(),
            type_id: "decimal-string".to_string(),
            options: [("field".to_string(), "op".to_string())].into(),
        })
        .build()
        .unwrap();
    let (processor, _queue) = build_processor(config);

    // "op" holds a string; the decimal converter fails on it.
    let err = processor
        .process(order_event(Operation::Create, 0, 1, 1))
        .await
        .unwrap_err();
    match err {
        PipelineError::Conversion { field, position, .. } => {
            assert_eq!(field, "op");
            assert_eq!(position, SourcePosition::new(0, 1));
        }
        other => panic!("expected conversion error, got {other}"),
    }
}

#[tokio::test]
async fn test_conversion_failure_skip_mode_continues() {
    let config = PipelineConfig::builder()
        .failure_handling_mode(FailureHandlingMode::Skip)
        .converter(cdc_pipeline::ConverterSpec {
            prefix: "money".to_string(),
            type_id: "decimal-string".to_string(),
            options: [("field".to_string(), "op".to_string())].into(),
        })
        .build()
        .unwrap();
    let (processor, queue) = build_processor(config);

    processor.process(order_event(Operation::Create, 0, 1, 1)).await.unwrap();
    assert_eq!(processor.stats().dropped_on_error, 1);
    assert_eq!(queue.depth(), 0);
    // Positions keep advancing past dropped events.
    assert_eq!(
        processor.positions().latest(0),
        Some(SourcePosition::new(0, 1))
    );
}

// ============================================================================
// Backpressure and shutdown
// ============================================================================

#[tokio::test]
async fn test_backpressure_blocks_producer_until_consumer_drains() {
    let config = PipelineConfig::builder()
        .max_queue_size(4)
        .max_batch_size(2)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let (processor, queue) = build_processor(config.clone());
    let processor = Arc::new(processor);

    let producer = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move {
            for i in 0..12u64 {
                processor.process(order_event(Operation::Create, 0, i, i)).await?;
            }
            processor.queue().shutdown().await;
            Ok::<_, PipelineError>(())
        })
    };

    // With capacity 4 the producer cannot finish before draining starts.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());
    assert_eq!(queue.depth(), 4);

    let mut assembler = BatchAssembler::new(queue, &config);
    let harness = Arc::new(RecordingHarness::default());
    assembler
        .run(Arc::clone(&harness) as Arc<dyn PublishingHarness>)
        .await
        .unwrap();
    producer.await.unwrap().unwrap();

    let batches = harness.batches.lock().await;
    let offsets: Vec<u64> = batches
        .iter()
        .flatten()
        .map(|e| e.source_position.offset)
        .collect();
    assert_eq!(offsets, (0..12).collect::<Vec<_>>());
    assert!(batches.iter().all(|b| b.len() <= 2));
}

#[tokio::test]
async fn test_shutdown_during_processing_delivers_buffered_events() {
    let config = PipelineConfig::builder()
        .max_queue_size(64)
        .max_batch_size(16)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let (processor, queue) = build_processor(config.clone());

    for i in 0..5u64 {
        processor.process(order_event(Operation::Create, 0, i, i)).await.unwrap();
    }
    queue.shutdown().await;

    // Buffered events are still delivered exactly once after shutdown.
    let err = processor
        .process(order_event(Operation::Create, 0, 99, 99))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::QueueClosed));

    let mut assembler = BatchAssembler::new(queue, &config);
    let harness = Arc::new(RecordingHarness::default());
    assembler
        .run(Arc::clone(&harness) as Arc<dyn PublishingHarness>)
        .await
        .unwrap();
    assert_eq!(harness.batches.lock().await.iter().flatten().count(), 5);
}

#[tokio::test]
async fn test_multi_partition_commit_positions() {
    let config = PipelineConfig::builder()
        .max_queue_size(64)
        .max_batch_size(16)
        .poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let (processor, queue) = build_processor(config.clone());

    processor.process(order_event(Operation::Create, 0, 3, 1)).await.unwrap();
    processor.process(order_event(Operation::Create, 1, 8, 2)).await.unwrap();
    processor.process(order_event(Operation::Update, 0, 4, 1)).await.unwrap();
    queue.shutdown().await;

    let mut assembler = BatchAssembler::new(queue, &config);
    let harness = Arc::new(RecordingHarness::default());
    assembler
        .run(Arc::clone(&harness) as Arc<dyn PublishingHarness>)
        .await
        .unwrap();

    // One commit per partition, each at the partition's maximum.
    let mut commits = harness.commits.lock().await.clone();
    commits.sort();
    assert_eq!(
        commits,
        vec![SourcePosition::new(0, 4), SourcePosition::new(1, 8)]
    );
}
