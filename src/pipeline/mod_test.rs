use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::Span;

use super::*;
use crate::fixtures::{MockBehavior, MockProcessor, MockSink, MockSource, RecordingMetrics, SinkRecord};
use crate::models::{Column, EventKind, Field, LogicalType};
use crate::plugins::FatalErrorTx;
use crate::schema::Schema;
use crate::sinks::batch::{BatchConfig, BatchTarget, BatchWriter};

fn streams() -> Vec<StreamDefinition> {
    vec![
        StreamDefinition::new(
            "flights",
            vec![Column::new("flight_id", LogicalType::Int).primary_key(), Column::new("destination", LogicalType::String)],
        ),
        StreamDefinition::new("airports", vec![Column::new("code", LogicalType::String).primary_key()]),
    ]
}

fn flight(id: i64) -> Message {
    Message::new("flights", EventKind::Insert, vec![Field::new("flight_id", id), Field::new("destination", "SFO")])
}

fn airport(code: &str) -> Message {
    Message::new("airports", EventKind::Insert, vec![Field::new("code", code)])
}

struct Harness {
    pipeline: Pipeline,
    state_rx: watch::Receiver<PipelineState>,
    record: Arc<Mutex<SinkRecord>>,
    metrics: Arc<RecordingMetrics>,
    _fatal_tx: FatalErrorTx,
    _shutdown_tx: broadcast::Sender<()>,
}

fn harness(source: MockSource, processors: Vec<Box<dyn Processor>>, sink: MockSink, record: Arc<Mutex<SinkRecord>>) -> Harness {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let metrics = Arc::new(RecordingMetrics::default());
    let (pipeline, state_rx) = Pipeline::new(
        1,
        Span::none(),
        streams(),
        Box::new(source),
        processors,
        Box::new(sink),
        metrics.clone(),
        DEFAULT_QUEUE_CAPACITY,
        fatal_rx,
        shutdown_tx.clone(),
    );
    Harness {
        pipeline,
        state_rx,
        record,
        metrics,
        _fatal_tx: fatal_tx,
        _shutdown_tx: shutdown_tx,
    }
}

/// A batch target whose snapshot flushes always fail.
struct FailingFlushTarget;

#[async_trait]
impl BatchTarget for FailingFlushTarget {
    async fn flush_snapshot(&mut self, _: &str, _: &[Message]) -> Result<()> {
        bail!("snapshot flush rejected")
    }

    async fn write_row(&mut self, _: &Message) -> Result<()> {
        Ok(())
    }
}

/// A sink writing through a batch writer, in the way bulk-loading sinks do.
struct BatchingSink {
    writer: Option<BatchWriter>,
}

#[async_trait]
impl Sink for BatchingSink {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_expected_schema(&mut self, _: Schema) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, msg: Message) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.write(msg).await.map_err(|err| AppError::Write(format!("{:#}", err)).into()),
            None => bail!(AppError::Write("batching sink is stopped".into())),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.stop().await,
            None => Ok(()),
        }
    }
}

fn written_ids(record: &Arc<Mutex<SinkRecord>>) -> Vec<uuid::Uuid> {
    record.lock().map(|rec| rec.writes.iter().map(|msg| msg.id()).collect()).unwrap_or_default()
}

#[tokio::test]
async fn messages_are_written_in_source_order() -> Result<()> {
    let msgs = vec![flight(1), flight(2), flight(3)];
    let expected: Vec<_> = msgs.iter().map(|msg| msg.id()).collect();
    let (pass, _) = MockProcessor::recording(MockBehavior::Pass);
    let (sink, record) = MockSink::recording();
    let h = harness(MockSource::new(msgs.into_iter().map(Ok).collect()), vec![Box::new(pass)], sink, record);

    h.pipeline.spawn().await??;

    let written = written_ids(&h.record);
    assert!(written == expected, "expected writes in source order, got {:?}", written);
    assert!(h.metrics.count("received", None) == 3, "expected 3 received, got {}", h.metrics.count("received", None));
    assert!(h.metrics.count("sent", None) == 3, "expected 3 sent, got {}", h.metrics.count("sent", None));
    assert!(h.metrics.count("processor_execution", Some("0_mock")) == 3, "expected execution time observed per message");
    assert!(h.metrics.registered() == vec!["0_mock"], "unexpected registered processors {:?}", h.metrics.registered());
    Ok(())
}

#[tokio::test]
async fn dropped_message_skips_remaining_processors_and_sink() -> Result<()> {
    let msgs = vec![flight(1), airport("SFO"), flight(2)];
    let (drop_airports, first_seen) = MockProcessor::recording(MockBehavior::DropStream("airports".into()));
    let (pass, second_seen) = MockProcessor::recording(MockBehavior::Pass);
    let (sink, record) = MockSink::recording();
    let h = harness(MockSource::new(msgs.into_iter().map(Ok).collect()), vec![Box::new(drop_airports), Box::new(pass)], sink, record);

    h.pipeline.spawn().await??;

    let (first, second) = (first_seen.lock().map(|ids| ids.len()).unwrap_or(0), second_seen.lock().map(|ids| ids.len()).unwrap_or(0));
    let written = written_ids(&h.record).len();
    assert!(first == 3, "expected first processor to see all messages, got {}", first);
    assert!(second == 2, "expected second processor to be skipped for the dropped message, got {}", second);
    assert!(written == 2, "expected dropped message to never reach the sink, got {} writes", written);
    assert!(h.metrics.count("processor_dropped", Some("0_mock")) == 1, "expected one dropped message for the first processor");
    assert!(h.metrics.count("processor_dropped", Some("1_mock")) == 0, "expected no dropped message for the second processor");
    assert!(h.metrics.count("processor_sent", Some("0_mock")) == 2, "expected two sent messages for the first processor");
    Ok(())
}

#[tokio::test]
async fn source_errors_are_counted_and_skipped() -> Result<()> {
    let events = vec![Ok(flight(1)), Err(anyhow::anyhow!("malformed event")), Ok(flight(2))];
    let (sink, record) = MockSink::recording();
    let h = harness(MockSource::new(events), vec![], sink, record);

    h.pipeline.spawn().await??;

    let written = written_ids(&h.record).len();
    assert!(written == 2, "expected ingestion to continue past the malformed event, got {} writes", written);
    assert!(h.metrics.count("source_errors", None) == 1, "expected one source error");
    assert!(h.metrics.count("received", None) == 2, "expected malformed event not to count as received");
    Ok(())
}

#[tokio::test]
async fn processor_error_is_fatal() -> Result<()> {
    let msgs = vec![flight(1), airport("SFO"), flight(2)];
    let (fail_airports, _) = MockProcessor::recording(MockBehavior::FailStream("airports".into()));
    let (sink, record) = MockSink::recording();
    let h = harness(MockSource::new(msgs.into_iter().map(Ok).collect()), vec![Box::new(fail_airports)], sink, record);
    let state_rx = h.state_rx.clone();

    let res = h.pipeline.spawn().await?;

    let err = res.err().context("expected processor failure to terminate the pipeline")?;
    let written = written_ids(&h.record).len();
    let stopped = h.record.lock().map(|rec| rec.stopped).unwrap_or(false);
    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::Processing { processor, .. }) if processor == "0_mock"),
        "unexpected error returned {:?}",
        err
    );
    assert!(written == 1, "expected only the message before the failure to be written, got {}", written);
    assert!(*state_rx.borrow() == PipelineState::Failing, "expected failing state, got {}", *state_rx.borrow());
    assert!(stopped, "expected sink to be stopped on failure");
    Ok(())
}

#[tokio::test]
async fn sink_write_failure_policy_is_honored() -> Result<()> {
    let msgs = vec![airport("SFO"), flight(1)];
    let (mut sink, record) = MockSink::recording();
    sink.fail_stream = Some("airports".into());
    let h = harness(MockSource::new(msgs.clone().into_iter().map(Ok).collect()), vec![], sink, record);

    h.pipeline.spawn().await??;

    let written = written_ids(&h.record).len();
    assert!(written == 1, "expected pipeline to continue past the failed write, got {} writes", written);
    assert!(h.metrics.count("sink_errors", None) == 1, "expected one sink error");

    let (mut fatal_sink, fatal_record) = MockSink::recording();
    fatal_sink.fail_stream = Some("airports".into());
    fatal_sink.policy = WriteFailurePolicy::Fatal;
    let fatal = harness(MockSource::new(msgs.into_iter().map(Ok).collect()), vec![], fatal_sink, fatal_record);

    let res = fatal.pipeline.spawn().await?;

    let written = written_ids(&fatal.record).len();
    assert!(res.is_err(), "expected fatal write failure policy to terminate the pipeline");
    assert!(written == 0, "expected no writes after the fatal failure, got {}", written);
    Ok(())
}

#[tokio::test]
async fn load_evolves_schema_and_transitions_state() -> Result<()> {
    let (add_gate, _) = MockProcessor::recording(MockBehavior::AddField("flights".into(), "gate".into()));
    let (pass, _) = MockProcessor::recording(MockBehavior::Pass);
    let (sink, record) = MockSink::recording();
    let mut h = harness(MockSource::new(vec![]), vec![Box::new(add_gate), Box::new(pass)], sink, record);

    let before = *h.state_rx.borrow();
    h.pipeline.load().await?;

    let after = *h.state_rx.borrow();
    let schema = h.record.lock().ok().and_then(|rec| rec.schema.clone()).context("expected sink to receive a schema")?;
    let gate = schema.get("flights").and_then(|def| def.column("gate")).is_some();
    assert!(before == PipelineState::Starting, "expected starting state, got {}", before);
    assert!(after == PipelineState::Loaded, "expected loaded state, got {}", after);
    assert!(schema.version() == 2, "expected one version per processor, got {}", schema.version());
    assert!(gate, "expected sink schema to include the evolved column");

    h.pipeline.spawn().await??;
    Ok(())
}

#[tokio::test]
async fn connection_failure_leaves_pipeline_failing() -> Result<()> {
    let mut source = MockSource::new(vec![]);
    source.fail_connect = true;
    let (sink, record) = MockSink::recording();
    let mut h = harness(source, vec![], sink, record);

    let res = h.pipeline.load().await;

    let err = res.err().context("expected connect failure to abort loading")?;
    let schema_set = h.record.lock().map(|rec| rec.schema.is_some()).unwrap_or(true);
    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::Connection(_))), "unexpected error returned {:?}", err);
    assert!(h.pipeline.state() == PipelineState::Failing, "expected failing state, got {}", h.pipeline.state());
    assert!(!schema_set, "expected sink schema not to be set after a failed load");
    Ok(())
}

#[tokio::test]
async fn started_state_is_published_while_running() -> Result<()> {
    let (sink, record) = MockSink::recording();
    let h = harness(MockSource::new(vec![Ok(flight(1))]), vec![], sink, record);
    let mut state_rx = h.state_rx.clone();

    let handle = h.pipeline.spawn();
    let mut seen = vec![*state_rx.borrow()];
    while state_rx.changed().await.is_ok() {
        seen.push(*state_rx.borrow());
    }
    handle.await??;

    // Watch receivers only observe the latest value, so intermediate states may be coalesced.
    assert!(seen.first() == Some(&PipelineState::Starting), "unexpected initial state {:?}", seen);
    assert!(seen.last() == Some(&PipelineState::Started), "expected pipeline to end started, got {:?}", seen);
    assert!(!seen.contains(&PipelineState::Failing), "unexpected failing state in {:?}", seen);
    Ok(())
}

#[tokio::test]
async fn failed_timer_flush_fails_the_pipeline() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let config = BatchConfig {
        max_batch_size: 10,
        flush_interval: Duration::from_millis(20),
    };
    let writer = BatchWriter::new(FailingFlushTarget, config, Span::none(), fatal_tx, &shutdown_tx);
    let snapshot = Message::new("flights", EventKind::Snapshot, vec![Field::new("flight_id", 1), Field::new("destination", "SFO")]);
    let mut source = MockSource::new(vec![Ok(snapshot)]);
    source.hold_open = true;
    let (pipeline, state_rx) = Pipeline::new(
        1,
        Span::none(),
        streams(),
        Box::new(source),
        vec![],
        Box::new(BatchingSink { writer: Some(writer) }),
        Arc::new(RecordingMetrics::default()),
        DEFAULT_QUEUE_CAPACITY,
        fatal_rx,
        shutdown_tx.clone(),
    );

    let res = tokio::time::timeout(Duration::from_secs(5), pipeline.spawn())
        .await
        .context("expected the failed flush to terminate the pipeline")??;

    let state = *state_rx.borrow();
    assert!(res.is_err(), "expected the pipeline to return the timer flush failure");
    assert!(state == PipelineState::Failing, "expected failing state, got {}", state);
    Ok(())
}
