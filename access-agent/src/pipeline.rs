//! Stage wiring and task lifetimes.
//!
//! The source feeds a bounded line queue shared by the parser workers, which in turn feed a
//! bounded record queue shared by the sink workers. Full queues block their producers, so a
//! slow sink eventually stalls the tail instead of growing memory. Each sink worker runs under
//! a supervisor that restarts it after it gives up on a record.

use crate::config::Config;
use crate::monitor::{event_channel, EventSender, MonitorHandle, MonitorService, QueueProbe};
use crate::output_writer::{write_with_retry, RecordSink, RetryPolicy, SinkError};
use crate::parsers::{line_preview, Parser};
use crate::record::{LifecycleEvent, ParsedRecord, RawLine};
use crate::tailer::{sleep_or_cancel, LineSource};
use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const LINE_PREVIEW_BYTES: usize = 160;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub parser_workers: usize,
    pub sink_workers: usize,
    pub line_queue_capacity: usize,
    pub record_queue_capacity: usize,
    pub event_queue_capacity: usize,
    pub poll_interval: Duration,
    pub sample_interval: Duration,
    pub retry: RetryPolicy,
    pub restart_delay: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parser_workers: config.pipeline.parser_workers,
            sink_workers: config.pipeline.sink_workers,
            line_queue_capacity: config.pipeline.line_queue_capacity,
            record_queue_capacity: config.pipeline.record_queue_capacity,
            event_queue_capacity: config.pipeline.event_queue_capacity,
            poll_interval: config.poll_interval(),
            sample_interval: config.sample_interval(),
            retry: config.retry_policy(),
            restart_delay: config.restart_delay(),
        }
    }
}

/// Running pipeline. Dropping it does not stop the tasks; call [`Pipeline::shutdown`].
pub struct Pipeline {
    monitor: MonitorHandle,
    source: Option<JoinHandle<Result<()>>>,
    workers: Vec<(String, JoinHandle<()>)>,
    cancel_token: CancellationToken,
}

impl Pipeline {
    /// Spawns the monitor, the source, `parser_workers` parsers and `sink_workers` supervised
    /// sink workers. All of them stop when `cancel_token` is cancelled.
    pub fn start(
        source: LineSource,
        parser: Arc<dyn Parser>,
        sink: Arc<dyn RecordSink>,
        settings: &PipelineSettings,
        cancel_token: CancellationToken,
    ) -> Self {
        Self::start_with_source(
            move |lines, events, poll_interval, cancel_token| {
                source.run(lines, events, poll_interval, cancel_token)
            },
            parser,
            sink,
            settings,
            cancel_token,
        )
    }

    fn start_with_source<S, F>(
        source: S,
        parser: Arc<dyn Parser>,
        sink: Arc<dyn RecordSink>,
        settings: &PipelineSettings,
        cancel_token: CancellationToken,
    ) -> Self
    where
        S: FnOnce(flume::Sender<RawLine>, EventSender, Duration, CancellationToken) -> F,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (line_tx, line_rx) = flume::bounded::<RawLine>(settings.line_queue_capacity.max(1));
        let (record_tx, record_rx) =
            flume::bounded::<ParsedRecord>(settings.record_queue_capacity.max(1));
        let (events, events_rx) = event_channel(settings.event_queue_capacity.max(1));

        let (monitor_service, monitor) = MonitorService::new(
            events_rx,
            events.clone(),
            QueueProbe::new(line_rx.clone()),
            QueueProbe::new(record_rx.clone()),
            settings.sample_interval,
        );

        let mut workers = Vec::with_capacity(settings.parser_workers + settings.sink_workers + 1);
        workers.push((
            "monitor".to_string(),
            tokio::spawn(monitor_service.run(cancel_token.clone())),
        ));

        for worker_id in 0..settings.parser_workers.max(1) {
            let handle = tokio::spawn(run_parser_worker(
                worker_id,
                line_rx.clone(),
                record_tx.clone(),
                parser.clone(),
                events.clone(),
                cancel_token.clone(),
            ));
            workers.push((format!("parser-{worker_id}"), handle));
        }
        drop(record_tx);

        for worker_id in 0..settings.sink_workers.max(1) {
            let handle = tokio::spawn(supervise_sink_worker(
                worker_id,
                record_rx.clone(),
                sink.clone(),
                settings.retry,
                settings.restart_delay,
                events.clone(),
                cancel_token.clone(),
            ));
            workers.push((format!("sink-{worker_id}"), handle));
        }

        let source_handle = tokio::spawn(source(
            line_tx,
            events,
            settings.poll_interval,
            cancel_token.clone(),
        ));

        info!(
            parser_workers = settings.parser_workers,
            sink_workers = settings.sink_workers,
            line_queue_capacity = settings.line_queue_capacity,
            record_queue_capacity = settings.record_queue_capacity,
            "pipeline started"
        );

        Self {
            monitor,
            source: Some(source_handle),
            workers,
            cancel_token,
        }
    }

    pub fn monitor(&self) -> MonitorHandle {
        self.monitor.clone()
    }

    /// Resolves when the source stops. Anything other than a cancelled, clean stop is an error.
    ///
    /// Must not be polled again after it has resolved.
    pub async fn source_finished(&mut self) -> Result<()> {
        let Some(handle) = self.source.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.source = None;

        match joined {
            Ok(Ok(())) if self.cancel_token.is_cancelled() => Ok(()),
            Ok(Ok(())) => Err(anyhow!("line source stopped unexpectedly")),
            Ok(Err(err)) => Err(err.context("line source failed")),
            Err(err) => Err(anyhow!(err).context("line source task panicked")),
        }
    }

    /// Cancels every stage and waits for each task, aborting those that overrun the timeout.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();

        if let Some(handle) = self.source.take() {
            join_or_abort("source", handle).await;
        }
        for (name, handle) in self.workers.drain(..) {
            join_or_abort(&name, handle).await;
        }

        info!("pipeline stopped");
    }
}

pub(crate) async fn join_or_abort<T>(name: &str, mut handle: JoinHandle<T>) {
    let timeout = sleep(SHUTDOWN_TIMEOUT);
    tokio::pin!(timeout);

    let result = tokio::select! {
        res = &mut handle => Some(res),
        _ = &mut timeout => None,
    };

    match result {
        Some(Ok(_)) => debug!(task = name, "task stopped"),
        Some(Err(err)) => warn!(task = name, error = %err, "task exited with error during shutdown"),
        None => {
            warn!(task = name, "task did not stop within timeout; aborting");
            handle.abort();
        }
    }
}

/// Parses lines until the line queue closes or the pipeline is cancelled.
///
/// Unparseable lines are counted and dropped; they never stop the worker.
pub async fn run_parser_worker(
    worker_id: usize,
    lines: flume::Receiver<RawLine>,
    records: flume::Sender<ParsedRecord>,
    parser: Arc<dyn Parser>,
    events: EventSender,
    cancel_token: CancellationToken,
) {
    debug!(worker_id, "parser worker started");

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            received = lines.recv_async() => match received {
                Ok(line) => line,
                Err(_) => break,
            },
        };

        let record = match parser.parse(&line) {
            Ok(record) => record,
            Err(err) => {
                events.emit(LifecycleEvent::ParseError);
                warn!(
                    worker_id,
                    kind = err.kind(),
                    error = %err,
                    line = %line_preview(&line, LINE_PREVIEW_BYTES),
                    "dropping unparseable line"
                );
                continue;
            }
        };

        if record.defaulted.any() {
            debug!(
                worker_id,
                defaulted = ?record.defaulted,
                path = %record.path,
                "numeric fields defaulted to zero"
            );
        }

        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            sent = records.send_async(record) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!(worker_id, "parser worker stopped");
}

/// Writes records one at a time until the record queue closes or the pipeline is cancelled.
///
/// Returns an error, after emitting `WriteFailed`, when a record exhausts its retries.
pub async fn run_sink_worker(
    worker_id: usize,
    records: flume::Receiver<ParsedRecord>,
    sink: Arc<dyn RecordSink>,
    retry: RetryPolicy,
    events: EventSender,
    cancel_token: CancellationToken,
) -> Result<()> {
    loop {
        let record = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            received = records.recv_async() => match received {
                Ok(record) => record,
                Err(_) => break,
            },
        };

        match write_with_retry(sink.as_ref(), &record, retry, &cancel_token).await {
            Ok(()) => {}
            Err(SinkError::Cancelled) => break,
            Err(err) => {
                events.emit(LifecycleEvent::WriteFailed);
                error!(
                    worker_id,
                    path = %record.path,
                    status = %record.status,
                    attempts = retry.max_attempts,
                    error = %err,
                    "dropping record after exhausting write retries"
                );
                return Err(err).with_context(|| format!("sink worker {worker_id} gave up"));
            }
        }
    }

    Ok(())
}

async fn supervise_sink_worker(
    worker_id: usize,
    records: flume::Receiver<ParsedRecord>,
    sink: Arc<dyn RecordSink>,
    retry: RetryPolicy,
    restart_delay: Duration,
    events: EventSender,
    cancel_token: CancellationToken,
) {
    debug!(worker_id, "sink worker started");

    loop {
        let result = run_sink_worker(
            worker_id,
            records.clone(),
            sink.clone(),
            retry,
            events.clone(),
            cancel_token.clone(),
        )
        .await;

        let Err(err) = result else {
            break;
        };
        if cancel_token.is_cancelled() {
            break;
        }

        warn!(
            worker_id,
            error = %err,
            restart_delay_ms = restart_delay.as_millis() as u64,
            "sink worker aborted; restarting"
        );
        if sleep_or_cancel(restart_delay, &cancel_token).await {
            break;
        }
        events.emit(LifecycleEvent::SinkRestarted);
        info!(worker_id, "sink worker restarted");
    }

    debug!(worker_id, "sink worker stopped");
}
