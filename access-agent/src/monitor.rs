//! Single-owner aggregation of pipeline lifecycle events.
//!
//! Workers never touch counters directly. They push [`LifecycleEvent`]s through an
//! [`EventSender`]; one [`MonitorService`] task drains that queue, samples throughput and answers
//! snapshot requests coming from [`MonitorHandle`]s.

use crate::metrics::{
    LINES_HANDLED_TOTAL, PARSE_ERRORS_TOTAL, SINK_WORKER_RESTARTS_TOTAL,
    THROUGHPUT_LINES_PER_SECOND, WRITE_FAILURES_TOTAL,
};
use crate::record::LifecycleEvent;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 8192;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Creates the bounded lifecycle-event queue.
pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<LifecycleEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = EventSender {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

/// Best-effort producer side of the event queue.
///
/// A full queue never blocks ingestion: the event is discarded and counted instead, and the
/// count is surfaced as `eventsDropped` in every snapshot.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<LifecycleEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    pub fn emit(&self, event: LifecycleEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(?event, dropped, "monitor event queue full; dropping event");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Running totals owned by the monitor task.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counters {
    pub handle_line: u64,
    pub err_num: u64,
    pub write_err_num: u64,
    pub sink_restarts: u64,
    pub tps: f64,
}

/// Two-slot history of the handled-line counter.
#[derive(Debug, Clone)]
pub struct ThroughputSampler {
    interval: Duration,
    samples: VecDeque<u64>,
    tps: f64,
}

impl ThroughputSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            samples: VecDeque::with_capacity(2),
            tps: 0.0,
        }
    }

    /// Appends a sample and returns the throughput over the last interval.
    pub fn record(&mut self, handled: u64) -> f64 {
        self.samples.push_back(handled);
        if self.samples.len() > 2 {
            self.samples.pop_front();
        }
        if let (Some(previous), Some(latest)) = (self.samples.front(), self.samples.back()) {
            if self.samples.len() == 2 && !self.interval.is_zero() {
                self.tps = latest.saturating_sub(*previous) as f64 / self.interval.as_secs_f64();
            }
        }
        self.tps
    }

    pub fn tps(&self) -> f64 {
        self.tps
    }
}

/// Length and capacity view of one hand-off queue.
#[derive(Clone)]
pub struct QueueProbe {
    len: Arc<dyn Fn() -> usize + Send + Sync>,
    capacity: usize,
}

impl QueueProbe {
    pub fn new<T: Send + 'static>(queue: flume::Receiver<T>) -> Self {
        let capacity = queue.capacity().unwrap_or(usize::MAX);
        Self {
            len: Arc::new(move || queue.len()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        (self.len)()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for QueueProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProbe")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Point-in-time view served by the status endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub handle_line: u64,
    pub tps: f64,
    pub read_chan_len: usize,
    pub write_chan_len: usize,
    pub run_time: String,
    pub err_num: u64,
    pub read_chan_cap: usize,
    pub write_chan_cap: usize,
    pub events_dropped: u64,
    pub write_err_num: u64,
    pub sink_restarts: u64,
}

#[derive(Debug)]
enum MonitorCommand {
    Snapshot(oneshot::Sender<Counters>),
}

pub struct MonitorService {
    events_rx: mpsc::Receiver<LifecycleEvent>,
    commands_rx: mpsc::Receiver<MonitorCommand>,
    counters: Counters,
    sampler: ThroughputSampler,
    sample_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct MonitorHandle {
    commands_tx: mpsc::Sender<MonitorCommand>,
    events: EventSender,
    line_queue: QueueProbe,
    record_queue: QueueProbe,
    started_at: Instant,
}

impl MonitorService {
    pub fn new(
        events_rx: mpsc::Receiver<LifecycleEvent>,
        events: EventSender,
        line_queue: QueueProbe,
        record_queue: QueueProbe,
        sample_interval: Duration,
    ) -> (Self, MonitorHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let service = Self {
            events_rx,
            commands_rx,
            counters: Counters::default(),
            sampler: ThroughputSampler::new(sample_interval),
            sample_interval,
        };
        let handle = MonitorHandle {
            commands_tx,
            events,
            line_queue,
            record_queue,
            started_at: Instant::now(),
        };
        (service, handle)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            sample_interval_secs = self.sample_interval.as_secs_f64(),
            "monitor started"
        );

        let mut ticker = tokio::time::interval(self.sample_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                maybe_command = self.commands_rx.recv(), if commands_open => match maybe_command {
                    Some(MonitorCommand::Snapshot(reply)) => {
                        self.drain_pending_events();
                        if reply.send(self.counters).is_err() {
                            debug!("snapshot requester went away");
                        }
                    }
                    None => {
                        commands_open = false;
                        if !events_open {
                            break;
                        }
                    }
                },
                _ = ticker.tick() => {
                    let tps = self.sampler.record(self.counters.handle_line);
                    self.counters.tps = tps;
                    THROUGHPUT_LINES_PER_SECOND.set(tps);
                }
                maybe_event = self.events_rx.recv(), if events_open => match maybe_event {
                    Some(event) => self.apply(event),
                    None => {
                        debug!("event queue closed; serving final counters only");
                        events_open = false;
                        if !commands_open {
                            break;
                        }
                    }
                },
            }
        }

        info!(
            handle_line = self.counters.handle_line,
            err_num = self.counters.err_num,
            write_err_num = self.counters.write_err_num,
            "monitor stopped"
        );
    }

    fn drain_pending_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply(event);
        }
    }

    fn apply(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::LineHandled => {
                self.counters.handle_line += 1;
                LINES_HANDLED_TOTAL.inc();
            }
            LifecycleEvent::ParseError => {
                self.counters.err_num += 1;
                PARSE_ERRORS_TOTAL.inc();
            }
            LifecycleEvent::WriteFailed => {
                self.counters.write_err_num += 1;
                WRITE_FAILURES_TOTAL.inc();
            }
            LifecycleEvent::SinkRestarted => {
                self.counters.sink_restarts += 1;
                SINK_WORKER_RESTARTS_TOTAL.inc();
            }
        }
    }
}

impl MonitorHandle {
    /// Builds a fresh snapshot. Counters are copied out of the monitor task; nothing is mutated.
    pub async fn snapshot(&self) -> Result<MetricsSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands_tx
            .send(MonitorCommand::Snapshot(reply_tx))
            .await
            .map_err(|_| anyhow!("monitor is not running"))?;
        let counters = reply_rx
            .await
            .context("monitor dropped snapshot request")?;

        Ok(MetricsSnapshot {
            handle_line: counters.handle_line,
            tps: counters.tps,
            read_chan_len: self.line_queue.len(),
            write_chan_len: self.record_queue.len(),
            run_time: format_run_time(self.started_at.elapsed()),
            err_num: counters.err_num,
            read_chan_cap: self.line_queue.capacity(),
            write_chan_cap: self.record_queue.capacity(),
            events_dropped: self.events.dropped(),
            write_err_num: counters.write_err_num,
            sink_restarts: counters.sink_restarts,
        })
    }

    pub fn line_queue(&self) -> &QueueProbe {
        &self.line_queue
    }

    pub fn record_queue(&self) -> &QueueProbe {
        &self.record_queue
    }

    pub fn events_dropped(&self) -> u64 {
        self.events.dropped()
    }
}

/// Renders an elapsed duration the way Go's `time.Duration` prints: `1h2m3.5s`, `1m5s`,
/// `2.5s`, and `500ms` / `1.5µs` / `750ns` below one second.
pub fn format_run_time(elapsed: Duration) -> String {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000));
    }

    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3_600;
    let minutes = (total_secs / 60) % 60;
    let seconds = u128::from(total_secs % 60) * 1_000_000_000 + u128::from(elapsed.subsec_nanos());

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{}s", decimal(seconds, 1_000_000_000));
    out
}

/// `value / scale` with the remainder as trailing-zero-free decimal digits.
fn decimal(value: u128, scale: u128) -> String {
    let whole = value / scale;
    let fraction = value % scale;
    if fraction == 0 {
        return whole.to_string();
    }
    let width = scale.ilog10() as usize;
    let digits = format!("{fraction:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probes(capacity: usize) -> (flume::Sender<u8>, flume::Sender<u8>, QueueProbe, QueueProbe) {
        let (line_tx, line_rx) = flume::bounded(capacity);
        let (record_tx, record_rx) = flume::bounded(capacity);
        (
            line_tx,
            record_tx,
            QueueProbe::new(line_rx),
            QueueProbe::new(record_rx),
        )
    }

    #[test]
    fn sampler_reports_zero_until_two_samples() {
        let mut sampler = ThroughputSampler::new(Duration::from_secs(5));
        assert_eq!(sampler.record(40), 0.0);
        assert_eq!(sampler.record(90), 10.0);
        assert_eq!(sampler.tps(), 10.0);
    }

    #[test]
    fn sampler_converges_on_steady_rate() {
        let rate = 37u64;
        let interval = Duration::from_secs(5);
        let mut sampler = ThroughputSampler::new(interval);
        let mut handled = 0;
        for _ in 0..6 {
            sampler.record(handled);
            handled += rate * interval.as_secs();
        }
        assert!((sampler.tps() - rate as f64).abs() < 1e-9);
    }

    #[test]
    fn sampler_never_goes_negative() {
        let mut sampler = ThroughputSampler::new(Duration::from_secs(5));
        sampler.record(100);
        assert_eq!(sampler.record(50), 0.0);
    }

    #[test]
    fn formats_run_time_like_go_durations() {
        assert_eq!(format_run_time(Duration::ZERO), "0s");
        assert_eq!(format_run_time(Duration::from_millis(2_500)), "2.5s");
        assert_eq!(format_run_time(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_run_time(Duration::from_millis(3_605_125)), "1h0m5.125s");
        assert_eq!(format_run_time(Duration::new(3, 123_456_789)), "3.123456789s");
        assert_eq!(format_run_time(Duration::from_secs(7_200)), "2h0m0s");
    }

    #[test]
    fn formats_sub_second_run_time_in_smaller_units() {
        assert_eq!(format_run_time(Duration::from_millis(500)), "500ms");
        assert_eq!(format_run_time(Duration::from_micros(1_500)), "1.5ms");
        assert_eq!(format_run_time(Duration::from_micros(2)), "2µs");
        assert_eq!(format_run_time(Duration::from_nanos(2_250)), "2.25µs");
        assert_eq!(format_run_time(Duration::from_nanos(750)), "750ns");
    }

    #[test]
    fn full_event_queue_drops_and_counts() {
        let (events, _rx) = event_channel(2);
        for _ in 0..5 {
            events.emit(LifecycleEvent::LineHandled);
        }
        assert_eq!(events.dropped(), 3);
    }

    #[tokio::test]
    async fn snapshot_reflects_emitted_events() {
        let (events, events_rx) = event_channel(64);
        let (line_tx, _record_tx, line_probe, record_probe) = probes(4);
        let (service, handle) = MonitorService::new(
            events_rx,
            events.clone(),
            line_probe,
            record_probe,
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(service.run(cancel.clone()));

        for _ in 0..3 {
            events.emit(LifecycleEvent::LineHandled);
        }
        events.emit(LifecycleEvent::ParseError);
        events.emit(LifecycleEvent::WriteFailed);
        line_tx.send_async(1).await.unwrap();
        line_tx.send_async(2).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.handle_line, 3);
        assert_eq!(snapshot.err_num, 1);
        assert_eq!(snapshot.write_err_num, 1);
        assert_eq!(snapshot.read_chan_len, 2);
        assert_eq!(snapshot.read_chan_cap, 4);
        assert_eq!(snapshot.write_chan_len, 0);
        assert_eq!(snapshot.events_dropped, 0);
        assert!(snapshot.read_chan_len <= snapshot.read_chan_cap);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_updates_throughput() {
        let (events, events_rx) = event_channel(1024);
        let (_line_tx, _record_tx, line_probe, record_probe) = probes(1);
        let interval = Duration::from_secs(5);
        let (service, handle) =
            MonitorService::new(events_rx, events.clone(), line_probe, record_probe, interval);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(service.run(cancel.clone()));

        // The first tick fires immediately, so the zero sample is taken while serving this.
        assert_eq!(handle.snapshot().await.unwrap().handle_line, 0);
        for _ in 0..50 {
            events.emit(LifecycleEvent::LineHandled);
        }
        // Snapshot drains the queue so the counter is current before the next tick.
        assert_eq!(handle.snapshot().await.unwrap().handle_line, 50);

        tokio::time::sleep(interval + Duration::from_millis(10)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.tps, 10.0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn snapshot_serializes_with_wire_names() {
        let snapshot = MetricsSnapshot {
            handle_line: 1,
            tps: 0.5,
            read_chan_len: 2,
            write_chan_len: 3,
            run_time: "4s".to_string(),
            err_num: 5,
            read_chan_cap: 200,
            write_chan_cap: 200,
            events_dropped: 0,
            write_err_num: 0,
            sink_restarts: 0,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        for key in [
            "handleLine",
            "tps",
            "readChanLen",
            "writeChanLen",
            "runTime",
            "errNum",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}
