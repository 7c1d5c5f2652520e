//! The single consumer of the ingestion queue.
//!
//! Every tick the pipeline walks one cycle of its state machine:
//!
//! ```text
//! Waiting ──collect──► Processing(batch) ──process──► Updating ──update──► Waiting
//! ```
//!
//! `collect` drains the queue without waiting, `process` decodes and buffers each entry and
//! writes it to the store, `update` serves clear/export requests and publishes a copied
//! [`DashboardView`]. The pipeline is the only writer of buffers, readouts and storage, so
//! none of that state needs a lock.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use statum::{machine, state};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::{SeriesSnapshot, TimeSeries};
use super::decoder::{decode, DecodedPayload, Field, Reading};
use super::{Metric, Readouts};
use crate::config::PipelineSettings;
use crate::error::{PipelineError, StorageError};
use crate::mqtt::message_manager::{IngestEntry, QueueConsumer, RawMessage, SystemEvent};
use crate::mqtt::mqtt_handler::ConnectionState;
use crate::persistence::export::export_csv;
use crate::persistence::store::ReadingStore;
use crate::persistence::{ReadingSink, SinkStats};

const REQUEST_CAPACITY: usize = 16;

/// Entries taken from the queue in one cycle.
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub entries: Vec<IngestEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub messages: u64,
    pub readings: u64,
    pub decode_failures: u64,
    /// Queue entries overwritten before they were consumed
    pub dropped_entries: u64,
    pub storage: SinkStats,
}

/// Copy of everything a presenter needs, published after each cycle that changed it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardView {
    pub link: ConnectionState,
    pub readouts: Readouts,
    pub series: SeriesSnapshot,
    pub log: Vec<String>,
    pub stats: PipelineStats,
    pub taken_at: Option<DateTime<Local>>,
}

/// Requests served by the consumer between queue drains.
#[derive(Debug)]
pub enum PipelineRequest {
    Clear {
        response_tx: oneshot::Sender<()>,
    },
    Export {
        path: PathBuf,
        response_tx: oneshot::Sender<Result<usize, StorageError>>,
    },
}

#[state]
#[derive(Debug, Clone)]
pub enum PipelineState {
    Waiting,
    Processing(IngestBatch),
    Updating,
}

#[machine]
#[derive(Debug)]
pub struct Pipeline<S: PipelineState> {
    queue: QueueConsumer,
    requests: mpsc::Receiver<PipelineRequest>,
    settings: PipelineSettings,
    series: TimeSeries,
    readouts: Readouts,
    link: ConnectionState,
    log_tail: VecDeque<String>,
    sink: ReadingSink,
    view_sender: watch::Sender<DashboardView>,
    stats: PipelineStats,
    view_dirty: bool,
    queue_closed: bool,
}

// Available in every state
impl<S: PipelineState> Pipeline<S> {
    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.view_sender.subscribe()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn series(&self) -> &TimeSeries {
        &self.series
    }

    pub fn readouts(&self) -> &Readouts {
        &self.readouts
    }

    pub fn link(&self) -> ConnectionState {
        self.link
    }

    pub fn log_tail(&self) -> impl Iterator<Item = &String> {
        self.log_tail.iter()
    }

    pub fn store(&self) -> &ReadingStore {
        self.sink.store()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            storage: self.sink.stats(),
            ..self.stats
        }
    }

    fn push_log(&mut self, line: String) {
        if self.settings.log_tail_len == 0 {
            return;
        }
        while self.log_tail.len() >= self.settings.log_tail_len {
            self.log_tail.pop_front();
        }
        self.log_tail.push_back(line);
    }

    fn clear_data(&mut self) {
        self.series.clear();
        self.readouts = Readouts::default();
        self.log_tail.clear();
        self.view_dirty = true;
        info!("Cleared buffers, readouts and log");
    }
}

impl Pipeline<Waiting> {
    pub fn create(
        queue: QueueConsumer,
        requests: mpsc::Receiver<PipelineRequest>,
        settings: PipelineSettings,
        sink: ReadingSink,
    ) -> Self {
        info!("Creating pipeline with settings: {:?}", settings);
        let series = TimeSeries::new(settings.buffer_capacity);
        let log_tail = VecDeque::with_capacity(settings.log_tail_len);
        let (view_sender, _) = watch::channel(DashboardView::default());

        Self::new(
            queue,
            requests,
            settings,
            series,
            Readouts::default(),
            ConnectionState::default(),
            log_tail,
            sink,
            view_sender,
            PipelineStats::default(),
            false,
            false,
        )
    }

    /// Takes everything currently queued; never waits.
    pub fn collect(mut self) -> Pipeline<Processing> {
        let drain = self.queue.drain();

        if drain.dropped > 0 {
            warn!(
                "Consumer fell behind, {} queued entries were dropped",
                drain.dropped
            );
            self.stats.dropped_entries += drain.dropped;
            self.view_dirty = true;
        }
        if drain.closed && !self.queue_closed {
            debug!("Ingestion queue closed, no more producers");
            self.queue_closed = true;
        }
        if !drain.entries.is_empty() {
            debug!("Collected batch of {} entries", drain.entries.len());
        }

        self.transition_with(IngestBatch {
            entries: drain.entries,
        })
    }
}

impl Pipeline<Processing> {
    /// Applies the batch in dequeue order.
    pub async fn process(mut self) -> Pipeline<Updating> {
        let batch = match self.get_state_data() {
            Some(batch) => batch.clone(),
            None => {
                warn!("No batch found in state data, this should not happen");
                IngestBatch::default()
            }
        };

        for entry in batch.entries {
            match entry {
                IngestEntry::System { event, at } => self.apply_system_event(event, at),
                IngestEntry::Data(message) => self.ingest_message(message).await,
            }
        }

        self.transition()
    }

    fn apply_system_event(&mut self, event: SystemEvent, at: DateTime<Local>) {
        let source = match event {
            SystemEvent::Log(_) => "MQTT-LOG",
            _ => "SYS",
        };
        self.push_log(format!("[{}] {}: {}", at.format("%H:%M:%S"), source, event));

        let link = match &event {
            SystemEvent::ConnectIssued { .. } => Some(ConnectionState::Connecting),
            SystemEvent::Connected => Some(ConnectionState::Connected),
            SystemEvent::ConnectFailed { .. } => Some(ConnectionState::Failed),
            SystemEvent::Disconnected => Some(ConnectionState::Disconnected),
            SystemEvent::Subscribed { .. }
            | SystemEvent::SubscribeFailed { .. }
            | SystemEvent::Log(_) => None,
        };
        match &event {
            SystemEvent::ConnectFailed { .. } | SystemEvent::SubscribeFailed { .. } => {
                warn!("{}", event)
            }
            SystemEvent::Log(_) => debug!("{}", event),
            _ => info!("{}", event),
        }
        if let Some(link) = link {
            self.link = link;
        }
        self.view_dirty = true;
    }

    async fn ingest_message(&mut self, message: RawMessage) {
        self.stats.messages += 1;
        self.push_log(message.render());

        let decoded = match decode(&message.payload) {
            Ok(decoded) => {
                if decoded.sanitized {
                    debug!("Rewrote nonstandard numbers in payload from {}", message.topic);
                }
                Some(decoded)
            }
            Err(e) => {
                warn!("Dropping undecodable payload on {}: {}", message.topic, e);
                self.stats.decode_failures += 1;
                None
            }
        };

        if let Some(decoded) = &decoded {
            self.apply_decoded(decoded, message.received_at);
        }
        self.sink.persist(&message, decoded.as_ref()).await;
        self.view_dirty = true;
    }

    fn apply_decoded(&mut self, decoded: &DecodedPayload, timestamp: DateTime<Local>) {
        for metric in Metric::ALL {
            match decoded.field(metric) {
                Field::Absent => {}
                Field::Invalid => {
                    debug!("Field {} present but not a finite number", metric);
                    self.readouts.set(metric, None);
                }
                Field::Value(value) => {
                    debug!("{} = {}", metric, value);
                    self.readouts.set(metric, Some(value));
                    self.series.append(&Reading {
                        timestamp,
                        metric,
                        value,
                    });
                    self.stats.readings += 1;
                }
            }
        }
    }
}

impl Pipeline<Updating> {
    /// Serves pending requests and publishes the view if anything changed.
    pub async fn update(mut self) -> Pipeline<Waiting> {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                PipelineRequest::Clear { response_tx } => {
                    self.clear_data();
                    if response_tx.send(()).is_err() {
                        debug!("Clear requester went away");
                    }
                }
                PipelineRequest::Export { path, response_tx } => {
                    let result = export_csv(self.sink.store(), &path).await;
                    if let Err(e) = &result {
                        error!("Export to {} failed: {}", path.display(), e);
                    }
                    if response_tx.send(result).is_err() {
                        debug!("Export requester went away");
                    }
                }
            }
        }

        if self.view_dirty {
            let now = Local::now();
            let view = DashboardView {
                link: self.link,
                readouts: self.readouts,
                series: self.series.snapshot(now),
                log: self.log_tail.iter().cloned().collect(),
                stats: self.stats(),
                taken_at: Some(now),
            };
            self.view_sender.send_replace(view);
            self.view_dirty = false;
        }

        self.transition()
    }
}

/// One full tick: drain, apply, serve requests, publish.
pub async fn run_cycle(pipeline: Pipeline<Waiting>) -> Pipeline<Waiting> {
    pipeline.collect().process().await.update().await
}

/// Handle to a pipeline running on its own task.
#[derive(Debug)]
pub struct PipelineHandle {
    requests: mpsc::Sender<PipelineRequest>,
    view: watch::Receiver<DashboardView>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn spawn(queue: QueueConsumer, settings: PipelineSettings, sink: ReadingSink) -> Self {
        let (requests, requests_rx) = mpsc::channel(REQUEST_CAPACITY);
        let pipeline = Pipeline::create(queue, requests_rx, settings, sink);
        let view = pipeline.subscribe();
        let cancel = CancellationToken::new();

        info!("Spawning pipeline task");
        let task = tokio::spawn(run_pipeline_loop(pipeline, cancel.clone()));

        Self {
            requests,
            view,
            cancel,
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.view.clone()
    }

    pub fn view(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    /// Empties buffers, readouts and the log tail. Stored records are kept.
    pub async fn clear(&self) -> Result<(), PipelineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests
            .send(PipelineRequest::Clear { response_tx })
            .await
            .map_err(|_| PipelineError::Closed)?;
        response_rx.await.map_err(|_| PipelineError::NoResponse)
    }

    /// Exports the store once every entry queued so far has been processed.
    pub async fn export(&self, path: impl Into<PathBuf>) -> Result<usize, PipelineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests
            .send(PipelineRequest::Export {
                path: path.into(),
                response_tx,
            })
            .await
            .map_err(|_| PipelineError::Closed)?;
        Ok(response_rx.await.map_err(|_| PipelineError::NoResponse)??)
    }

    /// Stops the loop after one last drain of the queue.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Pipeline task ended abnormally: {}", e);
        }
    }
}

async fn run_pipeline_loop(mut pipeline: Pipeline<Waiting>, cancel: CancellationToken) {
    let period = Duration::from_millis(pipeline.settings().poll_interval_ms.max(1));
    info!("Starting pipeline loop with {}ms interval", period.as_millis());

    let mut interval_timer = tokio::time::interval(period);
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cycles: u64 = 0;
    let mut last_stats_time = Local::now();
    let mut last_stats = pipeline.stats();
    let stats_interval = chrono::Duration::seconds(30);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Pipeline stopping, draining remaining entries");
                pipeline = run_cycle(pipeline).await;
                break;
            }
            _ = interval_timer.tick() => {
                pipeline = run_cycle(pipeline).await;
                cycles += 1;
            }
        }

        let now = Local::now();
        if now - last_stats_time > stats_interval {
            let stats = pipeline.stats();
            let elapsed_seconds = (now - last_stats_time).num_seconds().max(1);
            info!(
                "Pipeline stats: {} cycles, {} messages, {} readings in {} seconds ({} dropped, {} store failures total)",
                cycles,
                stats.messages - last_stats.messages,
                stats.readings - last_stats.readings,
                elapsed_seconds,
                stats.dropped_entries,
                stats.storage.failed
            );
            cycles = 0;
            last_stats = stats;
            last_stats_time = now;
        }
    }

    pipeline.store().close().await;
    info!("Pipeline stopped");
}
