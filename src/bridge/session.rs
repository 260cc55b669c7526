//! # Bridge Session (Queue Pair)
//!
//! One `BridgeSession` exists per live call. It owns the two bounded audio
//! queues (`phone → pipeline` and `pipeline → phone`), the format
//! descriptors for both sides, the per-session metrics, and the lifecycle
//! flags and timestamps.
//!
//! ## Lifecycle:
//! 1. **Created**: registry allocates the pair, `active = true`
//! 2. **Streaming**: a provider link is bound and the routers are running
//! 3. **Closed**: registry teardown; queues closed exactly once, scope
//!    cancelled, no further enqueue succeeds
//!
//! ## Backpressure:
//! Enqueues wait at most the configured drop grace (10ms by default) and
//! then drop the frame, counting it. A slow AI consumer can never stall the
//! phone call; losing one 20ms frame is cheaper than accumulating delay.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

use crate::audio::format::AudioFormat;
use crate::bridge::metrics::{BridgeMetrics, MetricsSnapshot};
use crate::config::{AudioConfig, BridgeConfig};
use crate::error::BridgeError;

/// An audio frame in flight: one codec-unit-aligned slice of bytes.
pub type AudioFrame = Vec<u8>;

/// Queue endpoints, handed out once each and dropped together on close.
#[derive(Debug, Default)]
struct QueueHandles {
    phone_to_pipeline_tx: Option<mpsc::Sender<AudioFrame>>,
    phone_to_pipeline_rx: Option<mpsc::Receiver<AudioFrame>>,
    pipeline_to_phone_tx: Option<mpsc::Sender<AudioFrame>>,
    pipeline_to_phone_rx: Option<mpsc::Receiver<AudioFrame>>,
}

/// Bridge state for a single call.
#[derive(Debug)]
pub struct BridgeSession {
    session_id: String,
    call_sid: RwLock<Option<String>>,

    queues: Mutex<QueueHandles>,
    drop_grace: Duration,

    input_format: AudioFormat,
    output_format: AudioFormat,
    pipeline_format: AudioFormat,

    metrics: BridgeMetrics,

    created_at: DateTime<Utc>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    ended_at: RwLock<Option<DateTime<Utc>>>,

    active: RwLock<bool>,
    streaming: RwLock<bool>,

    scope: CancellationToken,
}

/// Immutable status summary returned by the bridge status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub session_id: String,
    pub call_sid: Option<String>,
    pub active: bool,
    pub streaming: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input_format: AudioFormat,
    pub output_format: AudioFormat,
}

impl BridgeSession {
    /// Create a session with freshly allocated queues.
    ///
    /// `scope` must be a child of the registry's root token so that a
    /// registry shutdown cascades into every session.
    pub(crate) fn new(
        session_id: String,
        bridge_cfg: &BridgeConfig,
        audio_cfg: &AudioConfig,
        scope: CancellationToken,
    ) -> Self {
        let (in_tx, in_rx) = mpsc::channel(bridge_cfg.queue_capacity);
        let (out_tx, out_rx) = mpsc::channel(bridge_cfg.queue_capacity);

        Self {
            session_id,
            call_sid: RwLock::new(None),
            queues: Mutex::new(QueueHandles {
                phone_to_pipeline_tx: Some(in_tx),
                phone_to_pipeline_rx: Some(in_rx),
                pipeline_to_phone_tx: Some(out_tx),
                pipeline_to_phone_rx: Some(out_rx),
            }),
            drop_grace: Duration::from_millis(bridge_cfg.drop_grace_ms),
            input_format: audio_cfg.telephony_format,
            output_format: audio_cfg.telephony_format,
            pipeline_format: audio_cfg.pipeline_format,
            metrics: BridgeMetrics::new(),
            created_at: Utc::now(),
            started_at: RwLock::new(None),
            ended_at: RwLock::new(None),
            active: RwLock::new(true),
            streaming: RwLock::new(false),
            scope,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn call_sid(&self) -> Option<String> {
        self.call_sid.read().unwrap().clone()
    }

    pub fn set_call_sid(&self, call_sid: String) {
        if !call_sid.is_empty() {
            *self.call_sid.write().unwrap() = Some(call_sid);
        }
    }

    /// Cancellation scope for this session; links and routers derive child
    /// tokens and select on it.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn input_format(&self) -> AudioFormat {
        self.input_format
    }

    pub fn output_format(&self) -> AudioFormat {
        self.output_format
    }

    pub fn pipeline_format(&self) -> AudioFormat {
        self.pipeline_format
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    pub fn is_active(&self) -> bool {
        *self.active.read().unwrap()
    }

    pub fn is_streaming(&self) -> bool {
        *self.streaming.read().unwrap()
    }

    /// Flip into the streaming state; the first call stamps `started_at`.
    pub(crate) fn mark_streaming_started(&self) {
        *self.streaming.write().unwrap() = true;
        let mut started_at = self.started_at.write().unwrap();
        if started_at.is_none() {
            *started_at = Some(Utc::now());
        }
    }

    /// Enqueue a frame on the phone → pipeline queue.
    ///
    /// ## Returns:
    /// - `Ok(true)`: delivered
    /// - `Ok(false)`: dropped after the grace deadline (counted)
    /// - `Err(Closed)`: session already torn down
    pub async fn enqueue_from_phone(&self, frame: AudioFrame) -> Result<bool, BridgeError> {
        let tx = {
            let queues = self.queues.lock().unwrap();
            match &queues.phone_to_pipeline_tx {
                Some(tx) => tx.clone(),
                None => return Err(BridgeError::Closed(self.session_id.clone())),
            }
        };

        let bytes = frame.len();
        match tx.send_timeout(frame, self.drop_grace).await {
            Ok(()) => {
                self.metrics.record_phone_to_ai_sent(bytes);
                Ok(true)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.metrics.record_phone_to_ai_dropped();
                Ok(false)
            }
            Err(SendTimeoutError::Closed(_)) => Err(BridgeError::Closed(self.session_id.clone())),
        }
    }

    /// Enqueue a frame on the pipeline → phone queue. Same drop semantics
    /// as [`enqueue_from_phone`](Self::enqueue_from_phone).
    ///
    /// Sent-packet accounting for this direction happens downstream, when
    /// the outbound router delivers the converted frame to the link; a frame
    /// counted here as dropped never reaches the router.
    pub async fn enqueue_to_phone(&self, frame: AudioFrame) -> Result<bool, BridgeError> {
        let tx = {
            let queues = self.queues.lock().unwrap();
            match &queues.pipeline_to_phone_tx {
                Some(tx) => tx.clone(),
                None => return Err(BridgeError::Closed(self.session_id.clone())),
            }
        };

        match tx.send_timeout(frame, self.drop_grace).await {
            Ok(()) => Ok(true),
            Err(SendTimeoutError::Timeout(_)) => {
                self.metrics.record_ai_to_phone_dropped();
                Ok(false)
            }
            Err(SendTimeoutError::Closed(_)) => Err(BridgeError::Closed(self.session_id.clone())),
        }
    }

    /// Hand out the phone → pipeline read side. The AI pipeline calls this
    /// once; the receiver sees end-of-stream when the session closes.
    pub fn subscribe_phone_to_pipeline(&self) -> Result<mpsc::Receiver<AudioFrame>, BridgeError> {
        self.queues
            .lock()
            .unwrap()
            .phone_to_pipeline_rx
            .take()
            .ok_or_else(|| BridgeError::Closed(self.session_id.clone()))
    }

    /// Hand out a pipeline → phone write side for the AI pipeline.
    pub fn publish_pipeline_to_phone(&self) -> Result<mpsc::Sender<AudioFrame>, BridgeError> {
        let queues = self.queues.lock().unwrap();
        queues
            .pipeline_to_phone_tx
            .clone()
            .ok_or_else(|| BridgeError::Closed(self.session_id.clone()))
    }

    /// Take the pipeline → phone read side for the outbound router.
    pub(crate) fn take_pipeline_to_phone_rx(
        &self,
    ) -> Result<mpsc::Receiver<AudioFrame>, BridgeError> {
        self.queues
            .lock()
            .unwrap()
            .pipeline_to_phone_rx
            .take()
            .ok_or_else(|| BridgeError::AlreadyBound(self.session_id.clone()))
    }

    /// Snapshot of the per-session metrics.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Immutable status summary.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.session_id.clone(),
            session_id: self.session_id.clone(),
            call_sid: self.call_sid(),
            active: self.is_active(),
            streaming: self.is_streaming(),
            created_at: self.created_at,
            started_at: *self.started_at.read().unwrap(),
            ended_at: *self.ended_at.read().unwrap(),
            input_format: self.input_format,
            output_format: self.output_format,
        }
    }

    /// Tear the session down. Only the registry calls this, and the `active`
    /// flag guarantees the queues are closed exactly once.
    ///
    /// Returns `false` if the session was already closed.
    pub(crate) fn close(&self) -> bool {
        {
            let mut active = self.active.write().unwrap();
            if !*active {
                return false;
            }
            *active = false;
        }

        *self.streaming.write().unwrap() = false;
        *self.ended_at.write().unwrap() = Some(Utc::now());

        self.scope.cancel();

        // Dropping every retained endpoint closes the channels; readers that
        // already subscribed observe end-of-stream instead of an error.
        let mut queues = self.queues.lock().unwrap();
        queues.phone_to_pipeline_tx = None;
        queues.phone_to_pipeline_rx = None;
        queues.pipeline_to_phone_tx = None;
        queues.pipeline_to_phone_rx = None;

        true
    }
}
