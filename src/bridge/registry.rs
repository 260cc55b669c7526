//! # Bridge Registry
//!
//! Process-wide owner of every live bridge session. The registry is the only
//! component allowed to create and tear down sessions; provider links hold a
//! session reference but always request teardown through the registry, which
//! guarantees each session's queues are closed exactly once.
//!
//! ## Ownership:
//! - Registry → `session_id → BridgeSession` map under one read-mostly lock
//! - Registry → root cancellation token; each session gets a child token
//! - `bind_link` spawns the two per-call routing tasks that move audio
//!   between a link's shock-absorber queues and the session queue pair,
//!   converting formats on the way
//!
//! Lock discipline: the map lock is never held across an `.await` or any
//! I/O; sessions are cloned out as `Arc`s first.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::codec;
use crate::bridge::session::{AudioFrame, BridgeSession};
use crate::config::{AudioConfig, BridgeConfig};
use crate::error::BridgeError;

/// Queue endpoints a provider link hands to the registry when it binds.
///
/// The link keeps the other half of each channel: it feeds `audio_in` from
/// inbound media events and drains `audio_out` onto the wire.
pub struct LinkEndpoints {
    /// Read side of the link's inbound shock absorber.
    pub audio_in: mpsc::Receiver<AudioFrame>,
    /// Write side of the link's outbound shock absorber.
    pub audio_out: mpsc::Sender<AudioFrame>,
    /// The link's cancellation scope (child of the session scope).
    pub scope: CancellationToken,
    /// Provider call identifier, if already known at upgrade time.
    pub call_sid: Option<String>,
}

/// Process-wide mapping from session identifier to bridge session.
pub struct BridgeRegistry {
    sessions: RwLock<HashMap<String, Arc<BridgeSession>>>,
    bridge_cfg: BridgeConfig,
    audio_cfg: AudioConfig,
    root: CancellationToken,
}

impl BridgeRegistry {
    pub fn new(bridge_cfg: BridgeConfig, audio_cfg: AudioConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bridge_cfg,
            audio_cfg,
            root: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.bridge_cfg
    }

    /// Create a new session. Fails if the identifier is already present.
    pub fn create(&self, session_id: &str) -> Result<Arc<BridgeSession>, BridgeError> {
        let mut sessions = self.sessions.write().unwrap();

        if sessions.contains_key(session_id) {
            return Err(BridgeError::DuplicateSession(session_id.to_string()));
        }

        let session = Arc::new(BridgeSession::new(
            session_id.to_string(),
            &self.bridge_cfg,
            &self.audio_cfg,
            self.root.child_token(),
        ));
        sessions.insert(session_id.to_string(), session.clone());

        info!(session_id, "created bridge session");
        Ok(session)
    }

    /// Look up a session by identifier.
    pub fn get(&self, session_id: &str) -> Option<Arc<BridgeSession>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Resolve a session from the provider's call identifier. Used by the
    /// call-status webhook, which only knows the CallSid.
    pub fn find_by_call_sid(&self, call_sid: &str) -> Option<Arc<BridgeSession>> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .values()
            .find(|s| s.call_sid().as_deref() == Some(call_sid))
            .cloned()
    }

    /// Bind a provider link to an existing session and start the two audio
    /// routing tasks. Fails if the session is unknown or already has a
    /// bound link.
    pub fn bind_link(
        &self,
        session_id: &str,
        endpoints: LinkEndpoints,
    ) -> Result<(), BridgeError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;

        if let Some(call_sid) = endpoints.call_sid {
            session.set_call_sid(call_sid);
        }

        let outbound_rx = session.take_pipeline_to_phone_rx()?;
        session.mark_streaming_started();

        let drop_grace = Duration::from_millis(self.bridge_cfg.drop_grace_ms);

        tokio::spawn(route_phone_to_pipeline(
            session.clone(),
            endpoints.audio_in,
            endpoints.scope.clone(),
        ));
        tokio::spawn(route_pipeline_to_phone(
            session.clone(),
            outbound_rx,
            endpoints.audio_out,
            endpoints.scope,
            drop_grace,
        ));

        info!(session_id, "bound provider link to session");
        Ok(())
    }

    /// Tear down a session: cancel its scope, close both queues (exactly
    /// once), and remove it from the map. Safe to call repeatedly; only the
    /// first call does anything.
    pub fn close(&self, session_id: &str) -> bool {
        let session = self.sessions.write().unwrap().remove(session_id);

        match session {
            Some(session) => {
                if session.close() {
                    info!(session_id, "closed bridge session");
                }
                true
            }
            None => false,
        }
    }

    /// Cancel the root scope and close every remaining session.
    pub fn shutdown(&self) {
        self.root.cancel();

        let drained: Vec<Arc<BridgeSession>> =
            self.sessions.write().unwrap().drain().map(|(_, s)| s).collect();

        for session in &drained {
            session.close();
        }

        info!(sessions = drained.len(), "bridge registry shut down");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }
}

/// Move frames from the link's inbound queue into the session's
/// phone → pipeline queue, converting telephony audio to the pipeline
/// format. Exits when either scope cancels or either queue closes.
async fn route_phone_to_pipeline(
    session: Arc<BridgeSession>,
    mut audio_in: mpsc::Receiver<AudioFrame>,
    link_scope: CancellationToken,
) {
    let session_id = session.session_id().to_string();
    info!(%session_id, "starting phone → AI audio routing");

    let input_format = session.input_format();
    let pipeline_format = session.pipeline_format();

    loop {
        tokio::select! {
            _ = session.scope().cancelled() => break,
            _ = link_scope.cancelled() => break,
            chunk = audio_in.recv() => {
                let Some(chunk) = chunk else { break };
                if chunk.is_empty() {
                    continue;
                }

                let start = Instant::now();

                let converted = match codec::convert(&chunk, &input_format, &pipeline_format) {
                    Ok(converted) => converted,
                    Err(err) => {
                        warn!(%session_id, %err, "inbound audio conversion error");
                        continue;
                    }
                };

                match session.enqueue_from_phone(converted).await {
                    Ok(true) => {
                        session
                            .metrics()
                            .update_latency(start.elapsed().as_micros() as u64);
                    }
                    Ok(false) => {
                        debug!(%session_id, "phone → AI queue full, dropped frame");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    info!(%session_id, "stopped phone → AI audio routing");
}

/// Move frames from the session's pipeline → phone queue into the link's
/// outbound queue, converting pipeline audio back to the telephony format.
async fn route_pipeline_to_phone(
    session: Arc<BridgeSession>,
    mut outbound_rx: mpsc::Receiver<AudioFrame>,
    audio_out: mpsc::Sender<AudioFrame>,
    link_scope: CancellationToken,
    drop_grace: Duration,
) {
    let session_id = session.session_id().to_string();
    info!(%session_id, "starting AI → phone audio routing");

    let pipeline_format = session.pipeline_format();
    let output_format = session.output_format();

    loop {
        tokio::select! {
            _ = session.scope().cancelled() => break,
            _ = link_scope.cancelled() => break,
            chunk = outbound_rx.recv() => {
                let Some(chunk) = chunk else { break };
                if chunk.is_empty() {
                    continue;
                }

                let start = Instant::now();

                let converted = match codec::convert(&chunk, &pipeline_format, &output_format) {
                    Ok(converted) => converted,
                    Err(err) => {
                        warn!(%session_id, %err, "outbound audio conversion error");
                        continue;
                    }
                };

                let bytes = converted.len();
                match audio_out.send_timeout(converted, drop_grace).await {
                    Ok(()) => {
                        session.metrics().record_ai_to_phone_sent(bytes);
                        session
                            .metrics()
                            .update_latency(start.elapsed().as_micros() as u64);
                    }
                    Err(SendTimeoutError::Timeout(_)) => {
                        session.metrics().record_ai_to_phone_dropped();
                        debug!(%session_id, "AI → phone link queue full, dropped frame");
                    }
                    Err(SendTimeoutError::Closed(_)) => break,
                }
            }
        }
    }

    info!(%session_id, "stopped AI → phone audio routing");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tokio::time::timeout;

    fn make_registry() -> BridgeRegistry {
        let config = AppConfig::default();
        BridgeRegistry::new(config.bridge, config.audio)
    }

    fn make_endpoints(
        capacity: usize,
    ) -> (
        LinkEndpoints,
        mpsc::Sender<AudioFrame>,
        mpsc::Receiver<AudioFrame>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let endpoints = LinkEndpoints {
            audio_in: in_rx,
            audio_out: out_tx,
            scope: CancellationToken::new(),
            call_sid: Some("CA123".to_string()),
        };
        (endpoints, in_tx, out_rx)
    }

    #[tokio::test]
    async fn test_create_and_duplicate() {
        let registry = make_registry();
        assert!(registry.create("S1").is_ok());
        assert!(matches!(
            registry.create("S1"),
            Err(BridgeError::DuplicateSession(_))
        ));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.get("S1").is_some());
        assert!(registry.get("S2").is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_empties_map() {
        let registry = make_registry();
        registry.create("S1").unwrap();

        assert!(registry.close("S1"));
        assert!(!registry.close("S1"));
        assert!(!registry.close("S1"));

        assert!(registry.get("S1").is_none());
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_find_by_call_sid() {
        let registry = make_registry();
        let session = registry.create("S1").unwrap();
        session.set_call_sid("CA999".to_string());

        assert!(registry.find_by_call_sid("CA999").is_some());
        assert!(registry.find_by_call_sid("CA000").is_none());
    }

    #[tokio::test]
    async fn test_bind_link_requires_existing_session() {
        let registry = make_registry();
        let (endpoints, _in_tx, _out_rx) = make_endpoints(8);
        assert!(matches!(
            registry.bind_link("missing", endpoints),
            Err(BridgeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_link_rejects_second_link() {
        let registry = make_registry();
        registry.create("S1").unwrap();

        let (endpoints, _in_tx, _out_rx) = make_endpoints(8);
        registry.bind_link("S1", endpoints).unwrap();

        let (endpoints2, _in_tx2, _out_rx2) = make_endpoints(8);
        assert!(matches!(
            registry.bind_link("S1", endpoints2),
            Err(BridgeError::AlreadyBound(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_routing_converts_and_counts() {
        let registry = make_registry();
        let session = registry.create("S1").unwrap();
        let mut pipeline_rx = session.subscribe_phone_to_pipeline().unwrap();

        let (endpoints, in_tx, _out_rx) = make_endpoints(64);
        registry.bind_link("S1", endpoints).unwrap();
        assert!(session.is_streaming());
        assert_eq!(session.call_sid().as_deref(), Some("CA123"));

        // 50 telephony frames of 20ms each (160 μ-law bytes).
        for _ in 0..50 {
            in_tx.send(vec![0xFFu8; 160]).await.unwrap();
        }

        for _ in 0..50 {
            let frame = timeout(Duration::from_secs(1), pipeline_rx.recv())
                .await
                .expect("routing stalled")
                .expect("queue closed early");
            // μ-law 8kHz → PCM16 16kHz doubles samples and widens to 2 bytes.
            assert_eq!(frame.len(), 160 * 2 * 2);
        }

        let snap = session.metrics_snapshot();
        assert_eq!(snap.phone_to_ai_packets_sent, 50);
        assert_eq!(snap.dropped_packets, 0);
    }

    #[tokio::test]
    async fn test_outbound_routing_converts_back_to_mulaw() {
        let registry = make_registry();
        let session = registry.create("S1").unwrap();

        let (endpoints, _in_tx, mut out_rx) = make_endpoints(64);
        registry.bind_link("S1", endpoints).unwrap();

        // One 20ms pipeline frame: 320 samples of PCM16 at 16kHz.
        let publish = session.publish_pipeline_to_phone().unwrap();
        publish.send(vec![0u8; 320 * 2]).await.unwrap();

        let frame = timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("routing stalled")
            .expect("link queue closed early");
        assert_eq!(frame.len(), 160);

        let snap = session.metrics_snapshot();
        assert_eq!(snap.ai_to_phone_packets_sent, 1);
        assert_eq!(snap.bytes_sent, 160);
    }

    #[tokio::test]
    async fn test_close_stops_routers() {
        let registry = make_registry();
        let session = registry.create("S1").unwrap();

        let (endpoints, _in_tx, mut out_rx) = make_endpoints(8);
        registry.bind_link("S1", endpoints).unwrap();

        registry.close("S1");
        assert!(session.scope().is_cancelled());

        // The outbound router drops its sender when it exits.
        let drained = timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("router did not exit");
        assert!(drained.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_session() {
        let registry = make_registry();
        let s1 = registry.create("S1").unwrap();
        let s2 = registry.create("S2").unwrap();

        registry.shutdown();

        assert_eq!(registry.session_count(), 0);
        assert!(!s1.is_active());
        assert!(!s2.is_active());
        assert!(s1.scope().is_cancelled());
        assert!(s2.scope().is_cancelled());
    }
}
