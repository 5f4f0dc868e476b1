//! Engine orchestrator: wires the codecs, store, reassembler, sync engine,
//! and TX scheduler together and drives the three cooperative loops
//! (receive, transmit, housekeeping).
//!
//! External code talks to the engine through [`Engine::submit_message`], the
//! query methods, and the broadcast event stream. The engine owns the store
//! writer; every durable mutation funnels through its `db` mutex.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rfmp_net::{spawn_tnc, CarrierSense, TncCommand, TncConfig, TncNotification};
use rfmp_shared::ax25::UiFrame;
use rfmp_shared::constants::{DEFAULT_DESTINATION, MAX_AUTHOR_LEN, MAX_BODY_LEN};
use rfmp_shared::frames::{validate_channel, Frame, MsgFrame};
use rfmp_shared::types::{Callsign, MessageId, Priority};
use rfmp_shared::FramingError;
use rfmp_store::{
    ChannelInfo, Database, FragmentRow, InsertOutcome, NodeInfo, StoredMessage, TxPurpose,
};

use crate::bloom::RotatingWindows;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::counters::{CounterSnapshot, Counters};
use crate::error::{EngineError, Result};
use crate::events::{EventBus, MessageEvent};
use crate::reassembly::{
    fragment_encoded, FragOutcome, Reassembler, DEFAULT_TTL_SECS as REASSEMBLY_TTL_SECS,
};
use crate::scheduler::{self, acquire_channel, ChannelDecision};
use crate::seen_cache::{SeenCache, DEFAULT_TTL_SECS as SEEN_TTL_SECS};
use crate::sync::{SyncDecision, SyncEngine};
use crate::timing::{TxTiming, MIN_INTER_FRAME_GAP_MS};

/// Graceful shutdown budget; tasks still running afterwards are aborted.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// TX loop poll cadence while the queue is empty.
const TX_POLL: Duration = Duration::from_millis(100);

/// Housekeeping cadence.
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(1000);

/// How long a heard-of id stays in the wanted set.
const WANTED_TTL_MS: u64 = 3600 * 1000;

/// Query filter for [`Engine::query_messages`].
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub channel: Option<String>,
    pub since: Option<u32>,
    pub limit: Option<u32>,
}

/// Point-in-time engine status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub queue_depth: u64,
    pub bloom_population: u64,
    pub counters: CounterSnapshot,
}

/// Mutable engine state behind one lock: the sync engine (Bloom windows,
/// wanted set, REQ limiter), the seen cache, reassembly buffers, and the
/// adaptive timing state. Rotation and inserts serialize here, which is
/// what makes window rotation atomic.
struct State {
    sync: SyncEngine,
    seen: SeenCache,
    reassembler: Reassembler,
    timing: TxTiming,
}

struct Inner {
    config: Config,
    own_callsign: Callsign,
    destination: Callsign,
    db: Mutex<Database>,
    state: Mutex<State>,
    counters: Counters,
    events: EventBus,
    clock: Arc<dyn Clock>,
    carrier: CarrierSense,
    connected: AtomicBool,
    last_tx_ms: AtomicU64,
    /// Encoded AX.25 frames headed for the wire; consumed by the TNC pump
    /// when online, or by the host (tests) in offline mode.
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: std::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    tnc_cmd: std::sync::Mutex<Option<mpsc::Sender<TncCommand>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build an engine against the configured database, restoring Bloom
    /// windows, queued transmissions, and partial reassembly state.
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().map_err(EngineError::Config)?;
        let own_callsign = config.node_callsign().map_err(EngineError::Framing)?;
        let destination =
            Callsign::parse(DEFAULT_DESTINATION).map_err(EngineError::Framing)?;

        let db = match &config.storage.database_path {
            Some(path) => Database::open_at(path)?,
            None => Database::open_default()?,
        };

        // Frames leased by a previous process are fair game again.
        let released = db.release_tx_leases()?;
        if released > 0 {
            info!(released, "released stale TX leases");
        }

        let now = clock.now_unix();
        let rows = db.load_bloom_windows()?;
        let windows = RotatingWindows::from_rows(
            &rows,
            now,
            config.protocol.bloom_window_s,
            config.protocol.bloom_k,
            config.protocol.bloom_m_log2,
        );

        let sync = SyncEngine::new(
            windows,
            config.protocol.req_per_minute,
            config.protocol.sync_interval_s,
            clock.now_millis(),
        );

        let mut state = State {
            sync,
            seen: SeenCache::default(),
            reassembler: Reassembler::new(),
            timing: TxTiming::new(),
        };
        restore_reassembly(&db, &mut state.reassembler, now);

        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        info!(callsign = %own_callsign, "engine initialised");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                own_callsign,
                destination,
                db: Mutex::new(db),
                state: Mutex::new(state),
                counters: Counters::default(),
                events: EventBus::new(),
                clock,
                carrier: CarrierSense::new(),
                connected: AtomicBool::new(false),
                last_tx_ms: AtomicU64::new(0),
                outbound_tx,
                outbound_rx: std::sync::Mutex::new(Some(outbound_rx)),
                tnc_cmd: std::sync::Mutex::new(None),
                shutdown_tx,
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn with_defaults(config: Config) -> Result<Self> {
        Self::new(config, Arc::new(SystemClock))
    }

    /// Spawn the engine loops. In offline mode the wire tasks are skipped
    /// and outbound frames are left on the channel from
    /// [`Engine::take_outbound`].
    pub fn start(&self) {
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(tx_loop(
            self.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(housekeeping_loop(
            self.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));

        if !self.inner.config.network.offline_mode {
            let tnc_config = TncConfig {
                host: self.inner.config.network.tnc_host.clone(),
                port: self.inner.config.network.tnc_port,
                ..TncConfig::default()
            };
            let (cmd_tx, notify_rx) = spawn_tnc(tnc_config, self.inner.carrier.clone());

            if let Ok(mut slot) = self.inner.tnc_cmd.lock() {
                *slot = Some(cmd_tx.clone());
            }

            let outbound_rx = self
                .inner
                .outbound_rx
                .lock()
                .ok()
                .and_then(|mut slot| slot.take());
            if let Some(outbound_rx) = outbound_rx {
                tasks.push(tokio::spawn(outbound_pump(
                    cmd_tx,
                    outbound_rx,
                    self.inner.shutdown_tx.subscribe(),
                )));
            }

            tasks.push(tokio::spawn(rx_loop(
                self.clone(),
                notify_rx,
                self.inner.shutdown_tx.subscribe(),
            )));
        }

        if let Ok(mut slot) = self.inner.tasks.lock() {
            slot.extend(tasks);
        }
    }

    /// Offline-mode harness hook: the stream of encoded AX.25 frames the
    /// engine would have transmitted. Available once.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inner.outbound_rx.lock().ok().and_then(|mut s| s.take())
    }

    /// Subscribe to the engine event stream. Subscribers are independent
    /// and may be dropped at any time.
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.inner.events.subscribe()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }

    /// Construct, store, and enqueue a message authored on this node.
    pub async fn submit_message(
        &self,
        channel: &str,
        body: &str,
        priority: Priority,
        reply_to: Option<MessageId>,
        author: Option<&str>,
    ) -> Result<StoredMessage> {
        validate_channel(channel).map_err(EngineError::Framing)?;
        if body.len() > MAX_BODY_LEN {
            return Err(EngineError::BodyTooLarge(MAX_BODY_LEN));
        }
        let author = author.unwrap_or_default();
        if author.len() > MAX_AUTHOR_LEN {
            return Err(EngineError::Framing(FramingError::FieldTooLong("author")));
        }

        let inner = &self.inner;
        let now = inner.clock.now_unix();

        {
            let db = inner.db.lock().await;
            if db.tx_queue_depth()? > inner.config.protocol.queue_high_water {
                Counters::incr(&inner.counters.backpressure_dropped);
                return Err(EngineError::BackpressureDropped);
            }
        }

        let timestamp = now as u32;
        let id = MessageId::fingerprint(&inner.own_callsign, timestamp, body.as_bytes());
        let stored = StoredMessage {
            id,
            from_node: inner.own_callsign.clone(),
            author: author.to_string(),
            timestamp,
            channel: channel.to_string(),
            priority,
            reply_to,
            body: body.as_bytes().to_vec(),
            received_at: None,
            transmitted_at: None,
        };

        let outcome = {
            let db = inner.db.lock().await;
            let outcome = db.insert_message(&stored)?;
            if outcome == InsertOutcome::Inserted {
                db.seen_touch(&id, now)?;
                db.upsert_channel(channel, now)?;
            }
            outcome
        };

        if outcome == InsertOutcome::Duplicate {
            // Same second, same body: the row already exists and is already
            // queued; hand the stored copy back.
            debug!(id = %id, "submission deduplicated");
            let db = inner.db.lock().await;
            return Ok(db.get_message(&id)?.unwrap_or(stored));
        }

        Counters::incr(&inner.counters.messages_accepted);
        {
            let mut state = inner.state.lock().await;
            state.seen.touch(id, now);
            state.sync.insert_accepted(&id);
        }
        inner.events.publish(MessageEvent::NewMessage(stored.clone()));

        self.enqueue_msg_frames(&stored, priority).await?;
        info!(id = %id, channel, "message queued for transmission");
        Ok(stored)
    }

    /// Encode a stored message and enqueue it (fragmented if oversize).
    async fn enqueue_msg_frames(
        &self,
        message: &StoredMessage,
        priority: Priority,
    ) -> Result<()> {
        let frame = Frame::Msg(MsgFrame {
            id: message.id,
            timestamp: message.timestamp,
            priority: message.priority,
            channel: message.channel.clone(),
            author: message.author.clone(),
            reply_to: message.reply_to,
            body: message.body.clone(),
        });
        let encoded = frame.encode();
        let mtu = self.inner.config.protocol.mtu;

        match fragment_encoded(&encoded, message.id, mtu) {
            None => {
                self.enqueue_payload(encoded, priority, TxPurpose::Msg, Some(message.id))
                    .await
            }
            Some(frags) => {
                for frag in frags {
                    self.enqueue_payload(
                        frag.encode(),
                        priority,
                        TxPurpose::Frag,
                        Some(message.id),
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    /// Enqueue one RFMP payload with the adaptive transmit delay.
    async fn enqueue_payload(
        &self,
        payload: Vec<u8>,
        priority: Priority,
        purpose: TxPurpose,
        msg_id: Option<MessageId>,
    ) -> Result<()> {
        let inner = &self.inner;
        let now_ms = inner.clock.now_millis();
        let delay_ms = {
            let state = inner.state.lock().await;
            state.timing.enqueue_delay_ms(priority as u8)
        };

        let db = inner.db.lock().await;
        db.enqueue_tx(
            &payload,
            priority,
            purpose,
            msg_id.as_ref(),
            now_ms,
            now_ms + delay_ms,
        )?;
        Ok(())
    }

    /// Feed one received AX.25 frame into the dispatch pipeline. Called by
    /// the RX loop; exposed for offline harnesses.
    pub async fn inject_ax25(&self, bytes: &[u8]) {
        let inner = &self.inner;
        Counters::incr(&inner.counters.frames_rx);

        let ui = match UiFrame::decode(bytes) {
            Ok(ui) => ui,
            Err(e) => {
                Counters::incr(&inner.counters.framing_errors);
                debug!(error = %e, "dropping malformed AX.25 frame");
                return;
            }
        };
        if ui.destination.call() != inner.destination.call() {
            // Not RFMP traffic; other stations share the channel.
            return;
        }

        let frame = match Frame::decode(&ui.info) {
            Ok(frame) => frame,
            Err(e) => {
                match e {
                    FramingError::RfmpBadMagic(_) => {
                        Counters::incr(&inner.counters.rfmp_bad_magic)
                    }
                    FramingError::RfmpBadVersion(_) => {
                        Counters::incr(&inner.counters.rfmp_bad_version)
                    }
                    _ => Counters::incr(&inner.counters.framing_errors),
                }
                debug!(error = %e, "dropping undecodable RFMP frame");
                return;
            }
        };

        if let Err(e) = self.dispatch(ui.source.clone(), frame).await {
            // Store trouble: retry the frame once, then pause briefly so a
            // wedged disk doesn't spin the RX loop.
            warn!(error = %e, "dispatch failed, retrying once");
            let retried = match Frame::decode(&ui.info) {
                Ok(frame) => self.dispatch(ui.source, frame).await,
                Err(_) => Ok(()),
            };
            if let Err(e) = retried {
                error!(error = %e, "dispatch failed twice, pausing receive");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    async fn dispatch(&self, source: Callsign, frame: Frame) -> Result<()> {
        let inner = &self.inner;
        let now = inner.clock.now_unix();
        let now_ms = inner.clock.now_millis();

        // Any valid frame is node activity: stats, events, backoff reset.
        {
            let db = inner.db.lock().await;
            db.upsert_node(&source, now)?;
        }
        {
            let mut state = inner.state.lock().await;
            state.sync.on_peer_frame(&source);
        }
        inner.events.publish(MessageEvent::NodeSeen {
            callsign: source.to_string(),
        });

        match frame {
            Frame::Msg(msg) => self.handle_msg(&source, msg).await,
            Frame::Frag {
                id,
                seq,
                total,
                payload,
            } => self.handle_frag(&source, id, seq, total, payload, now).await,
            Frame::Sync(windows) => self.handle_sync(&source, windows, now_ms).await,
            Frame::Req(ids) => self.handle_req(&source, ids, now_ms).await,
        }
    }

    /// MSG ingest: fingerprint check, dedup, store, index, publish, relay.
    async fn handle_msg(&self, source: &Callsign, msg: MsgFrame) -> Result<()> {
        let inner = &self.inner;
        let now = inner.clock.now_unix();

        let expected = MessageId::fingerprint(source, msg.timestamp, &msg.body);
        if expected != msg.id {
            Counters::incr(&inner.counters.id_mismatch);
            warn!(
                claimed = %msg.id,
                computed = %expected,
                from = %source,
                "MSG id fingerprint mismatch, dropping"
            );
            return Ok(());
        }

        // Fast-path dedup before touching the store.
        {
            let mut state = inner.state.lock().await;
            if state.seen.contains(&msg.id, now) {
                Counters::incr(&inner.counters.duplicates_dropped);
                return Ok(());
            }
        }

        let stored = StoredMessage {
            id: msg.id,
            from_node: source.clone(),
            author: msg.author.clone(),
            timestamp: msg.timestamp,
            channel: msg.channel.clone(),
            priority: msg.priority,
            reply_to: msg.reply_to,
            body: msg.body.clone(),
            received_at: DateTime::from_timestamp(now as i64, 0),
            transmitted_at: None,
        };

        let outcome = {
            let db = inner.db.lock().await;
            let outcome = db.insert_message(&stored)?;
            db.seen_touch(&msg.id, now)?;
            if outcome == InsertOutcome::Inserted {
                db.upsert_channel(&msg.channel, now)?;
            }
            outcome
        };

        {
            let mut state = inner.state.lock().await;
            state.seen.touch(msg.id, now);
            if outcome == InsertOutcome::Inserted {
                state.sync.insert_accepted(&msg.id);
                // A reply to a message we do not hold is worth chasing.
                if let Some(reply) = msg.reply_to {
                    let have = {
                        let db = inner.db.lock().await;
                        db.contains_message(&reply)?
                    };
                    if !have {
                        state.sync.note_wanted(reply, inner.clock.now_millis());
                    }
                }
            }
        }

        if outcome == InsertOutcome::Duplicate {
            Counters::incr(&inner.counters.duplicates_dropped);
            debug!(id = %msg.id, "duplicate MSG dropped");
            return Ok(());
        }

        Counters::incr(&inner.counters.messages_accepted);
        info!(id = %msg.id, from = %source, channel = %msg.channel, "message received");
        inner.events.publish(MessageEvent::NewMessage(stored.clone()));

        // Store-and-forward: relay each foreign message once, demoted below
        // fresh traffic.
        let relay = {
            let db = inner.db.lock().await;
            db.mark_rebroadcast(&msg.id, now)?
        };
        if relay {
            Counters::incr(&inner.counters.rebroadcasts);
            self.enqueue_msg_frames(&stored, msg.priority.demoted())
                .await?;
        }
        Ok(())
    }

    async fn handle_frag(
        &self,
        source: &Callsign,
        id: MessageId,
        seq: u8,
        total: u8,
        payload: Vec<u8>,
        now: u64,
    ) -> Result<()> {
        let inner = &self.inner;

        // Fragments of a message we already hold are noise.
        {
            let mut state = inner.state.lock().await;
            if state.seen.contains(&id, now) {
                return Ok(());
            }
        }

        {
            let db = inner.db.lock().await;
            db.insert_fragment(&FragmentRow {
                from_node: source.clone(),
                msg_id: id,
                seq,
                total,
                payload: payload.clone(),
                received_at: now,
            })?;
        }

        let outcome = {
            let mut state = inner.state.lock().await;
            let outcome = state
                .reassembler
                .ingest(source, id, seq, total, payload, now);
            // Buffers evicted for capacity lose their persisted fragments.
            for (from, evicted_id) in state.reassembler.drain_evicted() {
                let db = inner.db.lock().await;
                db.delete_fragments(&from, &evicted_id)?;
            }
            outcome
        };

        match outcome {
            FragOutcome::Complete(msg) => {
                {
                    let db = inner.db.lock().await;
                    db.delete_fragments(source, &id)?;
                }
                self.handle_msg(source, msg).await
            }
            FragOutcome::IdMismatch => {
                Counters::incr(&inner.counters.reassembly_id_mismatch);
                warn!(id = %id, from = %source, "reassembled MSG id mismatch, buffer discarded");
                let db = inner.db.lock().await;
                db.delete_fragments(source, &id)?;
                Ok(())
            }
            FragOutcome::Stored | FragOutcome::Duplicate | FragOutcome::TotalMismatch => Ok(()),
        }
    }

    async fn handle_sync(
        &self,
        source: &Callsign,
        remote: Vec<rfmp_shared::frames::SyncWindow>,
        now_ms: u64,
    ) -> Result<()> {
        let inner = &self.inner;

        // Gather the ids accepted during each local window's span before
        // taking the state lock for comparison.
        let spans: Vec<(u32, u64, u64)> = {
            let state = inner.state.lock().await;
            let w = state.sync.windows().window_secs();
            state
                .sync
                .windows()
                .windows()
                .iter()
                .map(|win| {
                    let start = win.opened_at as u64;
                    (win.opened_at, start, start + w)
                })
                .collect()
        };

        let mut local_ids_by_window = Vec::with_capacity(spans.len());
        {
            let db = inner.db.lock().await;
            for (opened_at, start, end) in spans {
                local_ids_by_window.push((opened_at, db.list_recent_ids(start, end)?));
            }
        }

        let pushes = {
            let mut state = inner.state.lock().await;
            state
                .sync
                .on_sync(source, &remote, &local_ids_by_window, now_ms)
        };

        // Push direction: send what the peer's filters don't show, unless
        // the queue is already saturated.
        if !pushes.is_empty() {
            let depth = {
                let db = inner.db.lock().await;
                db.tx_queue_depth()?
            };
            if depth > inner.config.protocol.queue_high_water {
                Counters::incr(&inner.counters.backpressure_dropped);
                debug!(dropped = pushes.len(), "push candidates dropped under backpressure");
            } else {
                for id in pushes {
                    let message = {
                        let db = inner.db.lock().await;
                        db.get_message(&id)?
                    };
                    if let Some(message) = message {
                        Counters::incr(&inner.counters.pushes_enqueued);
                        self.enqueue_msg_frames(&message, message.priority.demoted())
                            .await?;
                    }
                }
            }
        }

        self.flush_reqs(now_ms).await
    }

    async fn handle_req(
        &self,
        source: &Callsign,
        ids: Vec<MessageId>,
        now_ms: u64,
    ) -> Result<()> {
        let inner = &self.inner;

        for id in ids {
            let message = {
                let db = inner.db.lock().await;
                db.get_message(&id)?
            };
            match message {
                Some(message) => {
                    // Serve the request at fixed pull priority.
                    self.enqueue_msg_frames(&message, Priority::Low).await?;
                }
                None => {
                    // Someone believes this id exists; chase it too.
                    debug!(id = %id, peer = %source, "REQ for unknown id, marked wanted");
                    let mut state = inner.state.lock().await;
                    state.sync.note_wanted(id, now_ms);
                }
            }
        }
        Ok(())
    }

    /// Emit any REQ frames the rate limiter allows right now.
    async fn flush_reqs(&self, now_ms: u64) -> Result<()> {
        let reqs = {
            let mut state = self.inner.state.lock().await;
            state.sync.drain_reqs(now_ms)
        };
        for (peer, ids) in reqs {
            Counters::incr(&self.inner.counters.reqs_sent);
            debug!(peer = %peer, count = ids.len(), "requesting missing messages");
            self.enqueue_payload(
                Frame::Req(ids).encode(),
                Priority::Minimal,
                TxPurpose::Req,
                None,
            )
            .await?;
        }
        Ok(())
    }

    // -- Queries ----------------------------------------------------------

    pub async fn query_messages(&self, filter: MessageFilter) -> Result<Vec<StoredMessage>> {
        let db = self.inner.db.lock().await;
        Ok(db.list_messages(
            filter.channel.as_deref(),
            filter.since,
            filter.limit.unwrap_or(100),
        )?)
    }

    pub async fn get_message(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        let db = self.inner.db.lock().await;
        Ok(db.get_message(id)?)
    }

    /// Short-id lookup on a hex prefix of at least 8 characters.
    pub async fn get_message_by_prefix(&self, prefix: &str) -> Result<Option<StoredMessage>> {
        let db = self.inner.db.lock().await;
        Ok(db.get_message_by_prefix(prefix)?)
    }

    pub async fn query_channels(&self) -> Result<Vec<ChannelInfo>> {
        let db = self.inner.db.lock().await;
        Ok(db.list_channels()?)
    }

    pub async fn query_nodes(&self, active_within: Option<u64>) -> Result<Vec<NodeInfo>> {
        let now = self.inner.clock.now_unix();
        let db = self.inner.db.lock().await;
        Ok(db.list_nodes(now, active_within)?)
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let queue_depth = {
            let db = self.inner.db.lock().await;
            db.tx_queue_depth()?
        };
        let bloom_population = {
            let state = self.inner.state.lock().await;
            state.sync.windows().population()
        };
        Ok(StatusSnapshot {
            connected: self.inner.connected.load(Ordering::Relaxed),
            queue_depth,
            bloom_population,
            counters: self.inner.counters.snapshot(),
        })
    }

    // -- Shutdown ---------------------------------------------------------

    /// Stop the loops, persist sync state, and flush the store. Tasks that
    /// fail to drain within the budget are aborted and reported.
    pub async fn shutdown(&self) -> Result<()> {
        info!("engine shutting down");
        let _ = self.inner.shutdown_tx.send(true);

        if let Some(cmd_tx) = self.inner.tnc_cmd.lock().ok().and_then(|mut s| s.take()) {
            let _ = cmd_tx.send(TncCommand::Shutdown).await;
        }

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .map(|mut slot| slot.drain(..).collect())
            .unwrap_or_default();

        let mut timed_out = false;
        for mut task in tasks {
            match tokio::time::timeout(SHUTDOWN_DRAIN, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    task.abort();
                    timed_out = true;
                }
            }
        }

        self.persist_bloom().await?;

        if timed_out {
            warn!("engine tasks did not drain before the shutdown deadline");
            return Err(EngineError::ShutdownTimeout);
        }
        Ok(())
    }

    async fn persist_bloom(&self) -> Result<()> {
        let rows = {
            let state = self.inner.state.lock().await;
            state.sync.windows().to_rows()
        };
        let db = self.inner.db.lock().await;
        for row in &rows {
            db.save_bloom_window(row)?;
        }
        Ok(())
    }
}

/// Rebuild reassembly buffers from fragments persisted before a restart.
fn restore_reassembly(db: &Database, reassembler: &mut Reassembler, now: u64) {
    let conn = db.conn();
    let mut keys: Vec<(String, String, u8)> = Vec::new();
    if let Ok(mut stmt) =
        conn.prepare("SELECT DISTINCT from_node, msg_id, total FROM fragments")
    {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        }) {
            for row in rows.flatten() {
                keys.push(row);
            }
        }
    }

    for (from_str, id_str, total) in keys {
        let (Ok(from), Ok(id)) = (Callsign::parse(&from_str), MessageId::from_hex(&id_str))
        else {
            continue;
        };
        if let Ok(fragments) = db.list_fragments(&from, &id) {
            let parts = fragments.into_iter().map(|f| (f.seq, f.payload));
            reassembler.restore(&from, id, total, parts, now);
        }
    }
}

// -- Background loops -----------------------------------------------------

/// Lease → CSMA listen → AX.25 wrap → handoff → ack/nack.
async fn tx_loop(engine: Engine, mut shutdown: watch::Receiver<bool>) {
    let inner = &engine.inner;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(TX_POLL) => {}
        }

        // Frames wait while the TNC is down (offline mode always "passes").
        if !inner.config.network.offline_mode && !inner.connected.load(Ordering::Relaxed) {
            continue;
        }

        let now_ms = inner.clock.now_millis();
        let since_last = now_ms.saturating_sub(inner.last_tx_ms.load(Ordering::Relaxed));
        if inner.last_tx_ms.load(Ordering::Relaxed) != 0 && since_last < MIN_INTER_FRAME_GAP_MS {
            continue;
        }

        let entry = {
            let db = inner.db.lock().await;
            match db.lease_next_tx(now_ms) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(error = %e, "TX lease failed");
                    continue;
                }
            }
        };
        let Some(entry) = entry else { continue };

        // Listen before transmit.
        if acquire_channel(&inner.carrier).await == ChannelDecision::Busy {
            Counters::incr(&inner.counters.csma_drops);
            let mut state = inner.state.lock().await;
            state.timing.on_collision();
            drop(state);
            let db = inner.db.lock().await;
            let _ = db.ack_tx(entry.id);
            warn!(purpose = ?entry.purpose, "channel never cleared, frame dropped");
            continue;
        }

        // Relayed messages keep their origin callsign in the AX.25 source
        // and carry this node in the digipeater path, so the content
        // fingerprint survives store-and-forward.
        let origin = match entry.msg_id {
            Some(id) => {
                let db = inner.db.lock().await;
                db.get_message(&id).ok().flatten().map(|m| m.from_node)
            }
            None => None,
        };
        let mut ui = UiFrame::new(
            origin.clone().unwrap_or_else(|| inner.own_callsign.clone()),
            inner.destination.clone(),
            entry.frame.clone(),
        );
        if let Some(origin) = origin {
            if origin != inner.own_callsign {
                ui.digipeaters.push(inner.own_callsign.clone());
            }
        }

        match inner.outbound_tx.try_send(ui.encode()) {
            Ok(()) => {
                Counters::incr(&inner.counters.frames_tx);
                inner
                    .last_tx_ms
                    .store(inner.clock.now_millis().max(1), Ordering::Relaxed);
                {
                    let mut state = inner.state.lock().await;
                    state.timing.on_clean_send();
                }
                let db = inner.db.lock().await;
                let _ = db.ack_tx(entry.id);
                if entry.purpose == TxPurpose::Msg {
                    if let Some(id) = entry.msg_id {
                        if let Some(at) = DateTime::from_timestamp(inner.clock.now_unix() as i64, 0)
                        {
                            let _ = db.set_transmitted_at(&id, at);
                        }
                    }
                }
                if entry.purpose == TxPurpose::Sync {
                    Counters::incr(&inner.counters.syncs_sent);
                }
            }
            Err(_) => {
                // Handoff failed: back off exponentially, drop permanently
                // after the attempt budget.
                let attempts = entry.attempts + 1;
                {
                    let mut state = inner.state.lock().await;
                    state.timing.on_collision();
                }
                let db = inner.db.lock().await;
                if scheduler::is_permanent_failure(attempts) {
                    Counters::incr(&inner.counters.tx_permanent_failures);
                    let _ = db.ack_tx(entry.id);
                    inner.events.publish(MessageEvent::TxPermanentFailure {
                        msg_id: entry.msg_id,
                    });
                    warn!(purpose = ?entry.purpose, "frame dropped after repeated handoff failures");
                } else {
                    let delay = scheduler::nack_delay_ms(entry.attempts);
                    let _ = db.nack_tx(entry.id, now_ms, delay);
                }
            }
        }
    }
}

/// Forward engine outbound frames to the TNC task.
async fn outbound_pump(
    cmd_tx: mpsc::Sender<TncCommand>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if rfmp_net::send_frame(&cmd_tx, frame).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

/// Consume TNC notifications: connection state and received frames.
async fn rx_loop(
    engine: Engine,
    mut notify_rx: mpsc::Receiver<TncNotification>,
    mut shutdown: watch::Receiver<bool>,
) {
    let inner = &engine.inner;
    loop {
        let notification = tokio::select! {
            _ = shutdown.changed() => return,
            n = notify_rx.recv() => n,
        };
        let Some(notification) = notification else {
            return;
        };

        match notification {
            TncNotification::Connected => {
                inner.connected.store(true, Ordering::Relaxed);
                engine.publish_status().await;
            }
            TncNotification::Disconnected => {
                inner.connected.store(false, Ordering::Relaxed);
                engine.publish_status().await;
            }
            TncNotification::Frame(bytes) => {
                engine.inject_ax25(&bytes).await;
            }
            TncNotification::SendFailed => {
                let mut state = inner.state.lock().await;
                state.timing.on_collision();
            }
        }
    }
}

impl Engine {
    async fn publish_status(&self) {
        if let Ok(status) = self.status().await {
            self.inner.events.publish(MessageEvent::StatusChange {
                connected: status.connected,
                queue_depth: status.queue_depth,
                counters: status.counters,
            });
        }
    }

    /// One housekeeping pass: Bloom rotation, sweeps, SYNC emission, REQ
    /// drainage. Factored out of the loop so tests can drive it directly.
    pub async fn housekeeping_tick(&self) {
        let inner = &self.inner;
        let now = inner.clock.now_unix();
        let now_ms = inner.clock.now_millis();

        // Window rotation, persisted so sync state survives restart.
        let rotated = {
            let mut state = inner.state.lock().await;
            if state.sync.windows().needs_rotation(now) {
                state.sync.windows_mut().rotate(now);
                true
            } else {
                false
            }
        };
        if rotated {
            debug!("bloom window rotated");
            if let Err(e) = self.persist_bloom().await {
                warn!(error = %e, "failed to persist bloom windows");
            }
        }

        // Reassembly timeouts: purge fragments; if the message is still
        // missing, keep chasing it through the sync machinery.
        let expired = {
            let mut state = inner.state.lock().await;
            state.reassembler.sweep(now, REASSEMBLY_TTL_SECS)
        };
        for (from, id) in expired {
            let missing = {
                let db = inner.db.lock().await;
                let _ = db.delete_fragments(&from, &id);
                !db.contains_message(&id).unwrap_or(false)
            };
            if missing {
                let mut state = inner.state.lock().await;
                state.sync.note_wanted(id, now_ms);
                debug!(id = %id, from = %from, "reassembly timed out, id marked wanted");
            }
        }

        // Periodic SYNC emission.
        let decision = {
            let depth = {
                let db = inner.db.lock().await;
                db.tx_queue_depth().unwrap_or(0)
            };
            let mut state = inner.state.lock().await;
            state
                .sync
                .should_emit_sync(now_ms, depth, inner.config.protocol.queue_high_water)
        };
        match decision {
            SyncDecision::Emit => {
                let windows = {
                    let state = inner.state.lock().await;
                    state.sync.sync_windows()
                };
                let payload = Frame::Sync(windows).encode();
                let enqueued = {
                    let db = inner.db.lock().await;
                    // Replace any stale queued summary with the fresh one.
                    let _ = db.drop_queued_syncs();
                    db.enqueue_tx(&payload, Priority::Low, TxPurpose::Sync, None, now_ms, now_ms)
                };
                if enqueued.is_ok() {
                    debug!("SYNC frame queued");
                }
            }
            SyncDecision::Suppressed => {
                Counters::incr(&inner.counters.syncs_suppressed);
            }
            SyncDecision::NotDue => {}
        }

        // REQs whose backoff or budget has freed up.
        if let Err(e) = self.flush_reqs(now_ms).await {
            warn!(error = %e, "REQ flush failed");
        }

        // Cache and store sweeps.
        {
            let mut state = inner.state.lock().await;
            state.seen.sweep(now);
            state.sync.sweep(now_ms, WANTED_TTL_MS);
        }
        {
            let db = inner.db.lock().await;
            let _ = db.cleanup_fragments(now.saturating_sub(REASSEMBLY_TTL_SECS));
            let _ = db.cleanup_seen(now.saturating_sub(SEEN_TTL_SECS));
        }
    }
}

async fn housekeeping_loop(engine: Engine, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(HOUSEKEEPING_TICK) => {}
        }
        engine.housekeeping_tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.node.callsign = "N0CALL".into();
        config.node.ssid = 1;
        config.network.offline_mode = true;
        config.storage.database_path = Some(dir.join("rfmp.db"));
        config
    }

    fn test_engine(dir: &std::path::Path, clock: Arc<ManualClock>) -> Engine {
        Engine::new(test_config(dir), clock).unwrap()
    }

    /// Build the on-air bytes for a MSG as a foreign station would send it.
    fn foreign_msg(from: &str, channel: &str, body: &[u8], ts: u32) -> (MessageId, Vec<u8>) {
        let source = Callsign::parse(from).unwrap();
        let id = MessageId::fingerprint(&source, ts, body);
        let frame = Frame::Msg(MsgFrame {
            id,
            timestamp: ts,
            priority: Priority::Normal,
            channel: channel.into(),
            author: String::new(),
            reply_to: None,
            body: body.to_vec(),
        });
        let ui = UiFrame::new(
            source,
            Callsign::parse(DEFAULT_DESTINATION).unwrap(),
            frame.encode(),
        );
        (id, ui.encode())
    }

    #[tokio::test(start_paused = true)]
    async fn submit_emits_one_wire_frame() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);
        let engine = test_engine(dir.path(), clock.clone());
        let mut outbound = engine.take_outbound().unwrap();
        engine.start();

        let stored = engine
            .submit_message("general", "hello", Priority::Normal, None, None)
            .await
            .unwrap();

        let expected = MessageId::fingerprint(
            &Callsign::parse("N0CALL-1").unwrap(),
            1_700_000_000,
            b"hello",
        );
        assert_eq!(stored.id, expected);
        assert_eq!(stored.id.to_hex().len(), 12);

        // Let the adaptive delay elapse and the TX loop run.
        clock.advance_millis(3000);
        let frame = tokio::time::timeout(Duration::from_secs(10), outbound.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open");

        let ui = UiFrame::decode(&frame).unwrap();
        assert_eq!(ui.source.to_string(), "N0CALL-1");
        assert_eq!(ui.destination.call(), "RFMP");
        match Frame::decode(&ui.info).unwrap() {
            Frame::Msg(msg) => {
                assert_eq!(msg.id, expected);
                assert_eq!(msg.body, b"hello");
            }
            other => panic!("expected MSG, got {other:?}"),
        }

        // Exactly one frame: nothing further shows up.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(outbound.try_recv().is_err());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ingest_keeps_one_row_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);
        let engine = test_engine(dir.path(), clock);
        let mut events = engine.subscribe();

        let (id, bytes) = foreign_msg("K7XYZ", "general", b"same message", 1_699_999_000);
        engine.inject_ax25(&bytes).await;
        engine.inject_ax25(&bytes).await;

        let stored = engine.get_message(&id).await.unwrap();
        assert!(stored.is_some());
        assert_eq!(
            engine
                .query_messages(MessageFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(engine.counters().duplicates_dropped, 1);

        // Exactly one NewMessage among the emitted events.
        let mut new_messages = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MessageEvent::NewMessage(_)) {
                new_messages += 1;
            }
        }
        assert_eq!(new_messages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forged_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);
        let engine = test_engine(dir.path(), clock);

        let source = Callsign::parse("K7XYZ").unwrap();
        let frame = Frame::Msg(MsgFrame {
            id: MessageId([0xAB; 6]), // not the fingerprint
            timestamp: 1_699_999_000,
            priority: Priority::Normal,
            channel: "general".into(),
            author: String::new(),
            reply_to: None,
            body: b"forged".to_vec(),
        });
        let ui = UiFrame::new(
            source,
            Callsign::parse(DEFAULT_DESTINATION).unwrap(),
            frame.encode(),
        );
        engine.inject_ax25(&ui.encode()).await;

        assert_eq!(engine.counters().id_mismatch, 1);
        assert!(engine
            .query_messages(MessageFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversize_submission_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);
        let engine = test_engine(dir.path(), clock);

        let body = "A".repeat(600);
        engine
            .submit_message("general", &body, Priority::Normal, None, None)
            .await
            .unwrap();

        // 600-byte body encodes past the MTU; expect 4 queued FRAGs.
        let status = engine.status().await.unwrap();
        assert_eq!(status.queue_depth, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_rejects_submission() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);
        let mut config = test_config(dir.path());
        config.protocol.queue_high_water = 0;
        let engine = Engine::new(config, clock).unwrap();

        engine
            .submit_message("general", "first", Priority::Normal, None, None)
            .await
            .unwrap();
        let err = engine
            .submit_message("general", "second", Priority::Normal, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BackpressureDropped));
        assert_eq!(engine.counters().backpressure_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn req_for_held_message_queues_reply() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);
        let engine = test_engine(dir.path(), clock);

        let stored = engine
            .submit_message("general", "requested later", Priority::Normal, None, None)
            .await
            .unwrap();
        let depth_before = engine.status().await.unwrap().queue_depth;

        let ui = UiFrame::new(
            Callsign::parse("K7XYZ").unwrap(),
            Callsign::parse(DEFAULT_DESTINATION).unwrap(),
            Frame::Req(vec![stored.id]).encode(),
        );
        engine.inject_ax25(&ui.encode()).await;

        let depth_after = engine.status().await.unwrap().queue_depth;
        assert_eq!(depth_after, depth_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_submissions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);
        let engine = test_engine(dir.path(), clock);

        assert!(engine
            .submit_message("Bad Channel", "x", Priority::Normal, None, None)
            .await
            .is_err());
        assert!(matches!(
            engine
                .submit_message("general", &"x".repeat(501), Priority::Normal, None, None)
                .await,
            Err(EngineError::BodyTooLarge(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_recovers_store_and_bloom() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);

        let id = {
            let engine = test_engine(dir.path(), clock.clone());
            let mut outbound = engine.take_outbound().unwrap();
            engine.start();

            let stored = engine
                .submit_message("general", "survives restart", Priority::Normal, None, None)
                .await
                .unwrap();

            clock.advance_millis(3000);
            tokio::time::timeout(Duration::from_secs(10), outbound.recv())
                .await
                .expect("transmitted")
                .expect("open");

            engine.shutdown().await.unwrap();
            stored.id
        };

        // Second process against the same database, a minute later.
        clock.advance_secs(60);
        let engine = test_engine(dir.path(), clock);
        let recovered = engine.get_message(&id).await.unwrap().unwrap();
        assert_eq!(recovered.body, b"survives restart");
        assert!(recovered.transmitted_at.is_some());

        // The current bloom window still holds the id, and the acked frame
        // is not re-queued.
        let status = engine.status().await.unwrap();
        assert!(status.bloom_population >= 1);
        assert_eq!(status.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn node_and_channel_stats_track_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_at(1_700_000_000);
        let engine = test_engine(dir.path(), clock);

        let (_, bytes) = foreign_msg("K7XYZ", "wx", b"storm warning", 1_699_999_000);
        engine.inject_ax25(&bytes).await;

        let nodes = engine.query_nodes(None).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].callsign.to_string(), "K7XYZ");
        assert_eq!(nodes[0].packet_count, 1);

        let channels = engine.query_channels().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "wx");
        assert_eq!(channels[0].message_count, 1);
    }
}
