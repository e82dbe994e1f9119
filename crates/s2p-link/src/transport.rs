//! Secure transport over the link: envelope rules, ACK correlation, and
//! inbound delivery.
//!
//! Send path: encrypt-then-sign per kind, serialize, hand to the link.
//! Non-ACK, non-HEARTBEAT, non-pairing sends register an ACK waiter keyed by
//! the message timestamp and resolve when the peer echoes it back.
//!
//! Deliver path: ACKs complete waiters, PAIR_ACKs feed the pairing flow,
//! inbound HEARTBEATs are answered, and everything else is
//! verified-then-decrypted before reaching subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use s2p_core::config::LinkConfig;
use s2p_core::crypto::CryptoContext;
use s2p_core::message::{CommandCode, Message, MessageKind, PairAckPayload};
use s2p_core::{BridgeError, BridgeResult};

use crate::manager::{ConnectionState, LinkManager, LinkNotice};

/// What happened to a [`Transport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written and acknowledged by the peer.
    Acked,
    /// Written; the kind carries no acknowledgement.
    Sent,
    /// The link is away; the message sits in the outbound queue and will be
    /// flushed on reconnect.
    Queued,
}

pub struct Transport {
    link: Arc<LinkManager>,
    cfg: LinkConfig,
    session: Mutex<Option<CryptoContext>>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<BridgeResult<()>>>>,
    queue: Mutex<VecDeque<Message>>,
    inbound_tx: broadcast::Sender<Message>,
    pair_ack_tx: mpsc::UnboundedSender<PairAckPayload>,
    pair_ack_rx: Mutex<Option<mpsc::UnboundedReceiver<PairAckPayload>>>,
    notice_tx: broadcast::Sender<LinkNotice>,
    /// Highest ACKed timestamp that matched no waiter — heartbeat echoes.
    hb_acked: AtomicU64,
}

impl Transport {
    pub fn new(link: Arc<LinkManager>, cfg: LinkConfig) -> Arc<Self> {
        let (inbound_tx, _) = broadcast::channel(256);
        let (pair_ack_tx, pair_ack_rx) = mpsc::unbounded_channel();
        let notice_tx = link.notice_sender();
        Arc::new(Self {
            link,
            cfg,
            session: Mutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            inbound_tx,
            pair_ack_tx,
            pair_ack_rx: Mutex::new(Some(pair_ack_rx)),
            notice_tx,
            hb_acked: AtomicU64::new(0),
        })
    }

    /// Spawn the delivery, state-watch, and heartbeat tasks. Call once.
    pub async fn start(self: &Arc<Self>) -> BridgeResult<()> {
        let mut inbound = self
            .link
            .take_inbound()
            .await
            .ok_or_else(|| BridgeError::link("transport already started"))?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                this.deliver(msg).await;
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.watch_state().await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.heartbeat_loop().await });

        Ok(())
    }

    /// Subscribe to inbound application messages (decrypted, in arrival order).
    pub fn inbound(&self) -> broadcast::Receiver<Message> {
        self.inbound_tx.subscribe()
    }

    /// The PAIR_ACK stream for the pairing flow. Can be taken once.
    pub async fn take_pair_acks(&self) -> Option<mpsc::UnboundedReceiver<PairAckPayload>> {
        self.pair_ack_rx.lock().await.take()
    }

    pub async fn install_session(&self, ctx: CryptoContext) {
        *self.session.lock().await = Some(ctx);
        debug!("session key installed");
    }

    pub async fn close_session(&self) {
        if let Some(mut ctx) = self.session.lock().await.take() {
            ctx.close();
            debug!("session key wiped");
        }
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn send_text(&self, text: impl Into<String>) -> BridgeResult<SendOutcome> {
        self.send(Message::text(text)).await
    }

    pub async fn send_command(&self, code: CommandCode) -> BridgeResult<SendOutcome> {
        self.send(Message::command(code)).await
    }

    /// Send a message, applying the envelope rules for its kind.
    ///
    /// While the link is reconnecting (or pairing is still in flight),
    /// non-pairing messages queue and flush once CONNECTED.
    pub async fn send(&self, msg: Message) -> BridgeResult<SendOutcome> {
        let state = self.link.state();
        match state {
            ConnectionState::Connected => self.send_now(msg).await,
            ConnectionState::AwaitingPairing if msg.kind.is_pairing() => self.send_now(msg).await,
            ConnectionState::AwaitingPairing | ConnectionState::Reconnecting => {
                self.enqueue(msg).await?;
                Ok(SendOutcome::Queued)
            }
            _ => Err(BridgeError::link(format!("cannot send while {state:?}"))),
        }
    }

    async fn send_now(&self, mut msg: Message) -> BridgeResult<SendOutcome> {
        {
            let session = self.session.lock().await;
            if let Some(ctx) = session.as_ref() {
                if !msg.kind.is_pairing() {
                    if msg.kind.is_encrypted() {
                        ctx.sign_and_encrypt(&mut msg)?;
                    } else {
                        // HEARTBEAT and ACK carry no secrets but still get
                        // integrity.
                        ctx.sign(&mut msg)?;
                    }
                }
            }
        }

        let bytes = msg.to_json()?.into_bytes();
        let needs_ack = !matches!(
            msg.kind,
            MessageKind::Ack | MessageKind::Heartbeat | MessageKind::PairReq | MessageKind::PairAck
        );

        if !needs_ack {
            self.link.send_raw(&bytes).await?;
            return Ok(SendOutcome::Sent);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(msg.timestamp, tx);

        if let Err(e) = self.link.send_raw(&bytes).await {
            self.waiters.lock().await.remove(&msg.timestamp);
            return Err(e);
        }

        let ack_timeout = Duration::from_secs(self.cfg.ack_timeout_secs);
        match tokio::time::timeout(ack_timeout, rx).await {
            Ok(Ok(result)) => result.map(|()| SendOutcome::Acked),
            // Waiter dropped without a verdict; treat as a dead link.
            Ok(Err(_)) => Err(BridgeError::link("link went away awaiting ack")),
            Err(_) => {
                self.waiters.lock().await.remove(&msg.timestamp);
                Err(BridgeError::AckTimeout)
            }
        }
    }

    /// Bounded queue with the protocol drop order: oldest TEXT first, then
    /// HEARTBEAT; COMMANDs and ACKs are never dropped.
    async fn enqueue(&self, msg: Message) -> BridgeResult<()> {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.cfg.outbound_queue_cap {
            let oldest_text = queue.iter().position(|m| m.kind == MessageKind::Text);
            let oldest_beat = queue.iter().position(|m| m.kind == MessageKind::Heartbeat);
            if let Some(pos) = oldest_text {
                if let Some(dropped) = queue.remove(pos) {
                    warn!(ts = dropped.timestamp, "outbound queue overflow, dropping oldest TEXT");
                    let _ = self.notice_tx.send(LinkNotice::QueueOverflow { dropped: dropped.kind });
                }
            } else if let Some(pos) = oldest_beat {
                if let Some(dropped) = queue.remove(pos) {
                    let _ = self.notice_tx.send(LinkNotice::QueueOverflow { dropped: dropped.kind });
                }
            } else if matches!(msg.kind, MessageKind::Text | MessageKind::Heartbeat) {
                let _ = self.notice_tx.send(LinkNotice::QueueOverflow { dropped: msg.kind });
                return Err(BridgeError::QueueOverflow);
            }
            // Only critical kinds remain; let them exceed the cap.
        }
        queue.push_back(msg);
        Ok(())
    }

    fn spawn_flush(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let msg = this.queue.lock().await.pop_front();
                let Some(msg) = msg else { break };
                let ts = msg.timestamp;
                match this.send_now(msg).await {
                    Ok(_) => {}
                    Err(e) => {
                        // The flushed message is lost; its sender retries.
                        warn!(ts, error = %e, "queued message failed after reconnect");
                        if this.link.state() != ConnectionState::Connected {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn fail_pending(&self, mk: impl Fn() -> BridgeError) {
        let mut waiters = self.waiters.lock().await;
        if waiters.is_empty() {
            return;
        }
        debug!(count = waiters.len(), "failing in-flight sends");
        for (_, tx) in waiters.drain() {
            let _ = tx.send(Err(mk()));
        }
    }

    async fn watch_state(self: Arc<Self>) {
        let mut state_rx = self.link.watch_state();
        loop {
            if state_rx.changed().await.is_err() {
                return;
            }
            let cur = *state_rx.borrow_and_update();
            match cur {
                ConnectionState::Connected => self.spawn_flush(),
                ConnectionState::Reconnecting => {
                    self.fail_pending(|| BridgeError::link("link lost mid-send")).await;
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    self.fail_pending(|| BridgeError::Cancelled).await;
                    self.close_session().await;
                }
                _ => {}
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.heartbeat_interval_secs);
        let mut state_rx = self.link.watch_state();
        loop {
            if state_rx
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .is_err()
            {
                return;
            }

            let mut misses = 0u32;
            let mut awaiting: Option<u64> = None;
            loop {
                tokio::time::sleep(interval).await;
                if self.link.state() != ConnectionState::Connected {
                    break;
                }

                // Settle the previous beat before emitting the next.
                if let Some(sent_ts) = awaiting {
                    if self.hb_acked.load(Ordering::SeqCst) >= sent_ts {
                        misses = 0;
                    } else {
                        misses += 1;
                        debug!(misses, "heartbeat ack missing");
                        if misses >= self.cfg.heartbeat_misses {
                            warn!("heartbeat acks missed, cycling the link");
                            self.link.force_reconnect("heartbeat timeout").await;
                            break;
                        }
                    }
                }

                let beat = Message::heartbeat();
                awaiting = Some(beat.timestamp);
                if let Err(e) = self.send(beat).await {
                    debug!(error = %e, "heartbeat send failed");
                    break;
                }
            }
        }
    }

    async fn deliver(self: &Arc<Self>, mut msg: Message) {
        match msg.kind {
            MessageKind::Ack => {
                let Ok(ts) = msg.acked_timestamp() else {
                    warn!(payload = %msg.payload, "ACK with unparseable payload");
                    let _ = self.notice_tx.send(LinkNotice::BadFrame { code: "PROTOCOL_ERROR" });
                    return;
                };
                if let Some(waiter) = self.waiters.lock().await.remove(&ts) {
                    let _ = waiter.send(Ok(()));
                } else {
                    // No waiter registered: a heartbeat echo.
                    self.hb_acked.fetch_max(ts, Ordering::SeqCst);
                }
            }
            MessageKind::PairAck => match PairAckPayload::from_json(&msg.payload) {
                Ok(payload) => {
                    let _ = self.pair_ack_tx.send(payload);
                }
                Err(e) => {
                    warn!(error = %e, "malformed PAIR_ACK payload");
                    let _ = self.notice_tx.send(LinkNotice::BadFrame { code: "PROTOCOL_ERROR" });
                }
            },
            MessageKind::Heartbeat => {
                let ack = Message::ack(msg.timestamp);
                if let Err(e) = self.send(ack).await {
                    debug!(error = %e, "failed to ack peer heartbeat");
                }
            }
            MessageKind::PairReq => {
                // The central never receives PAIR_REQ.
                warn!("unexpected PAIR_REQ from peer, dropping");
                let _ = self.notice_tx.send(LinkNotice::BadFrame { code: "PROTOCOL_ERROR" });
            }
            MessageKind::Text | MessageKind::Command => {
                let session = self.session.lock().await;
                if let Some(ctx) = session.as_ref() {
                    match ctx.verify_and_decrypt(&mut msg) {
                        Ok(()) => {}
                        Err(BridgeError::Integrity) => {
                            // A single bad frame is not fatal.
                            warn!(kind = msg.kind.as_str(), "inbound checksum mismatch, dropping");
                            let _ = self.notice_tx.send(LinkNotice::Integrity);
                            return;
                        }
                        Err(e) => {
                            // Passing checksum but failing AES means key
                            // divergence. The session cannot continue.
                            drop(session);
                            error!(error = %e, "decrypt failure after valid checksum");
                            self.close_session().await;
                            self.link.disconnect().await;
                            return;
                        }
                    }
                }
                let _ = self.inbound_tx.send(msg);
            }
        }
    }
}
