//! BLE central link manager.
//!
//! Owns the GATT handle and the connection state machine. All state
//! transitions happen here — consumers watch [`ConnectionState`] through a
//! `watch` channel and never write it. Inbound notifications are reassembled
//! and parsed into [`Message`]s in arrival order, which equals the peer's
//! send order because BLE notifications are ordered per characteristic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use s2p_core::backoff::ReconnectPolicy;
use s2p_core::config::LinkConfig;
use s2p_core::framing::{chunk, Reassembler};
use s2p_core::message::{Message, MessageKind};
use s2p_core::{BridgeError, BridgeResult};

use crate::ble::{BleAdapter, BleLink, LinkEvent, PeerInfo, PeerStatus, DEFAULT_ATT_MTU};

/// Connection lifecycle. The link manager is the sole writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    AwaitingPairing,
    Connected,
    Reconnecting,
    Failed,
}

/// Out-of-band events surfaced alongside the state: dropped frames, queue
/// overflow, peer status bytes. Fatal conditions move the state instead.
#[derive(Debug, Clone)]
pub enum LinkNotice {
    PeerStatus(PeerStatus),
    /// An inbound frame was dropped (bad framing, bad JSON, over-cap).
    BadFrame { code: &'static str },
    /// An inbound message failed checksum verification and was dropped.
    Integrity,
    /// The outbound queue overflowed and a message was dropped.
    QueueOverflow { dropped: MessageKind },
    LinkLost { reason: String },
    /// Reconnect attempts are exhausted.
    ReconnectFailed,
}

struct Active {
    link: Box<dyn BleLink>,
    mtu: u16,
    event_task: JoinHandle<()>,
}

pub struct LinkManager {
    adapter: Arc<dyn BleAdapter>,
    cfg: LinkConfig,
    state_tx: watch::Sender<ConnectionState>,
    notice_tx: broadcast::Sender<LinkNotice>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    active: Mutex<Option<Active>>,
    /// Last peer we established to, plus whether a pairing backs it.
    last_peer: Mutex<Option<(PeerInfo, bool)>>,
    intentional: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkManager {
    pub fn new(adapter: Arc<dyn BleAdapter>, cfg: LinkConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (notice_tx, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            adapter,
            cfg,
            state_tx,
            notice_tx,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            active: Mutex::new(None),
            last_peer: Mutex::new(None),
            intentional: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            scan_task: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Observe link notices (dropped frames, overflow, peer status).
    pub fn notices(&self) -> broadcast::Receiver<LinkNotice> {
        self.notice_tx.subscribe()
    }

    pub(crate) fn notice_sender(&self) -> broadcast::Sender<LinkNotice> {
        self.notice_tx.clone()
    }

    /// The inbound message stream, in arrival order. Can be taken once;
    /// the transport owns it.
    pub async fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbound_rx.lock().await.take()
    }

    /// The peer the manager last established to, if any.
    pub async fn current_peer(&self) -> Option<PeerInfo> {
        self.last_peer.lock().await.as_ref().map(|(p, _)| p.clone())
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = *self.state_tx.borrow();
        if prev != next {
            debug!(?prev, ?next, "connection state");
            self.state_tx.send_replace(next);
        }
    }

    /// Begin scanning for peers advertising the service.
    ///
    /// Emits peers deduplicated by address (re-emitted when their RSSI
    /// changes) and auto-stops after the configured window.
    pub async fn start_scan(self: &Arc<Self>) -> BridgeResult<mpsc::Receiver<PeerInfo>> {
        let cur = self.state();
        if !matches!(cur, ConnectionState::Disconnected | ConnectionState::Failed) {
            return Err(BridgeError::link(format!("cannot scan while {cur:?}")));
        }
        self.set_state(ConnectionState::Scanning);

        let mut raw = match self.adapter.start_scan().await {
            Ok(rx) => rx,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(32);
        let this = Arc::clone(self);
        let window = Duration::from_secs(self.cfg.scan_window_secs);
        let task = tokio::spawn(async move {
            let mut seen: HashMap<String, Option<i16>> = HashMap::new();
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    item = raw.recv() => match item {
                        Some(info) => {
                            let fresh = seen.get(&info.address) != Some(&info.rssi);
                            if fresh {
                                seen.insert(info.address.clone(), info.rssi);
                                if tx.send(info).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = this.adapter.stop_scan().await;
            if this.state() == ConnectionState::Scanning {
                this.set_state(ConnectionState::Disconnected);
            }
        });
        *self.scan_task.lock().await = Some(task);
        Ok(rx)
    }

    /// Connect to a scanned peer.
    ///
    /// `paired` tells the state machine whether a stored pairing backs this
    /// peer: with one, the link goes straight to CONNECTED; without, it
    /// parks in AWAITING_PAIRING for the handshake.
    pub async fn connect(self: &Arc<Self>, peer: &PeerInfo, paired: bool) -> BridgeResult<()> {
        let cur = self.state();
        if !matches!(
            cur,
            ConnectionState::Disconnected | ConnectionState::Scanning | ConnectionState::Failed
        ) {
            return Err(BridgeError::link(format!("cannot connect while {cur:?}")));
        }

        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
        }
        let _ = self.adapter.stop_scan().await;

        self.intentional.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        match self.establish(peer, paired).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>, peer: &PeerInfo, paired: bool) -> BridgeResult<()> {
        let timeout = Duration::from_secs(self.cfg.connect_timeout_secs);
        let (link, events) = self
            .adapter
            .connect(&peer.address, self.cfg.mtu_target, timeout)
            .await?;
        let mtu = link.mtu().max(DEFAULT_ATT_MTU);

        let event_task = self.spawn_event_task(events);
        *self.active.lock().await = Some(Active { link, mtu, event_task });
        *self.last_peer.lock().await = Some((peer.clone(), paired));

        self.set_state(if paired {
            ConnectionState::Connected
        } else {
            ConnectionState::AwaitingPairing
        });
        info!(peer = %peer.address, mtu, paired, "link established");
        Ok(())
    }

    fn spawn_event_task(self: &Arc<Self>, mut events: mpsc::Receiver<LinkEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let cap = self.cfg.reassembly_cap_bytes;
        tokio::spawn(async move {
            let mut asm = Reassembler::with_capacity(cap);
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Notification(packet) => match asm.push(&packet) {
                        Ok(Some(bytes)) => this.deliver_frame(bytes),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "dropping inbound frame");
                            let _ = this
                                .notice_tx
                                .send(LinkNotice::BadFrame { code: e.error_code() });
                        }
                    },
                    LinkEvent::Status(status) => {
                        debug!(?status, "peer status");
                        let _ = this.notice_tx.send(LinkNotice::PeerStatus(status));
                    }
                    LinkEvent::Disconnected => {
                        this.handle_link_loss("peer dropped the link", false).await;
                        return;
                    }
                }
            }
        })
    }

    fn deliver_frame(&self, bytes: Vec<u8>) {
        let parsed = String::from_utf8(bytes)
            .map_err(|e| BridgeError::protocol(format!("frame is not UTF-8: {e}")))
            .and_then(|text| Message::from_json(&text));
        match parsed {
            Ok(msg) => {
                let _ = self.inbound_tx.send(msg);
            }
            Err(e) => {
                warn!(error = %e, "dropping unparseable message");
                let _ = self.notice_tx.send(LinkNotice::BadFrame { code: e.error_code() });
            }
        }
    }

    /// Chunk `bytes` and write each packet in order, pacing writes when the
    /// platform has no completion signal. Serialized: a message's chunks are
    /// never interleaved with another's.
    pub async fn send_raw(self: &Arc<Self>, bytes: &[u8]) -> BridgeResult<()> {
        let guard = self.active.lock().await;
        let Some(active) = guard.as_ref() else {
            return Err(BridgeError::link("no active link"));
        };
        let packets = chunk(bytes, active.mtu)?;
        let pause = Duration::from_millis(self.cfg.write_pause_ms);

        for packet in &packets {
            if let Err(e) = active.link.write_packet(packet).await {
                drop(guard);
                self.handle_link_loss(&format!("write failed: {e}"), true).await;
                return Err(e);
            }
            if !active.link.has_write_completion() {
                tokio::time::sleep(pause).await;
            }
        }
        Ok(())
    }

    /// Intentional teardown: cancels reconnect and scan, closes GATT,
    /// forgets the peer.
    pub async fn disconnect(&self) {
        self.intentional.store(true, Ordering::SeqCst);
        if let Some(task) = self.reconnect_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
        }
        let _ = self.adapter.stop_scan().await;
        if let Some(active) = self.active.lock().await.take() {
            active.event_task.abort();
            let _ = active.link.disconnect().await;
        }
        *self.last_peer.lock().await = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Called by the pairing flow once a valid PAIR_ACK finished the
    /// handshake.
    pub async fn pairing_complete(&self) {
        if self.state() == ConnectionState::AwaitingPairing {
            if let Some(lp) = self.last_peer.lock().await.as_mut() {
                lp.1 = true;
            }
            self.set_state(ConnectionState::Connected);
        }
    }

    /// Called by the pairing flow when the peer rejected the handshake or it
    /// timed out. Terminal for the attempt.
    pub async fn pairing_failed(&self, reason: &str) {
        warn!(reason, "pairing failed");
        if let Some(active) = self.active.lock().await.take() {
            active.event_task.abort();
            let _ = active.link.disconnect().await;
        }
        self.set_state(ConnectionState::Failed);
    }

    /// Tear the link down and run the reconnect schedule, as if the link had
    /// dropped (used on heartbeat loss).
    pub async fn force_reconnect(self: &Arc<Self>, reason: &str) {
        self.handle_link_loss(reason, true).await;
    }

    async fn handle_link_loss(self: &Arc<Self>, reason: &str, abort_event_task: bool) {
        if self.intentional.load(Ordering::SeqCst) {
            return;
        }
        let was = self.state();
        if !matches!(
            was,
            ConnectionState::Connected | ConnectionState::AwaitingPairing
        ) {
            return;
        }

        if let Some(active) = self.active.lock().await.take() {
            if abort_event_task {
                active.event_task.abort();
            }
            let _ = active.link.disconnect().await;
        }
        warn!(reason, "link lost");
        let _ = self.notice_tx.send(LinkNotice::LinkLost { reason: reason.to_string() });

        if was == ConnectionState::AwaitingPairing {
            // No pairing to fall back on; the attempt is over.
            self.set_state(ConnectionState::Failed);
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        self.spawn_reconnect().await;
    }

    async fn spawn_reconnect(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut policy = ReconnectPolicy::new(
                Duration::from_secs(this.cfg.reconnect_base_delay_secs),
                Duration::from_secs(this.cfg.reconnect_cap_secs),
                this.cfg.reconnect_max_attempts,
            );
            loop {
                let Some(delay) = policy.next_delay() else {
                    warn!("reconnect attempts exhausted");
                    let _ = this.notice_tx.send(LinkNotice::ReconnectFailed);
                    this.set_state(ConnectionState::Disconnected);
                    return;
                };
                info!(attempt = policy.attempt(), ?delay, "scheduling reconnect");
                tokio::time::sleep(delay).await;

                if this.intentional.load(Ordering::SeqCst) {
                    return;
                }
                let Some((peer, paired)) = this.last_peer.lock().await.clone() else {
                    this.set_state(ConnectionState::Disconnected);
                    return;
                };
                match this.establish(&peer, paired).await {
                    Ok(()) => {
                        info!(peer = %peer.address, "reconnected");
                        return;
                    }
                    Err(e) => {
                        warn!(attempt = policy.attempt(), error = %e, "reconnect attempt failed");
                    }
                }
            }
        });
        *self.reconnect_task.lock().await = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockPeer;

    fn test_cfg() -> LinkConfig {
        let mut cfg = LinkConfig::defaults();
        cfg.scan_window_secs = 1;
        cfg.reconnect_base_delay_secs = 0;
        cfg.reconnect_cap_secs = 0;
        cfg
    }

    fn peer_info(addr: &str) -> PeerInfo {
        PeerInfo { address: addr.into(), name: Some("Desk".into()), rssi: Some(-40) }
    }

    #[tokio::test]
    async fn scan_dedupes_by_address() {
        let peer = MockPeer::new(23);
        let sightings = vec![
            peer_info("AA:00"),
            peer_info("AA:00"),
            PeerInfo { address: "AA:00".into(), name: Some("Desk".into()), rssi: Some(-50) },
            peer_info("BB:11"),
        ];
        let manager = LinkManager::new(Arc::new(peer.adapter(sightings)), test_cfg());

        let mut rx = manager.start_scan().await.unwrap();
        let mut got = Vec::new();
        while let Some(info) = rx.recv().await {
            got.push(info);
        }
        // Duplicate with identical RSSI suppressed; changed RSSI re-emitted.
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].rssi, Some(-40));
        assert_eq!(got[1].rssi, Some(-50));
        assert_eq!(got[2].address, "BB:11");
    }

    #[tokio::test]
    async fn connect_routes_state_by_stored_pairing() {
        let peer = MockPeer::new(23);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), test_cfg());

        manager.connect(&peer_info("AA:00"), false).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::AwaitingPairing);

        manager.pairing_complete().await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect(&peer_info("AA:00"), true).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn send_raw_chunks_in_order() {
        let peer = MockPeer::new(23);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), test_cfg());
        manager.connect(&peer_info("AA:00"), true).await.unwrap();

        let payload: Vec<u8> = (0..50).collect();
        manager.send_raw(&payload).await.unwrap();

        let packets = peer.written_packets();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0][0], 0x80);
        assert_eq!(packets[2][0], 0x00);
        let rebuilt: Vec<u8> = packets.iter().flat_map(|p| p[1..].to_vec()).collect();
        assert_eq!(rebuilt, payload);
    }

    #[tokio::test]
    async fn inbound_frames_parse_in_arrival_order() {
        let peer = MockPeer::new(23);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), test_cfg());
        let mut inbound = manager.take_inbound().await.unwrap();
        manager.connect(&peer_info("AA:00"), true).await.unwrap();

        peer.notify_message(&Message::text("first")).await;
        peer.notify_message(&Message::text("second and long enough to span chunks")).await;

        assert_eq!(inbound.recv().await.unwrap().payload, "first");
        assert_eq!(
            inbound.recv().await.unwrap().payload,
            "second and long enough to span chunks"
        );
    }

    #[tokio::test]
    async fn bad_frames_are_dropped_with_notice() {
        let peer = MockPeer::new(23);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), test_cfg());
        let mut notices = manager.notices();
        manager.connect(&peer_info("AA:00"), true).await.unwrap();

        peer.notify(b"\x00not json at all".to_vec()).await;

        match notices.recv().await.unwrap() {
            LinkNotice::BadFrame { code } => assert_eq!(code, "PROTOCOL_ERROR"),
            other => panic!("unexpected notice: {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn link_loss_reconnects_and_recovers() {
        let peer = MockPeer::new(23);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), test_cfg());
        manager.connect(&peer_info("AA:00"), true).await.unwrap();
        let mut state = manager.watch_state();

        peer.drop_link().await;

        // Zero delays in the test config; wait for the second connect to land.
        tokio::time::timeout(Duration::from_secs(5), async {
            while peer.connect_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnect should happen");
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_max_attempts() {
        let peer = MockPeer::new(23);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), test_cfg());
        manager.connect(&peer_info("AA:00"), true).await.unwrap();
        let mut state = manager.watch_state();
        let mut notices = manager.notices();

        peer.fail_next_connects(u32::MAX);
        peer.drop_link().await;

        state.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();
        // 1 initial + 5 failed reconnect attempts.
        assert_eq!(peer.connect_count(), 6);
        loop {
            if matches!(notices.recv().await.unwrap(), LinkNotice::ReconnectFailed) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn intentional_disconnect_suppresses_reconnect() {
        let peer = MockPeer::new(23);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), test_cfg());
        manager.connect(&peer_info("AA:00"), true).await.unwrap();

        manager.disconnect().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(peer.connect_count(), 1);
    }

    #[tokio::test]
    async fn forbidden_transitions_are_rejected() {
        let peer = MockPeer::new(23);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), test_cfg());
        manager.connect(&peer_info("AA:00"), true).await.unwrap();

        // Connected → Connecting is not in the table.
        assert!(manager.connect(&peer_info("BB:11"), true).await.is_err());
        assert_eq!(manager.state(), ConnectionState::Connected);

        // Connected → Scanning is not in the table either.
        assert!(manager.start_scan().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Connected);

        // pairing_complete outside AWAITING_PAIRING is a no-op.
        manager.pairing_complete().await;
        assert_eq!(manager.state(), ConnectionState::Connected);
    }
}
