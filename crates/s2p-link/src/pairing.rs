//! Pairing: the PIN handshake and the at-rest-encrypted pairing store.
//!
//! The store maps `peer_address` → pairing record. Records are AES-GCM
//! encrypted under a per-install store key before they touch disk, so shared
//! keys never rest in the clear. Store operations are coarse-grained and
//! serialized behind one mutex.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use s2p_core::crypto::{self, CryptoContext, KEY_SIZE};
use s2p_core::message::{Message, PairAckPayload, PairRequestPayload, PairStatus};
use s2p_core::{BridgeError, BridgeResult};

use crate::manager::{ConnectionState, LinkManager};
use crate::transport::Transport;

const DEVICE_ID_ENTRY: &str = "device_id";
const PAIRINGS_ENTRY: &str = "pairings";
const STORE_KEY_FILE: &str = "store.key";

/// Platform keystore: an at-rest-encrypted KV store.
#[async_trait]
pub trait Keystore: Send + Sync + 'static {
    async fn put_bytes(&self, name: &str, bytes: &[u8]) -> BridgeResult<()>;
    async fn get_bytes(&self, name: &str) -> BridgeResult<Option<Vec<u8>>>;
    async fn delete(&self, name: &str) -> BridgeResult<()>;
}

fn io_err(e: std::io::Error) -> BridgeError {
    BridgeError::Keystore { message: e.to_string() }
}

/// File-backed keystore. Values are encrypted with a per-install store key
/// generated on first use.
pub struct FileKeystore {
    dir: PathBuf,
    store_key: Mutex<Option<[u8; KEY_SIZE]>>,
}

impl FileKeystore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), store_key: Mutex::new(None) }
    }

    async fn store_key(&self) -> BridgeResult<[u8; KEY_SIZE]> {
        let mut cached = self.store_key.lock().await;
        if let Some(key) = *cached {
            return Ok(key);
        }

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let path = self.dir.join(STORE_KEY_FILE);
        let key = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| BridgeError::Keystore { message: "store key corrupted".into() })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut key = [0u8; KEY_SIZE];
                use rand::RngCore;
                rand::rngs::OsRng.fill_bytes(&mut key);
                tokio::fs::write(&path, key).await.map_err(io_err)?;
                key
            }
            Err(e) => return Err(io_err(e)),
        };
        *cached = Some(key);
        Ok(key)
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.dat"))
    }
}

#[async_trait]
impl Keystore for FileKeystore {
    async fn put_bytes(&self, name: &str, bytes: &[u8]) -> BridgeResult<()> {
        let key = self.store_key().await?;
        let sealed = crypto::encrypt(&BASE64.encode(bytes), &key)?;
        tokio::fs::write(self.entry_path(name), sealed).await.map_err(io_err)
    }

    async fn get_bytes(&self, name: &str) -> BridgeResult<Option<Vec<u8>>> {
        let sealed = match tokio::fs::read_to_string(self.entry_path(name)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };
        let key = self.store_key().await?;
        let encoded = crypto::decrypt(&sealed, &key)?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| BridgeError::Keystore { message: format!("corrupt entry: {e}") })?;
        Ok(Some(bytes))
    }

    async fn delete(&self, name: &str) -> BridgeResult<()> {
        match tokio::fs::remove_file(self.entry_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}

/// Ephemeral keystore for tests and dry runs.
#[derive(Default)]
pub struct MemoryKeystore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn put_bytes(&self, name: &str, bytes: &[u8]) -> BridgeResult<()> {
        self.entries.lock().await.insert(name.into(), bytes.to_vec());
        Ok(())
    }

    async fn get_bytes(&self, name: &str) -> BridgeResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(name).cloned())
    }

    async fn delete(&self, name: &str) -> BridgeResult<()> {
        self.entries.lock().await.remove(name);
        Ok(())
    }
}

/// A persisted pairing. Unique by `peer_address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedPeer {
    pub peer_address: String,
    pub peer_name: Option<String>,
    pub peer_device_id: String,
    /// 32-byte shared key, base64 in the at-rest record.
    pub shared_key: String,
    pub paired_at: DateTime<Utc>,
    pub last_connected: Option<DateTime<Utc>>,
}

impl PairedPeer {
    pub fn key_bytes(&self) -> BridgeResult<[u8; KEY_SIZE]> {
        let bytes = BASE64
            .decode(&self.shared_key)
            .map_err(|e| BridgeError::Keystore { message: format!("corrupt shared key: {e}") })?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| BridgeError::InvalidKeyLength { actual: bytes.len() })
    }
}

/// Pairing records plus the stable local device identity.
pub struct PairingStore {
    keystore: Box<dyn Keystore>,
    lock: Mutex<()>,
}

impl PairingStore {
    pub fn new(keystore: Box<dyn Keystore>) -> Self {
        Self { keystore, lock: Mutex::new(()) }
    }

    /// The stable per-install device id: generated once, persisted forever.
    pub async fn local_device_id(&self) -> BridgeResult<String> {
        let _guard = self.lock.lock().await;
        if let Some(bytes) = self.keystore.get_bytes(DEVICE_ID_ENTRY).await? {
            return String::from_utf8(bytes)
                .map_err(|_| BridgeError::Keystore { message: "corrupt device id".into() });
        }
        let id = crypto::generate_device_id();
        self.keystore.put_bytes(DEVICE_ID_ENTRY, id.as_bytes()).await?;
        Ok(id)
    }

    pub async fn save(&self, peer: PairedPeer) -> BridgeResult<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_map().await?;
        map.insert(peer.peer_address.clone(), peer);
        self.save_map(&map).await
    }

    pub async fn get(&self, address: &str) -> BridgeResult<Option<PairedPeer>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_map().await?.remove(address))
    }

    pub async fn forget(&self, address: &str) -> BridgeResult<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_map().await?;
        if map.remove(address).is_some() {
            self.save_map(&map).await?;
        }
        Ok(())
    }

    /// Record a successful connection to a known peer, optionally refreshing
    /// its device id.
    pub async fn touch(&self, address: &str, peer_device_id: Option<&str>) -> BridgeResult<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_map().await?;
        if let Some(peer) = map.get_mut(address) {
            peer.last_connected = Some(Utc::now());
            if let Some(id) = peer_device_id {
                peer.peer_device_id = id.to_string();
            }
            self.save_map(&map).await?;
        }
        Ok(())
    }

    pub async fn list(&self) -> BridgeResult<Vec<PairedPeer>> {
        let _guard = self.lock.lock().await;
        let mut peers: Vec<_> = self.load_map().await?.into_values().collect();
        peers.sort_by(|a, b| a.peer_address.cmp(&b.peer_address));
        Ok(peers)
    }

    async fn load_map(&self) -> BridgeResult<HashMap<String, PairedPeer>> {
        match self.keystore.get_bytes(PAIRINGS_ENTRY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| BridgeError::Keystore { message: format!("corrupt pairings: {e}") }),
            None => Ok(HashMap::new()),
        }
    }

    async fn save_map(&self, map: &HashMap<String, PairedPeer>) -> BridgeResult<()> {
        let bytes = serde_json::to_vec(map)
            .map_err(|e| BridgeError::Keystore { message: e.to_string() })?;
        self.keystore.put_bytes(PAIRINGS_ENTRY, &bytes).await
    }
}

/// Drives the pairing handshake over the transport.
pub struct PairingFlow {
    link: Arc<LinkManager>,
    transport: Arc<Transport>,
    store: Arc<PairingStore>,
    device_name: String,
    pair_acks: Mutex<mpsc::UnboundedReceiver<PairAckPayload>>,
    response_timeout: Duration,
}

impl PairingFlow {
    /// Takes ownership of the transport's PAIR_ACK stream; construct once.
    pub async fn new(
        link: Arc<LinkManager>,
        transport: Arc<Transport>,
        store: Arc<PairingStore>,
        device_name: impl Into<String>,
    ) -> BridgeResult<Arc<Self>> {
        let pair_acks = transport
            .take_pair_acks()
            .await
            .ok_or_else(|| BridgeError::pairing("pairing flow already constructed"))?;
        Ok(Arc::new(Self {
            link,
            transport,
            store,
            device_name: device_name.into(),
            pair_acks: Mutex::new(pair_acks),
            response_timeout: Duration::from_secs(10),
        }))
    }

    /// Fresh pairing with the PIN shown on the peer's screen.
    ///
    /// The link must be in AWAITING_PAIRING. On success the derived key is
    /// persisted, the session is installed, and the link moves to CONNECTED
    /// (which also flushes anything queued meanwhile).
    pub async fn pair(&self, pin: &str) -> BridgeResult<PairedPeer> {
        let state = self.link.state();
        if state != ConnectionState::AwaitingPairing {
            return Err(BridgeError::pairing(format!("cannot pair while {state:?}")));
        }
        let peer = self
            .link
            .current_peer()
            .await
            .ok_or_else(|| BridgeError::pairing("no peer to pair with"))?;

        let local_id = self.store.local_device_id().await?;
        self.send_pair_req(&local_id).await?;

        let ack = self.await_pair_ack().await?;
        let peer_device_id = match validate_ack(ack) {
            Ok(id) => id,
            Err(e) => {
                self.link.pairing_failed(&e.to_string()).await;
                return Err(e);
            }
        };

        let key = crypto::derive_key(pin, &local_id, &peer_device_id);
        let now = Utc::now();
        let record = PairedPeer {
            peer_address: peer.address.clone(),
            peer_name: peer.name.clone(),
            peer_device_id,
            shared_key: BASE64.encode(key),
            paired_at: now,
            last_connected: Some(now),
        };
        self.store.save(record.clone()).await?;
        self.transport.install_session(CryptoContext::new(key)).await;
        self.link.pairing_complete().await;

        info!(peer = %peer.address, "paired");
        Ok(record)
    }

    /// Watch for CONNECTED transitions and silently restore known-peer
    /// sessions: install the stored key (no PIN involved) and send a
    /// PAIR_REQ to refresh the peer's device id.
    pub fn spawn_resume_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut state_rx = this.link.watch_state();
            loop {
                if state_rx
                    .wait_for(|s| *s == ConnectionState::Connected)
                    .await
                    .is_err()
                {
                    return;
                }
                if !this.transport.has_session().await {
                    if let Err(e) = this.resume().await {
                        warn!(error = %e, "silent session restore failed");
                    }
                }
                if state_rx
                    .wait_for(|s| *s != ConnectionState::Connected)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        })
    }

    /// Restore the session for the currently connected, already-paired peer.
    async fn resume(&self) -> BridgeResult<()> {
        let peer = self
            .link
            .current_peer()
            .await
            .ok_or_else(|| BridgeError::pairing("no connected peer"))?;
        let stored = self
            .store
            .get(&peer.address)
            .await?
            .ok_or_else(|| BridgeError::pairing(format!("no stored pairing for {}", peer.address)))?;

        let ctx = CryptoContext::new(stored.key_bytes()?);
        self.transport.install_session(ctx).await;

        // Still announce ourselves; a fresh PAIR_ACK carries the peer's
        // current device id.
        let local_id = self.store.local_device_id().await?;
        self.send_pair_req(&local_id).await?;
        match self.await_pair_ack().await {
            Ok(ack) if ack.status == PairStatus::Ok && !ack.device_id.trim().is_empty() => {
                self.store.touch(&peer.address, Some(&ack.device_id)).await?;
            }
            Ok(_) | Err(_) => {
                // The stored session still stands; just note the reconnect.
                self.store.touch(&peer.address, None).await?;
            }
        }
        info!(peer = %peer.address, "session restored from store");
        Ok(())
    }

    async fn send_pair_req(&self, local_id: &str) -> BridgeResult<()> {
        let req = PairRequestPayload::new(local_id).with_name(&self.device_name);
        self.transport.send(Message::pair_req(&req)?).await?;
        Ok(())
    }

    async fn await_pair_ack(&self) -> BridgeResult<PairAckPayload> {
        let mut rx = self.pair_acks.lock().await;
        match tokio::time::timeout(self.response_timeout, rx.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(BridgeError::pairing("transport closed")),
            Err(_) => {
                self.link.pairing_failed("no PAIR_ACK from peer").await;
                Err(BridgeError::pairing("pairing response timed out"))
            }
        }
    }
}

/// A PAIR_ACK is only acceptable with status OK and a usable device id —
/// peers that omit it cannot key the session.
fn validate_ack(ack: PairAckPayload) -> BridgeResult<String> {
    match ack.status {
        PairStatus::Error => Err(BridgeError::pairing(
            ack.error.unwrap_or_else(|| "peer rejected pairing".into()),
        )),
        PairStatus::Ok if ack.device_id.trim().is_empty() => {
            Err(BridgeError::pairing("PAIR_ACK missing device_id"))
        }
        PairStatus::Ok => Ok(ack.device_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockPeer;
    use crate::ble::PeerInfo;
    use s2p_core::config::LinkConfig;
    use s2p_core::message::MessageKind;

    fn peer_info() -> PeerInfo {
        PeerInfo { address: "AA:00".into(), name: Some("Desk".into()), rssi: Some(-40) }
    }

    async fn seeded_store(local_id: &str) -> Arc<PairingStore> {
        let keystore = MemoryKeystore::new();
        keystore.put_bytes(DEVICE_ID_ENTRY, local_id.as_bytes()).await.unwrap();
        Arc::new(PairingStore::new(Box::new(keystore)))
    }

    struct Rig {
        peer: MockPeer,
        manager: Arc<LinkManager>,
        transport: Arc<Transport>,
        flow: Arc<PairingFlow>,
        store: Arc<PairingStore>,
    }

    async fn rig(mtu: u16, local_id: &str) -> Rig {
        let peer = MockPeer::new(mtu);
        let manager = LinkManager::new(Arc::new(peer.adapter(vec![])), LinkConfig::defaults());
        let transport = Transport::new(Arc::clone(&manager), LinkConfig::defaults());
        transport.start().await.unwrap();
        let store = seeded_store(local_id).await;
        let flow = PairingFlow::new(
            Arc::clone(&manager),
            Arc::clone(&transport),
            Arc::clone(&store),
            "Test Handheld",
        )
        .await
        .unwrap();
        Rig { peer, manager, transport, flow, store }
    }

    #[tokio::test]
    async fn store_round_trips_and_forgets() {
        let store = seeded_store("local-1").await;
        assert_eq!(store.local_device_id().await.unwrap(), "local-1");
        assert!(store.get("AA:00").await.unwrap().is_none());

        let record = PairedPeer {
            peer_address: "AA:00".into(),
            peer_name: Some("Desk".into()),
            peer_device_id: "desk-1".into(),
            shared_key: BASE64.encode([7u8; KEY_SIZE]),
            paired_at: Utc::now(),
            last_connected: None,
        };
        store.save(record).await.unwrap();

        let loaded = store.get("AA:00").await.unwrap().unwrap();
        assert_eq!(loaded.peer_device_id, "desk-1");
        assert_eq!(loaded.key_bytes().unwrap(), [7u8; KEY_SIZE]);

        store.touch("AA:00", Some("desk-2")).await.unwrap();
        let touched = store.get("AA:00").await.unwrap().unwrap();
        assert_eq!(touched.peer_device_id, "desk-2");
        assert!(touched.last_connected.is_some());

        store.forget("AA:00").await.unwrap();
        assert!(store.get("AA:00").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn device_id_is_generated_once() {
        let store = Arc::new(PairingStore::new(Box::new(MemoryKeystore::new())));
        let first = store.local_device_id().await.unwrap();
        let second = store.local_device_id().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[tokio::test]
    async fn file_keystore_encrypts_at_rest() {
        let dir = std::env::temp_dir().join(format!("s2p-ks-{}", crypto::generate_device_id()));
        let keystore = FileKeystore::new(&dir);

        keystore.put_bytes("secret", b"attack at dawn").await.unwrap();
        assert_eq!(keystore.get_bytes("secret").await.unwrap().unwrap(), b"attack at dawn");

        // Nothing legible on disk.
        let raw = std::fs::read_to_string(dir.join("secret.dat")).unwrap();
        assert!(!raw.contains("attack at dawn"));

        keystore.delete("secret").await.unwrap();
        assert!(keystore.get_bytes("secret").await.unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Fresh pairing at the minimum MTU, then one spoken phrase — the full
    /// happy path on the wire.
    #[tokio::test]
    async fn fresh_pairing_then_text_at_min_mtu() {
        let rig = rig(23, "A").await;
        rig.manager.connect(&peer_info(), false).await.unwrap();
        assert_eq!(rig.manager.state(), ConnectionState::AwaitingPairing);

        let flow = Arc::clone(&rig.flow);
        let pair_task = tokio::spawn(async move { flow.pair("123456").await });

        // Peer side: PAIR_REQ arrives unencrypted and unsigned.
        let msgs = rig.peer.wait_for_messages(0).await;
        let req = &msgs[0];
        assert_eq!(req.kind, MessageKind::PairReq);
        assert!(req.checksum.is_empty());
        let req_payload = PairRequestPayload::from_json(&req.payload).unwrap();
        assert_eq!(req_payload.device_id, "A");
        assert_eq!(req_payload.device_name.as_deref(), Some("Test Handheld"));

        // Peer replies PAIR_ACK, also in the clear.
        let ack = PairAckPayload {
            device_id: "B".into(),
            status: PairStatus::Ok,
            error: None,
        };
        rig.peer.notify_message(&Message::pair_ack(&ack).unwrap()).await;

        let record = pair_task.await.unwrap().unwrap();
        assert_eq!(record.peer_device_id, "B");
        assert_eq!(rig.manager.state(), ConnectionState::Connected);
        assert!(rig.transport.has_session().await);
        assert_eq!(
            record.key_bytes().unwrap(),
            crypto::derive_key("123456", "A", "B")
        );

        // Now speak: the TEXT goes out encrypted, chunked for MTU 23.
        let transport = Arc::clone(&rig.transport);
        let send = tokio::spawn(async move { transport.send_text("hello world").await });

        let msgs = rig.peer.wait_for_messages(1).await;
        let wire = msgs.iter().find(|m| m.kind == MessageKind::Text).unwrap();
        assert_eq!(wire.checksum.len(), 8);

        let peer_ctx = CryptoContext::from_pin("123456", "A", "B");
        let mut copy = wire.clone();
        peer_ctx.verify_and_decrypt(&mut copy).unwrap();
        assert_eq!(copy.payload, "hello world");

        // ⌈len/19⌉ packets, only the last clears HAS_MORE.
        let packets = rig.peer.written_packets();
        let json_len = wire.to_json().unwrap().len();
        let expected = json_len.div_ceil(19);
        let text_packets = &packets[packets.len() - expected..];
        for p in &text_packets[..expected - 1] {
            assert_eq!(p[0], 0x80);
        }
        assert_eq!(text_packets[expected - 1][0], 0x00);

        rig.peer.notify_message(&Message::ack(wire.timestamp)).await;
        assert_eq!(send.await.unwrap().unwrap(), crate::transport::SendOutcome::Acked);
    }

    #[tokio::test]
    async fn pair_ack_error_fails_the_attempt() {
        let rig = rig(64, "A").await;
        rig.manager.connect(&peer_info(), false).await.unwrap();

        let flow = Arc::clone(&rig.flow);
        let pair_task = tokio::spawn(async move { flow.pair("123456").await });
        rig.peer.wait_for_messages(0).await;

        let nack = PairAckPayload {
            device_id: "B".into(),
            status: PairStatus::Error,
            error: Some("user declined".into()),
        };
        rig.peer.notify_message(&Message::pair_ack(&nack).unwrap()).await;

        let err = pair_task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Pairing { .. }));
        assert_eq!(rig.manager.state(), ConnectionState::Failed);
        assert!(!rig.transport.has_session().await);
        assert!(rig.store.get("AA:00").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pair_ack_without_device_id_is_rejected() {
        let rig = rig(64, "A").await;
        rig.manager.connect(&peer_info(), false).await.unwrap();

        let flow = Arc::clone(&rig.flow);
        let pair_task = tokio::spawn(async move { flow.pair("123456").await });
        rig.peer.wait_for_messages(0).await;

        let ack = PairAckPayload { device_id: "  ".into(), status: PairStatus::Ok, error: None };
        rig.peer.notify_message(&Message::pair_ack(&ack).unwrap()).await;

        let err = pair_task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Pairing { .. }));
        assert_eq!(rig.manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn known_peer_reconnect_restores_session_without_pin() {
        let rig = rig(64, "A").await;

        // Pre-seed the store as if a pairing had happened earlier.
        let key = crypto::derive_key("123456", "A", "B");
        rig.store
            .save(PairedPeer {
                peer_address: "AA:00".into(),
                peer_name: Some("Desk".into()),
                peer_device_id: "B".into(),
                shared_key: BASE64.encode(key),
                paired_at: Utc::now(),
                last_connected: None,
            })
            .await
            .unwrap();

        let _watcher = rig.flow.spawn_resume_watcher();
        rig.manager.connect(&peer_info(), true).await.unwrap();
        assert_eq!(rig.manager.state(), ConnectionState::Connected);

        // The watcher still sends PAIR_REQ to refresh the peer device id.
        let msgs = rig.peer.wait_for_messages(0).await;
        assert_eq!(msgs[0].kind, MessageKind::PairReq);
        let ack = PairAckPayload { device_id: "B2".into(), status: PairStatus::Ok, error: None };
        rig.peer.notify_message(&Message::pair_ack(&ack).unwrap()).await;

        // Session restored from the store, no PIN involved.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !rig.transport.has_session().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session should be restored");

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let peer = rig.store.get("AA:00").await.unwrap().unwrap();
                if peer.peer_device_id == "B2" && peer.last_connected.is_some() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("store should record the refreshed device id");
    }
}
