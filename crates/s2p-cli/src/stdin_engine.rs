//! Line-oriented stand-in for the OS speech engine.
//!
//! The real recognizer lives in the platform shell; this engine lets the
//! bridge run end-to-end from a terminal — every line typed on stdin is
//! delivered as a final recognition result.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use s2p_core::config::SpeechConfig;
use s2p_core::BridgeResult;
use s2p_speech::{EngineHandle, RecognizerEvent, SpeechEngine};

type EventSender = mpsc::UnboundedSender<RecognizerEvent>;

pub struct StdinEngine {
    /// Event sender of the current session; the reader task always feeds
    /// the newest one.
    current: Arc<Mutex<Option<EventSender>>>,
}

impl StdinEngine {
    pub fn new() -> Arc<Self> {
        let current: Arc<Mutex<Option<EventSender>>> = Arc::default();
        let shared = Arc::clone(&current);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let tx = shared.lock().unwrap().clone();
                if let Some(tx) = tx {
                    let _ = tx.send(RecognizerEvent::Final(line));
                }
            }
        });
        Arc::new(Self { current })
    }
}

#[async_trait]
impl SpeechEngine for StdinEngine {
    async fn create(
        &self,
        _locale: &str,
        _cfg: &SpeechConfig,
    ) -> BridgeResult<(Box<dyn EngineHandle>, mpsc::UnboundedReceiver<RecognizerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.current.lock().unwrap() = Some(tx.clone());
        Ok((Box::new(StdinHandle { tx }), rx))
    }
}

struct StdinHandle {
    tx: EventSender,
}

#[async_trait]
impl EngineHandle for StdinHandle {
    async fn start(&self) -> BridgeResult<()> {
        let _ = self.tx.send(RecognizerEvent::ReadyForSpeech);
        Ok(())
    }

    async fn stop(&self) -> BridgeResult<()> {
        Ok(())
    }

    async fn cancel(&self) -> BridgeResult<()> {
        Ok(())
    }
}
