//! Turns recognized utterances into transport messages.
//!
//! Finals arriving in quick succession are debounced into one buffer, run
//! through the command parser, and emitted in order: TEXT before, COMMAND,
//! TEXT after. Each message awaits its own acknowledgement; a failed send is
//! logged and surfaced but never stalls the queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use s2p_core::config::SpeechConfig;
use s2p_core::message::CommandCode;
use s2p_core::BridgeResult;
use s2p_link::Transport;

use crate::commands::CommandParser;

/// Where dispatched messages go. The transport in production; a recorder in
/// tests.
#[async_trait]
pub trait DispatchSink: Send + Sync + 'static {
    async fn dispatch_text(&self, text: &str) -> BridgeResult<()>;
    async fn dispatch_command(&self, code: CommandCode) -> BridgeResult<()>;
}

#[async_trait]
impl DispatchSink for Transport {
    async fn dispatch_text(&self, text: &str) -> BridgeResult<()> {
        self.send_text(text).await.map(|_| ())
    }

    async fn dispatch_command(&self, code: CommandCode) -> BridgeResult<()> {
        self.send_command(code).await.map(|_| ())
    }
}

pub struct Dispatcher {
    sink: Arc<dyn DispatchSink>,
    parser: CommandParser,
    debounce: Duration,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn DispatchSink>, cfg: &SpeechConfig) -> Self {
        Self {
            sink,
            parser: CommandParser::new(),
            debounce: Duration::from_millis(cfg.debounce_ms),
        }
    }

    /// Consume final results until the channel closes.
    pub fn spawn(self, mut finals: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(first) = finals.recv().await {
                let mut buffer = first;
                // Hold the buffer open while more finals land inside the
                // debounce window.
                loop {
                    match tokio::time::timeout(self.debounce, finals.recv()).await {
                        Ok(Some(next)) => {
                            if !buffer.is_empty() {
                                buffer.push(' ');
                            }
                            buffer.push_str(&next);
                        }
                        Ok(None) => {
                            self.dispatch(&buffer).await;
                            return;
                        }
                        Err(_) => break,
                    }
                }
                self.dispatch(&buffer).await;
            }
        })
    }

    async fn dispatch(&self, utterance: &str) {
        let parsed = self.parser.process(utterance);
        debug!(
            text = ?parsed.text_before,
            command = ?parsed.command,
            after = ?parsed.text_after,
            "dispatching utterance"
        );

        if let Some(text) = parsed.text_before {
            if let Err(e) = self.sink.dispatch_text(&text).await {
                warn!(error = %e, "failed to deliver text");
            }
        }
        if let Some(code) = parsed.command {
            if let Err(e) = self.sink.dispatch_command(code).await {
                warn!(error = %e, code = code.as_str(), "failed to deliver command");
            }
        }
        if let Some(text) = parsed.text_after {
            if let Err(e) = self.sink.dispatch_text(&text).await {
                warn!(error = %e, "failed to deliver text");
            }
        }
    }
}
