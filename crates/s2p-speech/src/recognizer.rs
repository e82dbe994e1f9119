//! Recognizer supervision: the IDLE/STARTING/LISTENING/STOPPING state
//! machine, watchdog recovery, and restart pacing.
//!
//! The OS engine sits behind [`SpeechEngine`]; a handle to it is created
//! lazily on the first start and destroyed on stop, on fatal error, or when
//! the watchdog decides the engine is wedged. Consumers observe state and
//! sound level through `watch` channels, partial results through a
//! broadcast, and final results through the channel feeding the dispatcher.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use s2p_core::backoff::{ErrorClass, RestartDecision, RestartPolicy};
use s2p_core::config::SpeechConfig;
use s2p_core::{BridgeError, BridgeResult};

/// Recognizer lifecycle. Valid transitions: IDLE→STARTING→LISTENING→
/// STOPPING→IDLE, nothing else (forced teardown excepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerState {
    Idle,
    Starting,
    Listening,
    Stopping,
}

/// Engine failure codes, pre-classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerFault {
    /// Silence until the engine gave up. Expected noise.
    NoSpeech,
    /// The segment timed out without usable audio.
    SpeechTimeout,
    /// The engine was still busy with the previous session.
    Busy,
    /// The service asked us to slow down.
    RateLimited,
    /// Microphone permission missing or revoked.
    Permission,
    /// Audio subsystem failure.
    Audio,
    /// Network-backed recognition unreachable.
    Network,
    /// Recognition service error.
    Server,
    /// Locale not supported by the engine.
    Language,
}

impl RecognizerFault {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoSpeech | Self::SpeechTimeout | Self::Busy => ErrorClass::Transient,
            Self::RateLimited => ErrorClass::RateLimited,
            Self::Permission | Self::Audio | Self::Network | Self::Server | Self::Language => {
                ErrorClass::Real
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSpeech => "no_speech",
            Self::SpeechTimeout => "speech_timeout",
            Self::Busy => "busy",
            Self::RateLimited => "rate_limited",
            Self::Permission => "permission_denied",
            Self::Audio => "audio_failure",
            Self::Network => "network",
            Self::Server => "server_error",
            Self::Language => "language_unsupported",
        }
    }
}

/// Callbacks from the platform engine, as events.
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    ReadyForSpeech,
    /// Raw input level in dB.
    RmsChanged(f32),
    Partial(String),
    Final(String),
    EndOfSpeech,
    Error(RecognizerFault),
}

/// Platform speech engine factory.
#[async_trait]
pub trait SpeechEngine: Send + Sync + 'static {
    /// Create an engine handle for `locale`, configured with the pause and
    /// session limits. Returns the handle plus its event stream.
    async fn create(
        &self,
        locale: &str,
        cfg: &SpeechConfig,
    ) -> BridgeResult<(Box<dyn EngineHandle>, mpsc::UnboundedReceiver<RecognizerEvent>)>;
}

/// One created OS recognizer.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Begin a listening session.
    async fn start(&self) -> BridgeResult<()>;
    /// End the session, letting a pending final result flush.
    async fn stop(&self) -> BridgeResult<()>;
    /// Abort the session, discarding pending results.
    async fn cancel(&self) -> BridgeResult<()>;
}

/// Map a raw engine dB level into [0, 1] for display.
///
/// The mapping may need per-platform calibration; this is the one the
/// shipped handsets use.
pub fn normalize_rms(db: f32) -> f32 {
    ((db + 2.0) / 12.0).clamp(0.0, 1.0)
}

struct Inner {
    handle: Option<Box<dyn EngineHandle>>,
    pump: Option<JoinHandle<()>>,
    restart: Option<JoinHandle<()>>,
    policy: RestartPolicy,
    state_since: Instant,
    last_result: Instant,
}

pub struct RecognizerDriver {
    engine: Arc<dyn SpeechEngine>,
    cfg: SpeechConfig,
    state_tx: watch::Sender<RecognizerState>,
    sound_tx: watch::Sender<f32>,
    partial_tx: broadcast::Sender<String>,
    fault_tx: broadcast::Sender<RecognizerFault>,
    final_tx: mpsc::UnboundedSender<String>,
    final_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    paused: AtomicBool,
    gave_up: AtomicBool,
    inner: Mutex<Inner>,
}

impl RecognizerDriver {
    pub fn new(engine: Arc<dyn SpeechEngine>, cfg: SpeechConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(RecognizerState::Idle);
        let (sound_tx, _) = watch::channel(0.0);
        let (partial_tx, _) = broadcast::channel(64);
        let (fault_tx, _) = broadcast::channel(16);
        let (final_tx, final_rx) = mpsc::unbounded_channel();
        let policy = RestartPolicy::new(
            Duration::from_secs(cfg.error_backoff_base_secs),
            Duration::from_secs(cfg.error_backoff_cap_secs),
            Duration::from_secs(cfg.rate_limit_delay_secs),
            cfg.max_consecutive_errors,
        );
        Arc::new(Self {
            engine,
            cfg,
            state_tx,
            sound_tx,
            partial_tx,
            fault_tx,
            final_tx,
            final_rx: Mutex::new(Some(final_rx)),
            paused: AtomicBool::new(false),
            gave_up: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                handle: None,
                pump: None,
                restart: None,
                policy,
                state_since: Instant::now(),
                last_result: Instant::now(),
            }),
        })
    }

    pub fn state(&self) -> RecognizerState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RecognizerState> {
        self.state_tx.subscribe()
    }

    /// Normalized input level in [0, 1].
    pub fn sound_level(&self) -> watch::Receiver<f32> {
        self.sound_tx.subscribe()
    }

    pub fn partials(&self) -> broadcast::Receiver<String> {
        self.partial_tx.subscribe()
    }

    /// Real (non-transient) engine faults, post-classification.
    pub fn faults(&self) -> broadcast::Receiver<RecognizerFault> {
        self.fault_tx.subscribe()
    }

    /// Final results destined for the dispatcher. Can be taken once.
    pub async fn take_finals(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.final_rx.lock().await.take()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn transition(&self, inner: &mut Inner, from: &[RecognizerState], to: RecognizerState) -> bool {
        let cur = *self.state_tx.borrow();
        if !from.contains(&cur) {
            return false;
        }
        debug!(?cur, ?to, "recognizer state");
        self.state_tx.send_replace(to);
        inner.state_since = Instant::now();
        if to == RecognizerState::Listening {
            inner.last_result = Instant::now();
        }
        true
    }

    /// Begin listening. Rejected unless IDLE. Calling this is the "user
    /// action" that clears a give-up.
    pub async fn start(self: &Arc<Self>) -> BridgeResult<()> {
        let mut inner = self.inner.lock().await;
        if self.gave_up.swap(false, Ordering::SeqCst) {
            inner.policy.on_success();
        }
        if !self.transition(&mut inner, &[RecognizerState::Idle], RecognizerState::Starting) {
            return Err(BridgeError::Recognizer {
                code: format!("cannot start while {:?}", self.state()),
                transient: true,
            });
        }

        if inner.handle.is_none() {
            match self.engine.create(&self.cfg.locale, &self.cfg).await {
                Ok((handle, events)) => {
                    inner.handle = Some(handle);
                    inner.pump = Some(self.spawn_pump(events));
                }
                Err(e) => {
                    self.teardown(&mut inner, true).await;
                    return Err(e);
                }
            }
        }
        let Some(handle) = inner.handle.as_ref() else {
            return Err(BridgeError::Recognizer { code: "engine missing".into(), transient: false });
        };
        if let Err(e) = handle.start().await {
            self.teardown(&mut inner, true).await;
            return Err(e);
        }
        Ok(())
    }

    /// End recognition. Idempotent; reaches IDLE even when the engine is
    /// stuck.
    pub async fn stop(&self) -> BridgeResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.restart.take() {
            task.abort();
        }
        match self.state() {
            RecognizerState::Idle => {}
            RecognizerState::Listening => {
                self.transition(&mut inner, &[RecognizerState::Listening], RecognizerState::Stopping);
                if let Some(handle) = inner.handle.as_ref() {
                    if let Err(e) = handle.stop().await {
                        debug!(error = %e, "engine stop failed");
                    }
                }
            }
            RecognizerState::Starting | RecognizerState::Stopping => {
                if let Some(handle) = inner.handle.as_ref() {
                    let _ = handle.cancel().await;
                }
            }
        }
        self.teardown(&mut inner, true).await;
        Ok(())
    }

    /// Stop and suppress auto-restart until [`resume`](Self::resume).
    pub async fn pause(&self) -> BridgeResult<()> {
        self.paused.store(true, Ordering::SeqCst);
        self.stop().await
    }

    pub async fn resume(self: &Arc<Self>) -> BridgeResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        self.start().await
    }

    /// Periodic wedge detection: stuck STARTING/STOPPING or a silent
    /// LISTENING session forces a full engine recreate.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(this.cfg.watchdog_period_secs);
            let stuck = Duration::from_secs(this.cfg.stuck_after_secs);
            let silent = Duration::from_secs(this.cfg.silent_after_secs);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut inner = this.inner.lock().await;
                let state = this.state();
                let since = inner.state_since.elapsed();
                let quiet = inner.last_result.elapsed();
                let wedged = match state {
                    RecognizerState::Starting | RecognizerState::Stopping => since > stuck,
                    RecognizerState::Listening => quiet > silent,
                    RecognizerState::Idle => false,
                };
                if wedged {
                    warn!(?state, elapsed = ?since, "watchdog: recognizer wedged, recreating engine");
                    this.teardown(&mut inner, true).await;
                    this.schedule_restart(&mut inner, Duration::ZERO);
                }
            }
        })
    }

    fn spawn_pump(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<RecognizerEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.on_event(event).await;
            }
        })
    }

    async fn on_event(self: &Arc<Self>, event: RecognizerEvent) {
        match event {
            RecognizerEvent::ReadyForSpeech => {
                let mut inner = self.inner.lock().await;
                self.transition(&mut inner, &[RecognizerState::Starting], RecognizerState::Listening);
            }
            RecognizerEvent::RmsChanged(db) => {
                self.sound_tx.send_replace(normalize_rms(db));
            }
            RecognizerEvent::Partial(text) => {
                let _ = self.partial_tx.send(text);
            }
            RecognizerEvent::EndOfSpeech => {
                let mut inner = self.inner.lock().await;
                self.transition(&mut inner, &[RecognizerState::Listening], RecognizerState::Stopping);
            }
            RecognizerEvent::Final(text) => {
                let mut inner = self.inner.lock().await;
                inner.policy.on_success();
                inner.last_result = Instant::now();
                // The engine session is over, but the engine itself is kept
                // for the next start.
                self.transition(&mut inner, &[RecognizerState::Listening], RecognizerState::Stopping);
                if !self.transition(&mut inner, &[RecognizerState::Stopping], RecognizerState::Idle) {
                    self.force_idle(&mut inner);
                }
                if !text.trim().is_empty() {
                    let _ = self.final_tx.send(text);
                }
                self.schedule_restart(&mut inner, Duration::ZERO);
            }
            RecognizerEvent::Error(fault) => {
                let mut inner = self.inner.lock().await;
                let class = fault.class();
                debug!(code = fault.code(), ?class, "recognizer error");
                // Real failures destroy the engine; expected noise keeps it
                // for the quick restart.
                if class == ErrorClass::Real {
                    self.teardown(&mut inner, false).await;
                } else {
                    self.force_idle(&mut inner);
                }

                match inner.policy.on_error(class) {
                    RestartDecision::Restart { delay } => {
                        if class != ErrorClass::Transient {
                            let _ = self.fault_tx.send(fault);
                        }
                        self.schedule_restart(&mut inner, delay);
                    }
                    RestartDecision::GiveUp => {
                        self.gave_up.store(true, Ordering::SeqCst);
                        let _ = self.fault_tx.send(fault);
                        warn!(
                            code = fault.code(),
                            "too many consecutive recognizer errors, stopping until user action"
                        );
                    }
                }
            }
        }
    }

    /// Drop the engine handle and force IDLE. `abort_pump` is false when
    /// called from the pump itself; the pump then dies with its closed
    /// event channel.
    async fn teardown(&self, inner: &mut Inner, abort_pump: bool) {
        if let Some(pump) = inner.pump.take() {
            if abort_pump {
                pump.abort();
            }
        }
        if let Some(handle) = inner.handle.take() {
            let _ = handle.cancel().await;
        }
        self.force_idle(inner);
    }

    fn force_idle(&self, inner: &mut Inner) {
        if self.state() != RecognizerState::Idle {
            debug!(from = ?self.state(), "recognizer forced to IDLE");
            self.state_tx.send_replace(RecognizerState::Idle);
            inner.state_since = Instant::now();
        }
    }

    fn schedule_restart(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        if !self.cfg.auto_restart || self.paused.load(Ordering::SeqCst) {
            return;
        }
        if let Some(task) = inner.restart.take() {
            task.abort();
        }
        let this = Arc::clone(self);
        inner.restart = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.paused.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = this.start().await {
                debug!(error = %e, "auto-restart failed");
            }
        }));
    }
}
