//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call s2p_core::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("device.name", "Speech2Prompt handheld")?
        .set_default("link.scan_window_secs", 12)?
        .set_default("link.mtu_target", 512)?
        .set_default("link.connect_timeout_secs", 10)?
        .set_default("link.heartbeat_interval_secs", 5)?
        .set_default("link.heartbeat_misses", 2)?
        .set_default("link.ack_timeout_secs", 5)?
        .set_default("link.reconnect_max_attempts", 5)?
        .set_default("link.reconnect_base_delay_secs", 1)?
        .set_default("link.reconnect_cap_secs", 16)?
        .set_default("link.write_pause_ms", 10)?
        .set_default("link.outbound_queue_cap", 64)?
        .set_default("link.reassembly_cap_bytes", 65_536)?
        .set_default("speech.pause_for_secs", 3)?
        .set_default("speech.listen_for_secs", 30)?
        .set_default("speech.auto_restart", true)?
        .set_default("speech.locale", "en-US")?
        .set_default("speech.watchdog_period_secs", 5)?
        .set_default("speech.stuck_after_secs", 10)?
        .set_default("speech.silent_after_secs", 20)?
        .set_default("speech.error_backoff_base_secs", 1)?
        .set_default("speech.error_backoff_cap_secs", 30)?
        .set_default("speech.max_consecutive_errors", 5)?
        .set_default("speech.rate_limit_delay_secs", 30)?
        .set_default("speech.debounce_ms", 150)?
        .set_default("store.data_dir", "./data")?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (S2P_LINK__MTU_TARGET, S2P_SPEECH__LOCALE, etc.)
        .add_source(
            config::Environment::with_prefix("S2P")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub link: LinkConfig,
    pub speech: SpeechConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    /// Display name sent to the peer in PAIR_REQ.
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    /// How long a scan runs before auto-stopping.
    pub scan_window_secs: u64,
    /// MTU requested from the peer; whatever it grants is accepted,
    /// never below the ATT default of 23.
    pub mtu_target: u16,
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Consecutive unanswered heartbeats before the link is declared dead.
    pub heartbeat_misses: u32,
    pub ack_timeout_secs: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_secs: u64,
    pub reconnect_cap_secs: u64,
    /// Inter-packet pause when the platform has no write-completion signal.
    pub write_pause_ms: u64,
    pub outbound_queue_cap: usize,
    pub reassembly_cap_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpeechConfig {
    /// Silence that terminates a segment.
    pub pause_for_secs: u64,
    /// Maximum length of a single listening session.
    pub listen_for_secs: u64,
    pub auto_restart: bool,
    pub locale: String,
    pub watchdog_period_secs: u64,
    /// Time stuck in STARTING or STOPPING before the watchdog intervenes.
    pub stuck_after_secs: u64,
    /// Time in LISTENING with no results before the watchdog intervenes.
    pub silent_after_secs: u64,
    pub error_backoff_base_secs: u64,
    pub error_backoff_cap_secs: u64,
    pub max_consecutive_errors: u32,
    pub rate_limit_delay_secs: u64,
    /// Debounce window applied to rapid final results before dispatch.
    pub debounce_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory holding the pairing store and local device identity.
    pub data_dir: String,
}

impl LinkConfig {
    /// Defaults used by tests and by components constructed without the
    /// global config.
    pub fn defaults() -> Self {
        Self {
            scan_window_secs: 12,
            mtu_target: 512,
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 5,
            heartbeat_misses: 2,
            ack_timeout_secs: 5,
            reconnect_max_attempts: 5,
            reconnect_base_delay_secs: 1,
            reconnect_cap_secs: 16,
            write_pause_ms: 10,
            outbound_queue_cap: 64,
            reassembly_cap_bytes: 65_536,
        }
    }
}

impl SpeechConfig {
    pub fn defaults() -> Self {
        Self {
            pause_for_secs: 3,
            listen_for_secs: 30,
            auto_restart: true,
            locale: "en-US".into(),
            watchdog_period_secs: 5,
            stuck_after_secs: 10,
            silent_after_secs: 20,
            error_backoff_base_secs: 1,
            error_backoff_cap_secs: 30,
            max_consecutive_errors: 5,
            rate_limit_delay_secs: 30,
            debounce_ms: 150,
        }
    }
}
