//! # s2p-speech
//!
//! The speech half of the bridge: a watchdog-supervised recognizer state
//! machine, the spoken-command parser, and the dispatcher that turns
//! recognized utterances into transport messages.

pub mod commands;
pub mod dispatch;
pub mod recognizer;

pub use commands::{CommandParser, ParsedUtterance};
pub use dispatch::{DispatchSink, Dispatcher};
pub use recognizer::{
    EngineHandle, RecognizerDriver, RecognizerEvent, RecognizerFault, RecognizerState, SpeechEngine,
};
