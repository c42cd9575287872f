//! Streaming speech recognition.
//! protocol (frames + codec) → session (state + completion) → recognizer
//! (concurrent send/receive), over a pluggable `RecognitionChannel`.

pub mod channel;
pub mod protocol;
pub mod recognizer;
pub mod session;

pub use channel::{RecognitionChannel, XunfeiIatChannel};
pub use protocol::{BusinessParams, FrameStatus, InboundMessage, OutboundFrame};
pub use recognizer::{RecognizerConfig, StreamingRecognizer};
pub use session::{Outcome, RecognitionSession, SessionState, TranscriptPolicy};
