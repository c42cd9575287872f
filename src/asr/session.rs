//! Per-utterance recognition session.
//! State: INIT → OPEN → SENDING → CLOSING → DONE, with FAILED / TIMED_OUT
//! reachable from any non-terminal state. All mutable state sits behind one
//! lock; completion is a watch value set at most once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{FrameStatus, InboundMessage};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    Open,
    Sending,
    Closing,
    Done,
    Failed,
    TimedOut,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Open => "OPEN",
            SessionState::Sending => "SENDING",
            SessionState::Closing => "CLOSING",
            SessionState::Done => "DONE",
            SessionState::Failed => "FAILED",
            SessionState::TimedOut => "TIMED_OUT",
        };
        f.write_str(name)
    }
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed | SessionState::TimedOut)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (SessionState::Init, SessionState::Open)
                | (SessionState::Open, SessionState::Sending)
                | (SessionState::Sending, SessionState::Sending)
                | (SessionState::Sending, SessionState::Closing)
                | (SessionState::Closing, SessionState::Done)
                | (_, SessionState::Failed)
                | (_, SessionState::TimedOut)
        )
    }
}

/// How inbound fragments build the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptPolicy {
    /// Concatenate every fragment in arrival order.
    #[default]
    Accumulate,
    /// Only the final message's fragment counts.
    Replace,
}

/// Terminal result of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
    TimedOut,
}

struct Inner {
    state: SessionState,
    transcript: String,
    frames_sent: usize,
    final_seen: bool,
    error: Option<String>,
}

/// Mutable state of one utterance's recognition. Never reused across utterances.
pub struct RecognitionSession {
    id: Uuid,
    policy: TranscriptPolicy,
    inner: Mutex<Inner>,
    done_tx: watch::Sender<Option<Outcome>>,
}

impl RecognitionSession {
    pub fn new(policy: TranscriptPolicy) -> Arc<Self> {
        let (done_tx, _) = watch::channel(None);
        Arc::new(Self {
            id: Uuid::new_v4(),
            policy,
            inner: Mutex::new(Inner {
                state: SessionState::Init,
                transcript: String::new(),
                frames_sent: 0,
                final_seen: false,
                error: None,
            }),
            done_tx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn transcript(&self) -> String {
        self.inner.lock().transcript.trim().to_string()
    }

    pub fn frames_sent(&self) -> usize {
        self.inner.lock().frames_sent
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        *self.done_tx.borrow()
    }

    /// Channel established.
    pub fn mark_open(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance(&mut inner, SessionState::Open)
    }

    /// Record a frame that is now on the wire.
    pub fn record_sent(&self, status: FrameStatus) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.frames_sent += 1;
        match status {
            FrameStatus::First | FrameStatus::Continuation => {
                self.advance(&mut inner, SessionState::Sending);
            }
            FrameStatus::Last => {
                if self.advance(&mut inner, SessionState::Closing) && inner.final_seen {
                    self.finish(&mut inner, SessionState::Done, Outcome::Done);
                }
            }
        }
    }

    /// Apply one inbound message in arrival order.
    pub fn apply(&self, msg: &InboundMessage) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            debug!(
                session = %self.id,
                state = %inner.state,
                "message after session end ignored"
            );
            return;
        }

        if msg.is_error() {
            warn!(
                session = %self.id,
                code = msg.code,
                message = %msg.message,
                sid = msg.sid.as_deref().unwrap_or(""),
                "recognition service returned error"
            );
            inner.error = Some(
                Error::Protocol {
                    code: msg.code,
                    message: msg.message.clone(),
                }
                .to_string(),
            );
            self.finish(&mut inner, SessionState::Failed, Outcome::Failed);
            return;
        }

        match self.policy {
            TranscriptPolicy::Accumulate => inner.transcript.push_str(&msg.fragment),
            TranscriptPolicy::Replace if msg.is_final => inner.transcript = msg.fragment.clone(),
            TranscriptPolicy::Replace => {}
        }

        if msg.is_final {
            inner.final_seen = true;
            if inner.state == SessionState::Closing {
                self.finish(&mut inner, SessionState::Done, Outcome::Done);
            }
        }
    }

    /// Fail the session unless it already ended.
    pub fn fail(&self, err: &Error) {
        let mut inner = self.inner.lock();
        self.fail_locked(&mut inner, err);
    }

    /// The inbound stream ended. Without a final result that is a failure.
    /// With one, a session already past LAST completes; otherwise the LAST
    /// frame still completes it.
    pub fn remote_closed(&self, err: &Error) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        if !inner.final_seen {
            self.fail_locked(&mut inner, err);
            return;
        }
        if inner.state == SessionState::Closing {
            self.finish(&mut inner, SessionState::Done, Outcome::Done);
        } else {
            debug!(session = %self.id, state = %inner.state, "remote closed after final result");
        }
    }

    /// A frame could not be sent. Once the final result is in, the remote
    /// hanging up ends the session normally.
    pub fn send_failed(&self, err: &Error) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        let sending = matches!(inner.state, SessionState::Sending | SessionState::Closing);
        if inner.final_seen && sending {
            debug!(session = %self.id, error = %err, "send failed after final result");
            if inner.state == SessionState::Sending {
                self.advance(&mut inner, SessionState::Closing);
            }
            self.finish(&mut inner, SessionState::Done, Outcome::Done);
            return;
        }
        self.fail_locked(&mut inner, err);
    }

    pub fn time_out(&self, after: Duration) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        warn!(
            session = %self.id,
            state = %inner.state,
            timeout_ms = after.as_millis() as u64,
            "recognition session timed out"
        );
        inner.error = Some(Error::Timeout(after).to_string());
        self.finish(&mut inner, SessionState::TimedOut, Outcome::TimedOut);
    }

    /// Wait for the completion signal, up to `deadline`.
    pub async fn wait_until(&self, deadline: tokio::time::Instant) -> Option<Outcome> {
        let mut rx = self.done_tx.subscribe();
        let outcome = match tokio::time::timeout_at(deadline, rx.wait_for(Option::is_some)).await {
            Ok(Ok(outcome)) => *outcome,
            // The sender lives as long as the session, so only the deadline ends the wait.
            Ok(Err(_)) | Err(_) => None,
        };
        outcome
    }

    fn fail_locked(&self, inner: &mut Inner, err: &Error) {
        if inner.state.is_terminal() {
            return;
        }
        warn!(
            session = %self.id,
            state = %inner.state,
            error = %err,
            class = err.class(),
            "recognition session failed"
        );
        inner.error = Some(err.to_string());
        self.finish(inner, SessionState::Failed, Outcome::Failed);
    }

    fn advance(&self, inner: &mut Inner, next: SessionState) -> bool {
        let current = inner.state;
        if !current.can_transition_to(next) {
            warn!(session = %self.id, from = %current, to = %next, "invalid session transition");
            return false;
        }
        inner.state = next;
        if current != next {
            debug!(session = %self.id, from = %current, to = %next, "session_transition");
        }
        true
    }

    fn finish(&self, inner: &mut Inner, state: SessionState, outcome: Outcome) {
        if !self.advance(inner, state) {
            return;
        }
        self.done_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        info!(
            session = %self.id,
            frames = inner.frames_sent,
            outcome = ?outcome,
            "recognition session ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_and_send(session: &RecognitionSession, continuations: usize) {
        assert!(session.mark_open());
        session.record_sent(FrameStatus::First);
        for _ in 0..continuations {
            session.record_sent(FrameStatus::Continuation);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [SessionState::Done, SessionState::Failed, SessionState::TimedOut] {
            assert!(!terminal.can_transition_to(SessionState::Failed));
            assert!(!terminal.can_transition_to(SessionState::Sending));
        }
        assert!(!SessionState::Init.can_transition_to(SessionState::Sending));
        assert!(SessionState::Open.can_transition_to(SessionState::TimedOut));
    }

    #[test]
    fn test_done_only_after_last_frame() {
        let session = RecognitionSession::new(TranscriptPolicy::Accumulate);
        open_and_send(&session, 1);
        session.apply(&InboundMessage::final_result("hi"));
        assert_eq!(session.state(), SessionState::Sending);
        assert_eq!(session.outcome(), None);

        session.record_sent(FrameStatus::Last);
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.outcome(), Some(Outcome::Done));
        assert_eq!(session.frames_sent(), 3);
    }

    #[test]
    fn test_accumulate_concatenates_fragments() {
        let session = RecognitionSession::new(TranscriptPolicy::Accumulate);
        open_and_send(&session, 0);
        session.record_sent(FrameStatus::Last);
        session.apply(&InboundMessage::partial("hel"));
        session.apply(&InboundMessage::final_result("lo "));
        assert_eq!(session.transcript(), "hello");
    }

    #[test]
    fn test_replace_keeps_only_final_fragment() {
        let session = RecognitionSession::new(TranscriptPolicy::Replace);
        open_and_send(&session, 0);
        session.record_sent(FrameStatus::Last);
        session.apply(&InboundMessage::partial("hel"));
        session.apply(&InboundMessage::final_result("hello"));
        assert_eq!(session.transcript(), "hello");
    }

    #[test]
    fn test_remote_error_fails_and_freezes_transcript() {
        let session = RecognitionSession::new(TranscriptPolicy::Accumulate);
        open_and_send(&session, 1);
        session.apply(&InboundMessage::partial("a"));
        session.apply(&InboundMessage::error(10700, "engine error"));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.outcome(), Some(Outcome::Failed));

        session.apply(&InboundMessage::final_result("b"));
        session.record_sent(FrameStatus::Last);
        assert_eq!(session.transcript(), "a");
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.error().unwrap().contains("10700"));
    }

    #[test]
    fn test_remote_close_after_final_completes_on_last() {
        let session = RecognitionSession::new(TranscriptPolicy::Accumulate);
        open_and_send(&session, 1);
        session.apply(&InboundMessage::final_result("hello"));
        session.remote_closed(&Error::Transport("closed".into()));
        assert_eq!(session.state(), SessionState::Sending);

        session.record_sent(FrameStatus::Last);
        assert_eq!(session.outcome(), Some(Outcome::Done));
        assert_eq!(session.transcript(), "hello");
        assert_eq!(session.error(), None);
    }

    #[test]
    fn test_remote_close_without_final_fails() {
        let session = RecognitionSession::new(TranscriptPolicy::Accumulate);
        open_and_send(&session, 0);
        session.record_sent(FrameStatus::Last);
        session.apply(&InboundMessage::partial("hel"));
        session.remote_closed(&Error::Transport("closed".into()));
        assert_eq!(session.outcome(), Some(Outcome::Failed));
        assert!(session.error().unwrap().contains("closed"));
    }

    #[test]
    fn test_send_failure_after_final_is_done() {
        let session = RecognitionSession::new(TranscriptPolicy::Accumulate);
        open_and_send(&session, 2);
        session.apply(&InboundMessage::final_result("bye"));
        session.send_failed(&Error::Transport("broken pipe".into()));
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.transcript(), "bye");

        let other = RecognitionSession::new(TranscriptPolicy::Accumulate);
        open_and_send(&other, 0);
        other.send_failed(&Error::Transport("broken pipe".into()));
        assert_eq!(other.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_none_at_deadline() {
        let session = RecognitionSession::new(TranscriptPolicy::Accumulate);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        assert_eq!(session.wait_until(deadline).await, None);
        session.time_out(Duration::from_secs(30));
        assert_eq!(session.state(), SessionState::TimedOut);
        // A late failure cannot overwrite the outcome.
        session.fail(&Error::Transport("late".into()));
        assert_eq!(session.outcome(), Some(Outcome::TimedOut));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_completion_from_another_task() {
        let session = RecognitionSession::new(TranscriptPolicy::Accumulate);
        open_and_send(&session, 0);
        let s = Arc::clone(&session);
        tokio::spawn(async move {
            s.record_sent(FrameStatus::Last);
            s.apply(&InboundMessage::final_result("ok"));
        });
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        assert_eq!(session.wait_until(deadline).await, Some(Outcome::Done));
    }
}
