//! Streaming recognizer.
//! One session per utterance, three activities sharing it:
//! a blocking producer draining the block iterator into a bounded queue,
//! a sender pacing frames to audio time, and a receiver applying messages.
//! The caller waits on the session's completion signal up to a deadline.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{FrameSink, MessageStream, RecognitionChannel};
use super::protocol::{FrameStatus, OutboundFrame};
use super::session::{Outcome, RecognitionSession, TranscriptPolicy};
use crate::audio::AudioBlock;
use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Global per-session deadline, connect included.
    #[serde(with = "secs")]
    pub deadline: Duration,
    pub policy: TranscriptPolicy,
    /// Blocks buffered between capture and the sender.
    pub queue_depth: usize,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            policy: TranscriptPolicy::Accumulate,
            queue_depth: 64,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        f64::deserialize(d).map(|s| Duration::from_secs_f64(s.max(0.0)))
    }
}

pub struct StreamingRecognizer {
    channel: Arc<dyn RecognitionChannel>,
    config: RecognizerConfig,
}

impl StreamingRecognizer {
    pub fn new(channel: Arc<dyn RecognitionChannel>, config: RecognizerConfig) -> Self {
        Self { channel, config }
    }

    /// Recognize a lazy block sequence. Returns the trimmed transcript, or an
    /// empty string on any failure or timeout.
    pub async fn recognize<I>(&self, blocks: I) -> String
    where
        I: IntoIterator<Item = AudioBlock>,
        I::IntoIter: Send + 'static,
    {
        let started = Instant::now();
        let session = self.run_session(blocks).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match session.outcome() {
            Some(Outcome::Done) => {
                let text = session.transcript();
                info!(
                    session = %session.id(),
                    frames = session.frames_sent(),
                    chars = text.chars().count(),
                    elapsed_ms,
                    "recognition complete"
                );
                text
            }
            outcome => {
                warn!(
                    session = %session.id(),
                    state = %session.state(),
                    ?outcome,
                    error = session.error().unwrap_or_default(),
                    elapsed_ms,
                    "recognition produced no result"
                );
                String::new()
            }
        }
    }

    /// Run one session to a terminal state and hand it back for inspection.
    pub async fn run_session<I>(&self, blocks: I) -> Arc<RecognitionSession>
    where
        I: IntoIterator<Item = AudioBlock>,
        I::IntoIter: Send + 'static,
    {
        let session = RecognitionSession::new(self.config.policy);
        let deadline = Instant::now() + self.config.deadline;

        let (sink, stream) = match tokio::time::timeout_at(deadline, self.channel.open()).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                session.fail(&e);
                return session;
            }
            Err(_) => {
                session.time_out(self.config.deadline);
                return session;
            }
        };
        session.mark_open();
        debug!(session = %session.id(), "recognition channel open");

        let cancel = CancellationToken::new();
        let (block_tx, block_rx) = mpsc::channel(self.config.queue_depth.max(1));
        let iter = blocks.into_iter();

        // Exits once its queue closes or the iterator ends, including by panic.
        let _producer = tokio::task::spawn_blocking(move || produce_blocks(iter, block_tx));
        let sender = tokio::spawn(send_frames(
            sink,
            block_rx,
            Arc::clone(&session),
            cancel.clone(),
        ));
        let receiver = tokio::spawn(receive_messages(
            stream,
            Arc::clone(&session),
            cancel.clone(),
        ));

        if session.wait_until(deadline).await.is_none() {
            session.time_out(self.config.deadline);
        }

        cancel.cancel();
        for (name, handle) in [("sender", sender), ("receiver", receiver)] {
            if let Err(e) = handle.await {
                warn!(
                    session = %session.id(),
                    task = name,
                    error = %e,
                    "recognition task panicked"
                );
            }
        }
        session
    }
}

fn produce_blocks<I: Iterator<Item = AudioBlock>>(blocks: I, tx: mpsc::Sender<AudioBlock>) {
    for block in blocks {
        if tx.blocking_send(block).is_err() {
            debug!("frame sender gone, stopping block production");
            return;
        }
    }
}

/// FIRST carries the first block, CONTINUATION each later block, LAST is empty.
/// Frame k goes out no earlier than the audio time of the k blocks before it.
async fn send_frames(
    mut sink: FrameSink,
    mut blocks: mpsc::Receiver<AudioBlock>,
    session: Arc<RecognitionSession>,
    cancel: CancellationToken,
) {
    let mut started: Option<Instant> = None;
    let mut audio_sent = Duration::ZERO;
    let mut seq = 0usize;

    loop {
        let block = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            block = blocks.recv() => block,
        };
        let (audio, duration) = match block {
            Some(block) => (block.to_le_bytes(), block.duration()),
            // No audio at all: the protocol still needs a FIRST.
            None if seq == 0 => (Vec::new(), Duration::ZERO),
            None => break,
        };
        let status = if seq == 0 {
            FrameStatus::First
        } else {
            FrameStatus::Continuation
        };
        let due = *started.get_or_insert_with(Instant::now) + audio_sent;
        let frame = OutboundFrame { seq, status, audio };
        if !send_frame(&mut sink, &session, &cancel, due, frame).await {
            return;
        }
        audio_sent += duration;
        seq += 1;
    }

    let due = started.unwrap_or_else(Instant::now) + audio_sent;
    let last = OutboundFrame {
        seq,
        status: FrameStatus::Last,
        audio: Vec::new(),
    };
    if send_frame(&mut sink, &session, &cancel, due, last).await {
        debug!(session = %session.id(), frames = seq + 1, "last frame sent");
    }
}

async fn send_frame(
    sink: &mut FrameSink,
    session: &RecognitionSession,
    cancel: &CancellationToken,
    due: Instant,
    frame: OutboundFrame,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return false,
        _ = tokio::time::sleep_until(due) => {}
    }

    let status = frame.status;
    let seq = frame.seq;
    let bytes = frame.audio.len();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return false,
        result = sink.send(frame) => result,
    };
    match result {
        Ok(()) => {
            session.record_sent(status);
            debug!(session = %session.id(), seq, ?status, bytes, "frame sent");
            true
        }
        Err(e) => {
            session.send_failed(&e);
            false
        }
    }
}

async fn receive_messages(
    mut stream: MessageStream,
    session: Arc<RecognitionSession>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(msg)) => {
                debug!(
                    session = %session.id(),
                    code = msg.code,
                    is_final = msg.is_final,
                    fragment = %msg.fragment,
                    "recognition message"
                );
                session.apply(&msg);
                if session.state().is_terminal() {
                    return;
                }
            }
            Some(Err(e)) => {
                session.fail(&e);
                return;
            }
            None => {
                let closed = Error::Transport("channel closed before final result".into());
                session.remote_closed(&closed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::channel::testing::ScriptedChannel;
    use crate::asr::protocol::InboundMessage;
    use crate::asr::session::SessionState;
    use crate::audio::recorder::Recorder;
    use crate::audio::testing::ScriptedSource;
    use crate::audio::{BLOCK_SIZE, SAMPLE_RATE};

    fn block(value: i16) -> AudioBlock {
        AudioBlock::new(vec![value; BLOCK_SIZE], SAMPLE_RATE)
    }

    fn recognizer(channel: Arc<ScriptedChannel>, policy: TranscriptPolicy) -> StreamingRecognizer {
        StreamingRecognizer::new(
            channel,
            RecognizerConfig {
                policy,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_frame_counts_for_n_blocks() {
        for n in [1usize, 2, 5] {
            let channel = Arc::new(ScriptedChannel::final_on_last("ok"));
            let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);
            let text = rec.recognize((0..n).map(|_| block(1000)).collect::<Vec<_>>()).await;
            assert_eq!(text, "ok");

            let statuses = channel.statuses();
            assert_eq!(statuses.len(), n + 1);
            assert_eq!(statuses.iter().filter(|s| **s == FrameStatus::First).count(), 1);
            assert_eq!(statuses.iter().filter(|s| **s == FrameStatus::Continuation).count(), n - 1);
            assert_eq!(statuses.last(), Some(&FrameStatus::Last));
            assert_eq!(statuses[0], FrameStatus::First);
        }
    }

    #[tokio::test]
    async fn test_empty_sequence_still_sends_first_and_last() {
        let channel = Arc::new(ScriptedChannel::final_on_last(""));
        let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);
        assert_eq!(rec.recognize(Vec::new()).await, "");
        assert_eq!(channel.statuses(), vec![FrameStatus::First, FrameStatus::Last]);
        assert!(channel.frames.lock().iter().all(|(_, f)| f.audio.is_empty()));
    }

    #[tokio::test]
    async fn test_last_frame_sent_when_audio_source_dies() {
        let channel = Arc::new(ScriptedChannel::final_on_last("partial"));
        let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);
        let blocks = (0..3).map(|i| {
            if i == 2 {
                panic!("device vanished");
            }
            block(1000)
        });
        assert_eq!(rec.recognize(blocks).await, "partial");
        assert_eq!(
            channel.statuses(),
            vec![FrameStatus::First, FrameStatus::Continuation, FrameStatus::Last]
        );
    }

    #[tokio::test]
    async fn test_silence_stopped_utterance_recognized_end_to_end() {
        // A and B loud, C silent and completes a 40ms silence window; D is never read.
        let source = Arc::new(ScriptedSource::new(vec![
            vec![3000; BLOCK_SIZE],
            vec![3000; BLOCK_SIZE],
            vec![0; BLOCK_SIZE],
            vec![3000; BLOCK_SIZE],
        ]));
        let recorder = Recorder::new(source.clone(), BLOCK_SIZE);
        let channel = Arc::new(ScriptedChannel::new(|frame| {
            if frame.seq == 2 {
                vec![InboundMessage::final_result("hello")]
            } else {
                vec![]
            }
        }));
        let rec = recognizer(channel.clone(), TranscriptPolicy::Replace);

        let session = rec.run_session(recorder.record_stream(15.0, 500.0, 0.04)).await;
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.transcript(), "hello");
        assert_eq!(session.frames_sent(), 4);
        assert_eq!(source.remaining(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_on_second_frame_fails_session() {
        let channel = Arc::new(ScriptedChannel::new(|frame| {
            if frame.seq == 1 {
                vec![InboundMessage::error(10700, "engine error")]
            } else if frame.status == FrameStatus::Last {
                vec![InboundMessage::final_result("hello")]
            } else {
                vec![]
            }
        }));
        let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);
        let blocks = vec![block(3000), block(3000), block(0)];

        let session = rec.run_session(blocks.clone()).await;
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.transcript(), "");

        assert_eq!(rec.recognize(blocks).await, "");
    }

    #[tokio::test]
    async fn test_transcript_policies_differ_on_partials() {
        let responder = |frame: &OutboundFrame| match frame.status {
            FrameStatus::First => vec![InboundMessage::partial("turn on ")],
            FrameStatus::Continuation => vec![InboundMessage::partial("the ")],
            FrameStatus::Last => vec![InboundMessage::final_result("light")],
        };
        let blocks = || vec![block(1000), block(1000)];

        let channel = || Arc::new(ScriptedChannel::new(responder));

        let accumulate = recognizer(channel(), TranscriptPolicy::Accumulate);
        assert_eq!(accumulate.recognize(blocks()).await, "turn on the light");

        let replace = recognizer(channel(), TranscriptPolicy::Replace);
        assert_eq!(replace.recognize(blocks()).await, "light");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_remote_times_out_with_empty_result() {
        let channel = Arc::new(ScriptedChannel::new(|_| vec![]).holding_open());
        let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);

        let started = Instant::now();
        let session = rec.run_session(vec![block(1000)]).await;
        assert_eq!(session.state(), SessionState::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(session.transcript(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_then_remote_close_is_done() {
        let channel = Arc::new(
            ScriptedChannel::new(|frame| match frame.status {
                FrameStatus::First => vec![InboundMessage::final_result("hello")],
                _ => vec![],
            })
            .hanging_up_after(0),
        );
        let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);

        let session = rec.run_session(vec![block(1000), block(1000), block(1000)]).await;
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.transcript(), "hello");
        assert_eq!(session.error(), None);
        assert_eq!(channel.statuses().last(), Some(&FrameStatus::Last));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_without_final_fails() {
        let channel = Arc::new(
            ScriptedChannel::new(|frame| match frame.status {
                FrameStatus::First => vec![InboundMessage::partial("hel")],
                _ => vec![],
            })
            .hanging_up_after(0),
        );
        let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);

        let session = rec.run_session(vec![block(1000), block(1000)]).await;
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.error().unwrap_or_default().contains("closed"));
        assert_eq!(rec.recognize(vec![block(1000), block(1000)]).await, "");
    }

    #[tokio::test]
    async fn test_connect_failure_returns_empty() {
        let channel = Arc::new(ScriptedChannel::final_on_last("x").failing_open());
        let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);
        let session = rec.run_session(vec![block(1000)]).await;
        assert_eq!(session.state(), SessionState::Failed);
        assert!(channel.frames.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_paced_to_audio_time() {
        let channel = Arc::new(ScriptedChannel::final_on_last("ok"));
        let rec = recognizer(channel.clone(), TranscriptPolicy::Accumulate);
        assert_eq!(rec.recognize((0..5).map(|_| block(1000)).collect::<Vec<_>>()).await, "ok");

        let frames = channel.frames.lock().clone();
        assert_eq!(frames.len(), 6);
        let t0 = frames[0].0;
        for (k, (at, _)) in frames.iter().enumerate() {
            assert!(*at - t0 >= Duration::from_millis(40) * k as u32, "frame {k} sent early");
        }
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_share_transcripts() {
        let channel = Arc::new(ScriptedChannel::new(|frame| match frame.status {
            FrameStatus::First => vec![InboundMessage::partial(frame.audio[0].to_string())],
            FrameStatus::Last => vec![InboundMessage::final_result("")],
            FrameStatus::Continuation => vec![],
        }));
        let rec = recognizer(channel, TranscriptPolicy::Accumulate);

        let (a, b) = tokio::join!(
            rec.recognize(vec![block(7), block(7)]),
            rec.recognize(vec![block(9), block(9)])
        );
        assert_eq!(a, "7");
        assert_eq!(b, "9");
    }
}
