//! One wake-to-sleep conversation turn.
//!
//! Listening → Recognizing → Thinking → Speaking → Sleep. Recording streams
//! straight into recognition; every failure ends in a spoken prompt rather
//! than an error. Runs on a blocking thread and drives async work through a
//! runtime handle.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::asr::StreamingRecognizer;
use crate::audio::playback::PlaybackArbiter;
use crate::audio::recorder::Recorder;
use crate::cache::ResultCache;
use crate::dialogue::Dialogue;
use crate::metrics::{metric_names, MetricsRegistry, TurnIds};
use crate::state_machine::{AssistantState, StateMachine};
use crate::tts::{Synthesizer, STREAM_SAMPLE_RATE};

/// Named prompt tags.
pub mod prompts {
    pub const WELCOME: &str = "welcome";
    pub const NOT_HEARD: &str = "not_heard";
    pub const NO_AUDIO: &str = "no_audio";
    pub const SYNTHESIS_FAILED: &str = "synthesis_failed";
    pub const GOODBYE: &str = "goodbye";
}

/// True when `text` contains any non-empty end word.
pub fn is_endword(text: &str, endwords: &[String]) -> bool {
    endwords
        .iter()
        .any(|word| !word.is_empty() && text.contains(word.as_str()))
}

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub max_duration_secs: f32,
    pub silence_threshold: f32,
    pub silence_duration_secs: f32,
    pub endwords: Vec<String>,
    /// `tag → text`, used when a prompt is not on disk yet.
    pub prompts: BTreeMap<String, String>,
    /// Play replies as synthesis streams instead of through the cache.
    pub streaming: bool,
    pub idle_timeout: Duration,
    pub cache_max_entries: usize,
    pub cache_max_bytes: u64,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_duration_secs: 15.0,
            silence_threshold: 500.0,
            silence_duration_secs: 1.0,
            endwords: Vec::new(),
            prompts: BTreeMap::new(),
            streaming: false,
            idle_timeout: Duration::from_secs(10),
            cache_max_entries: 50,
            cache_max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Not a single block was captured.
    NoAudio,
    /// Audio was captured but recognition yielded nothing.
    NotHeard,
    /// An end word was heard; history is cleared.
    Goodbye { transcript: String },
    Replied { transcript: String, reply: String },
}

/// Collaborators of the turn loop.
pub struct AssistantParts {
    pub recorder: Recorder,
    pub recognizer: StreamingRecognizer,
    pub dialogue: Arc<dyn Dialogue>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub cache: Arc<ResultCache>,
    pub playback: Arc<PlaybackArbiter>,
    pub state: Arc<StateMachine>,
    pub metrics: Arc<MetricsRegistry>,
}

pub struct Assistant {
    parts: AssistantParts,
    settings: TurnSettings,
    runtime: Handle,
    turns: AtomicU64,
}

impl Assistant {
    pub fn new(parts: AssistantParts, settings: TurnSettings, runtime: Handle) -> Self {
        Self {
            parts,
            settings,
            runtime,
            turns: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.parts.state
    }

    /// Play the welcome prompt. Must not be called from an async context.
    pub fn greet(&self) {
        self.enter(AssistantState::Speaking);
        self.speak_prompt(prompts::WELCOME);
        self.enter(AssistantState::Sleep);
    }

    /// Run one turn to completion. Must not be called from an async context.
    pub fn run_turn(&self) -> TurnOutcome {
        let ids = TurnIds::new(self.turns.fetch_add(1, Ordering::Relaxed) + 1);
        let turn_span = self.parts.metrics.span(metric_names::TURN);
        info!(turn = ids.turn, turn_id = %ids.turn_id, "turn started");

        if !self.parts.playback.wait_until_idle(self.settings.idle_timeout) {
            warn!(turn = ids.turn, "playback still busy, recording anyway");
        }

        let outcome = self.converse();
        self.finish_turn();

        info!(turn = ids.turn, turn_id = %ids.turn_id, outcome = ?outcome, "turn finished");
        turn_span.finish();
        outcome
    }

    fn converse(&self) -> TurnOutcome {
        self.enter(AssistantState::Listening);
        let (transcript, captured) = self.listen();

        let Some(captured) = captured else {
            warn!("recognition unavailable, nothing recorded");
            self.enter(AssistantState::Speaking);
            self.speak_prompt(prompts::NOT_HEARD);
            return TurnOutcome::NotHeard;
        };
        if captured == 0 {
            warn!("no audio captured");
            self.enter(AssistantState::Speaking);
            self.speak_prompt(prompts::NO_AUDIO);
            return TurnOutcome::NoAudio;
        }
        if transcript.is_empty() {
            info!(blocks = captured, "nothing recognized");
            self.enter(AssistantState::Speaking);
            self.speak_prompt(prompts::NOT_HEARD);
            return TurnOutcome::NotHeard;
        }
        info!(text = %transcript, "recognized");

        if is_endword(&transcript, &self.settings.endwords) {
            info!("end word heard, ending conversation");
            self.parts.dialogue.clear_history();
            self.enter(AssistantState::Speaking);
            self.speak_prompt(prompts::GOODBYE);
            return TurnOutcome::Goodbye { transcript };
        }

        self.enter(AssistantState::Thinking);
        let span = self.parts.metrics.span(metric_names::DIALOGUE);
        let reply = self.runtime.block_on(self.parts.dialogue.reply(&transcript));
        span.finish();
        info!(reply = %reply, "reply ready");

        self.enter(AssistantState::Speaking);
        self.speak(&reply);
        TurnOutcome::Replied { transcript, reply }
    }

    /// Stream a fresh recording into recognition. Returns the transcript and
    /// the number of blocks captured, or `None` if recording never started
    /// because recognition could not begin.
    fn listen(&self) -> (String, Option<usize>) {
        let captured = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicBool::new(false));
        let mut stream = self.parts.recorder.record_stream(
            self.settings.max_duration_secs,
            self.settings.silence_threshold,
            self.settings.silence_duration_secs,
        );
        let mut record_span = Some(self.parts.metrics.span(metric_names::RECORD));
        let counter = Arc::clone(&captured);
        let polled = Arc::clone(&started);
        let blocks = std::iter::from_fn(move || {
            polled.store(true, Ordering::Relaxed);
            let next = stream.next();
            match next {
                Some(_) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    if let Some(span) = record_span.take() {
                        span.finish();
                    }
                }
            }
            next
        });

        self.enter(AssistantState::Recognizing);
        let span = self.parts.metrics.span(metric_names::RECOGNIZE);
        let transcript = self.runtime.block_on(self.parts.recognizer.recognize(blocks));
        span.finish();
        let captured = started
            .load(Ordering::Relaxed)
            .then(|| captured.load(Ordering::Relaxed));
        (transcript, captured)
    }

    /// Synthesize and play `text`, streamed or through the cache.
    fn speak(&self, text: &str) {
        if self.settings.streaming {
            self.speak_streamed(text);
            return;
        }

        let span = self.parts.metrics.span(metric_names::SYNTHESIZE);
        let path = self
            .runtime
            .block_on(self.parts.cache.get_or_synthesize(text, self.parts.synthesizer.as_ref()));
        span.finish();

        match path {
            Some(path) => self.play(&path),
            None => {
                warn!("reply synthesis failed");
                self.speak_prompt(prompts::SYNTHESIS_FAILED);
            }
        }
    }

    fn speak_streamed(&self, text: &str) {
        let span = self.parts.metrics.span(metric_names::SYNTHESIZE);
        let chunks = self.runtime.block_on(self.parts.synthesizer.synthesize_stream(text));
        span.finish();

        let mut chunks = match chunks {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, class = e.class(), "streamed synthesis failed to start");
                self.speak_prompt(prompts::SYNTHESIS_FAILED);
                return;
            }
        };

        // Runs on the playback thread, outside the runtime.
        let blocks = std::iter::from_fn(move || match chunks.blocking_recv()? {
            Ok(pcm) => Some(pcm),
            Err(e) => {
                warn!(error = %e, class = e.class(), "synthesis stream ended with error");
                None
            }
        });

        let span = self.parts.metrics.span(metric_names::PLAYBACK);
        self.parts.playback.play_stream(blocks, STREAM_SAMPLE_RATE, 1);
        span.finish();
    }

    /// Play a named prompt; synthesize it from its configured text if missing.
    fn speak_prompt(&self, tag: &str) {
        if let Some(path) = self.parts.cache.get_named(tag) {
            self.play(&path);
            return;
        }
        let Some(text) = self.settings.prompts.get(tag) else {
            warn!(tag, "prompt not available");
            return;
        };
        let synthesized = self
            .runtime
            .block_on(self.parts.cache.get_or_synthesize(text, self.parts.synthesizer.as_ref()));
        match synthesized {
            Some(path) => self.play(&path),
            None => warn!(tag, "prompt synthesis failed"),
        }
    }

    fn play(&self, path: &Path) {
        let span = self.parts.metrics.span(metric_names::PLAYBACK);
        self.parts.playback.play_file(path);
        span.finish();
    }

    fn finish_turn(&self) {
        let report = self
            .parts
            .cache
            .evict(self.settings.cache_max_entries, self.settings.cache_max_bytes);
        if report.removed > 0 {
            info!(removed = report.removed, kept = report.kept, "cache trimmed");
        }
        self.enter(AssistantState::Sleep);
    }

    fn enter(&self, next: AssistantState) {
        // Rejections are logged by the state machine.
        let _ = self.parts.state.transition(next);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::asr::channel::testing::ScriptedChannel;
    use crate::asr::RecognizerConfig;
    use crate::audio::playback::testing::RecordingSink;
    use crate::audio::resample::PcmFormat;
    use crate::audio::testing::ScriptedSource;
    use crate::audio::{AudioSource, BLOCK_SIZE, SAMPLE_RATE};
    use crate::tts::testing::FakeSynthesizer;

    struct FakeDialogue {
        heard: Mutex<Vec<String>>,
        cleared: AtomicBool,
    }

    impl FakeDialogue {
        fn new() -> Self {
            Self {
                heard: Mutex::new(Vec::new()),
                cleared: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Dialogue for FakeDialogue {
        async fn reply(&self, user_text: &str) -> String {
            self.heard.lock().push(user_text.to_string());
            format!("你说的是{user_text}")
        }

        fn clear_history(&self) {
            self.cleared.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        assistant: Assistant,
        dialogue: Arc<FakeDialogue>,
        synth: Arc<FakeSynthesizer>,
        sink: Arc<RecordingSink>,
        cache_dir: tempfile::TempDir,
        _temp: tempfile::TempDir,
    }

    /// Three loud blocks then enough quiet to end the recording.
    fn speech() -> Vec<Vec<i16>> {
        let mut blocks = vec![vec![3000i16; BLOCK_SIZE]; 3];
        blocks.extend(vec![vec![0i16; BLOCK_SIZE]; 2]);
        blocks
    }

    fn harness(
        rt: &tokio::runtime::Runtime,
        blocks: Vec<Vec<i16>>,
        channel: ScriptedChannel,
        settings: TurnSettings,
    ) -> Harness {
        let temp = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let source: Arc<dyn AudioSource> = Arc::new(ScriptedSource::new(blocks));
        let sink = Arc::new(RecordingSink::new(PcmFormat::new(SAMPLE_RATE, 1)));
        let dialogue = Arc::new(FakeDialogue::new());
        let synth = Arc::new(FakeSynthesizer::new(temp.path()));

        let parts = AssistantParts {
            recorder: Recorder::new(source, BLOCK_SIZE),
            recognizer: StreamingRecognizer::new(
                Arc::new(channel),
                RecognizerConfig {
                    deadline: Duration::from_secs(5),
                    ..Default::default()
                },
            ),
            dialogue: dialogue.clone(),
            synthesizer: synth.clone(),
            cache: Arc::new(ResultCache::open(cache_dir.path()).unwrap()),
            playback: Arc::new(
                PlaybackArbiter::new(sink.clone()).with_poll_interval(Duration::from_millis(5)),
            ),
            state: Arc::new(StateMachine::new()),
            metrics: Arc::new(MetricsRegistry::new()),
        };
        Harness {
            assistant: Assistant::new(parts, settings, rt.handle().clone()),
            dialogue,
            synth,
            sink,
            cache_dir,
            _temp: temp,
        }
    }

    fn settings() -> TurnSettings {
        TurnSettings {
            // Two quiet blocks end the recording.
            silence_duration_secs: 0.08,
            endwords: vec!["再见".into(), "拜拜".into()],
            ..Default::default()
        }
    }

    fn cached_artifacts(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("normal_"))
            .count()
    }

    #[test]
    fn test_endword_matching() {
        let words = vec!["再见".to_string(), String::new()];
        assert!(is_endword("好的，再见了", &words));
        assert!(!is_endword("你好", &words));
        assert!(!is_endword("anything", &[]));
    }

    #[test]
    fn test_turn_replies_through_cache() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let channel = ScriptedChannel::final_on_last("今天天气怎么样");
        let h = harness(&rt, speech(), channel, settings());

        let outcome = h.assistant.run_turn();
        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                transcript: "今天天气怎么样".into(),
                reply: "你说的是今天天气怎么样".into(),
            }
        );
        assert_eq!(*h.dialogue.heard.lock(), vec!["今天天气怎么样".to_string()]);
        assert_eq!(h.synth.calls(), 1);
        assert_eq!(cached_artifacts(h.cache_dir.path()), 1);
        assert_eq!(h.assistant.state().current(), AssistantState::Sleep);
    }

    #[test]
    fn test_streamed_reply_is_played() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let h = harness(
            &rt,
            speech(),
            ScriptedChannel::final_on_last("你好"),
            TurnSettings {
                streaming: true,
                ..settings()
            },
        );

        let outcome = h.assistant.run_turn();
        let TurnOutcome::Replied { reply, .. } = outcome else {
            panic!("expected a reply, got {outcome:?}");
        };
        // One 160-sample chunk per reply character.
        assert_eq!(h.sink.samples.lock().len(), reply.chars().count() * 160);
        assert_eq!(cached_artifacts(h.cache_dir.path()), 0);
    }

    #[test]
    fn test_endword_ends_conversation() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let h = harness(&rt, speech(), ScriptedChannel::final_on_last("好的再见"), settings());

        assert_eq!(
            h.assistant.run_turn(),
            TurnOutcome::Goodbye {
                transcript: "好的再见".into()
            }
        );
        assert!(h.dialogue.cleared.load(Ordering::SeqCst));
        assert!(h.dialogue.heard.lock().is_empty());
    }

    #[test]
    fn test_empty_transcript_is_not_heard() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut s = settings();
        s.prompts.insert(prompts::NOT_HEARD.into(), "我没有听清".into());
        let h = harness(&rt, speech(), ScriptedChannel::final_on_last(""), s);

        assert_eq!(h.assistant.run_turn(), TurnOutcome::NotHeard);
        assert!(h.dialogue.heard.lock().is_empty());
        // The missing prompt was synthesized on demand.
        assert_eq!(h.synth.calls(), 1);
    }

    #[test]
    fn test_unreachable_recognizer_is_not_heard() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut s = settings();
        s.prompts.insert(prompts::NOT_HEARD.into(), "我没有听清".into());
        let h = harness(&rt, speech(), ScriptedChannel::final_on_last("x").failing_open(), s);

        assert_eq!(h.assistant.run_turn(), TurnOutcome::NotHeard);
        assert!(h.dialogue.heard.lock().is_empty());
        assert_eq!(h.synth.calls(), 1);
        assert_eq!(h.assistant.state().current(), AssistantState::Sleep);
    }

    #[test]
    fn test_no_audio_without_device_input() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let h = harness(&rt, Vec::new(), ScriptedChannel::final_on_last("x"), settings());

        assert_eq!(h.assistant.run_turn(), TurnOutcome::NoAudio);
        assert_eq!(h.synth.calls(), 0);
        assert_eq!(h.assistant.state().current(), AssistantState::Sleep);
    }
}
