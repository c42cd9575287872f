//! aispeaker: wake-word voice assistant.
//! Microphone → endpointed streaming recognition → dialogue → cached or
//! streamed synthesis → serialized playback.

pub mod asr;
pub mod assistant;
pub mod audio;
pub mod auth;
pub mod cache;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod state_machine;
pub mod tts;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info, warn};

use assistant::{Assistant, AssistantParts, TurnSettings};
use asr::{StreamingRecognizer, XunfeiIatChannel};
use audio::playback::{CpalSink, PlaybackArbiter};
use audio::recorder::Recorder;
use audio::wake::{EnergyPatternDetector, WakeWordEngine};
use audio::{AudioSource, CpalSource};
use cache::ResultCache;
use config::AppConfig;
use dialogue::DialogueClient;
use error::{Error, Result};
use metrics::MetricsRegistry;
use state_machine::StateMachine;
use tts::XunfeiTts;

/// Load configuration, open devices and run the wake loop until Ctrl-C.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = match AppConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            logging::init(&config::LoggingConfig::default());
            error!(path = %config_path.display(), error = %e, "config load failed");
            return Err(e);
        }
    };
    logging::init(&config.logging);
    info!(config = %config_path.display(), "aispeaker starting");

    if !config.asr.credentials.is_complete() {
        warn!("recognition credentials incomplete; recognition will fail");
    }
    if !config.tts.credentials.is_complete() {
        warn!("synthesis credentials incomplete; prompts and replies will be silent");
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let state = Arc::new(StateMachine::new());

    // Capture is shared by the wake engine and the recorder; they never read at once.
    let source: Arc<dyn AudioSource> = Arc::new(CpalSource::open(
        config.audio.input_device.as_deref(),
        config.audio.sample_rate,
        config.audio.buffer_secs,
    )?);
    let playback = Arc::new(
        PlaybackArbiter::new(Arc::new(CpalSink::open(config.audio.output_device.as_deref())?))
            .with_poll_interval(config.playback.poll_interval),
    );

    let channel = XunfeiIatChannel::new(
        config.asr.endpoint.clone(),
        config.asr.credentials.clone(),
        config.asr.business.clone(),
        config.audio.sample_rate,
    )
    .with_connect_timeout(config.asr.connect_timeout);
    let recognizer = StreamingRecognizer::new(Arc::new(channel), config.asr.recognizer.clone());

    let synthesizer = Arc::new(
        XunfeiTts::new(
            config.tts.endpoint.clone(),
            config.tts.credentials.clone(),
            config.tts.voice.clone(),
            &config.tts.temp_dir,
        )?
        .with_retry(config.tts.max_attempts, config.tts.retry_wait)
        .with_timeout(config.tts.timeout),
    );
    let dialogue = Arc::new(DialogueClient::new(config.dialogue.clone())?);

    let cache = Arc::new(ResultCache::open(&config.cache.dir)?);
    let prepared = cache.prepare_named(&config.prompts, synthesizer.as_ref()).await;
    info!(prepared, total = config.prompts.len(), "named prompts ready");

    let recorder = Recorder::new(Arc::clone(&source), config.audio.block_size)
        .with_metric(config.recorder.metric)
        .with_read_timeout(config.recorder.read_timeout)
        .with_diagnostics(config.recorder.diagnostics_path.clone());

    let settings = TurnSettings {
        max_duration_secs: config.recorder.max_duration.as_secs_f32(),
        silence_threshold: config.recorder.silence_threshold,
        silence_duration_secs: config.recorder.silence_duration.as_secs_f32(),
        endwords: config.endwords.clone(),
        prompts: config.prompts.clone(),
        streaming: config.tts.streaming,
        idle_timeout: config.playback.idle_timeout,
        cache_max_entries: config.cache.max_entries,
        cache_max_bytes: config.cache.max_total_bytes,
    };
    let assistant = Assistant::new(
        AssistantParts {
            recorder,
            recognizer,
            dialogue,
            synthesizer,
            cache,
            playback,
            state,
            metrics: Arc::clone(&metrics),
        },
        settings,
        tokio::runtime::Handle::current(),
    );

    let mut engine = WakeWordEngine::new(
        Arc::clone(&source),
        Box::new(EnergyPatternDetector::new(config.wake.spike_ratio)),
        config.wake.confirmer.clone(),
        config.audio.block_size,
    );
    let stop = engine.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, stopping after the current turn"),
            Err(e) => warn!(error = %e, "ctrl-c handler unavailable; stopping"),
        }
        stop.store(true, Ordering::SeqCst);
    });

    let wake_loop = tokio::task::spawn_blocking(move || {
        assistant.greet();
        engine.start(|| {
            assistant.run_turn();
        })
    });
    let result = wake_loop
        .await
        .map_err(|e| Error::Device(format!("wake loop aborted: {e}")))?;

    metrics.log_summary();
    match &result {
        Ok(()) => info!("aispeaker stopped"),
        Err(e) => error!(error = %e, class = e.class(), "wake loop failed"),
    }
    result
}
