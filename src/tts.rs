//! Speech synthesis.
//! `Synthesizer` is the seam the cache and the turn loop use: one-shot
//! synthesis to a temporary file, or a stream of raw PCM chunks for
//! immediate playback. `XunfeiTts` implements it over a signed websocket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::{signed_url, Credentials};
use crate::error::{Error, Result};

/// Encoding of synthesized audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    /// Raw 16kHz mono little-endian PCM16.
    Pcm,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Pcm => "pcm",
        }
    }

    fn aue(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "lame",
            AudioFormat::Pcm => "raw",
        }
    }
}

/// Parameters that change the synthesized audio; all of them feed the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: u8,
    pub volume: u8,
    pub pitch: u8,
    pub format: AudioFormat,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: "x4_yezi".into(),
            speed: 50,
            volume: 50,
            pitch: 50,
            format: AudioFormat::Mp3,
        }
    }
}

/// PCM chunks of a streamed synthesis, 16kHz mono. An `Err` ends the stream.
pub type PcmChunks = mpsc::Receiver<Result<Vec<i16>>>;

/// Sample rate of streamed synthesis output.
pub const STREAM_SAMPLE_RATE: u32 = 16_000;

#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn params(&self) -> &VoiceParams;

    /// Synthesize `text` to a new temporary file owned by the caller.
    async fn synthesize(&self, text: &str) -> Result<PathBuf>;

    /// Start synthesizing `text`; PCM arrives on the returned channel as the service produces it.
    async fn synthesize_stream(&self, text: &str) -> Result<PcmChunks>;
}

/// Websocket TTS client.
#[derive(Clone)]
pub struct XunfeiTts {
    endpoint: String,
    credentials: Credentials,
    params: VoiceParams,
    temp_dir: PathBuf,
    max_attempts: u32,
    retry_wait: Duration,
    timeout: Duration,
}

impl XunfeiTts {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: Credentials,
        params: VoiceParams,
        temp_dir: &Path,
    ) -> Result<Self> {
        std::fs::create_dir_all(temp_dir)?;
        Ok(Self {
            endpoint: endpoint.into(),
            credentials,
            params,
            temp_dir: temp_dir.to_path_buf(),
            max_attempts: 3,
            retry_wait: Duration::from_secs(2),
            timeout: Duration::from_secs(15),
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, wait: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_wait = wait;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One websocket session. Audio chunks go to `out`; a closed `out` ends the session early.
    async fn run_session(
        &self,
        text: &str,
        format: AudioFormat,
        out: mpsc::Sender<Vec<u8>>,
    ) -> Result<usize> {
        let url = signed_url(&self.endpoint, &self.credentials, chrono::Utc::now())?;
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (mut ws, _) = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let request = build_request(&self.credentials.app_id, &self.params, format, text);
        ws.send(Message::text(request)).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut total = 0usize;
        loop {
            let msg = match tokio::time::timeout_at(deadline, ws.next()).await {
                Err(_) => return Err(Error::Timeout(self.timeout)),
                Ok(None) => return Err(closed_before_end()),
                Ok(Some(msg)) => msg?,
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => return Err(closed_before_end()),
                _ => continue,
            };

            let reply = decode_reply(text.as_str())?;
            if reply.code != 0 {
                warn!(
                    code = reply.code,
                    sid = %reply.sid,
                    message = %reply.message,
                    "synthesis service returned error"
                );
                return Err(Error::Protocol {
                    code: reply.code,
                    message: reply.message,
                });
            }
            total += reply.audio.len();
            if !reply.audio.is_empty() && out.send(reply.audio).await.is_err() {
                debug!("synthesis consumer gone, closing early");
                break;
            }
            if reply.done {
                break;
            }
        }

        let _ = ws.close(None).await;
        Ok(total)
    }

    async fn synthesize_once(&self, text: &str) -> Result<PathBuf> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let collect = async move {
            let mut audio = Vec::new();
            while let Some(chunk) = rx.recv().await {
                audio.extend_from_slice(&chunk);
            }
            audio
        };
        let (result, audio) = tokio::join!(self.run_session(text, self.params.format, tx), collect);
        result?;
        if audio.is_empty() {
            return Err(Error::Synthesis("service returned no audio".into()));
        }

        let path = self
            .temp_dir
            .join(format!("tts-{}.{}", uuid::Uuid::new_v4(), self.params.format.extension()));
        tokio::fs::write(&path, &audio).await?;
        Ok(path)
    }
}

#[async_trait]
impl Synthesizer for XunfeiTts {
    fn params(&self) -> &VoiceParams {
        &self.params
    }

    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        let started = std::time::Instant::now();
        let mut attempt = 1;
        loop {
            match self.synthesize_once(text).await {
                Ok(path) => {
                    info!(
                        chars = text.chars().count(),
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        path = %path.display(),
                        "synthesis complete"
                    );
                    return Ok(path);
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        error = %e,
                        wait_ms = self.retry_wait.as_millis() as u64,
                        "synthesis failed, retrying"
                    );
                    tokio::time::sleep(self.retry_wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(attempts = attempt, error = %e, "synthesis failed");
                    return Err(e);
                }
            }
        }
    }

    async fn synthesize_stream(&self, text: &str) -> Result<PcmChunks> {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let text = text.to_string();

        tokio::spawn(async move {
            let (byte_tx, mut byte_rx) = mpsc::channel::<Vec<u8>>(64);
            let chunk_tx = tx.clone();
            let forward = async move {
                let mut pcm = PcmAssembler::default();
                while let Some(bytes) = byte_rx.recv().await {
                    if chunk_tx.send(Ok(pcm.push(&bytes))).await.is_err() {
                        break;
                    }
                }
                if pcm.has_pending() {
                    debug!("dropping trailing odd byte of streamed audio");
                }
            };
            let session = this.run_session(&text, AudioFormat::Pcm, byte_tx);
            let (result, ()) = tokio::join!(session, forward);
            match result {
                Ok(bytes) => debug!(bytes, "streamed synthesis finished"),
                Err(e) => {
                    warn!(error = %e, "streamed synthesis failed");
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        Ok(rx)
    }
}

pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Decodes little-endian samples from chunks that may split a sample;
/// an odd trailing byte is held for the next chunk.
#[derive(Debug, Default)]
pub struct PcmAssembler {
    pending: Option<u8>,
}

impl PcmAssembler {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut rest = bytes;
        let mut out = Vec::with_capacity(bytes.len() / 2 + 1);
        if let Some(low) = self.pending.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    out.push(i16::from_le_bytes([low, high]));
                    rest = tail;
                }
                None => {
                    self.pending = Some(low);
                    return out;
                }
            }
        }
        out.extend(pcm_from_le_bytes(rest));
        if rest.len() % 2 == 1 {
            self.pending = rest.last().copied();
        }
        out
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

fn closed_before_end() -> Error {
    Error::Transport("synthesis channel closed before end".into())
}

fn build_request(app_id: &str, params: &VoiceParams, format: AudioFormat, text: &str) -> String {
    serde_json::json!({
        "common": {"app_id": app_id},
        "business": {
            "aue": format.aue(),
            "auf": format!("audio/L16;rate={STREAM_SAMPLE_RATE}"),
            "vcn": params.voice,
            "tte": "utf8",
            "sfl": 1,
            "speed": params.speed,
            "volume": params.volume,
            "pitch": params.pitch,
        },
        "data": {
            "status": 2,
            "text": BASE64.encode(text.as_bytes()),
        },
    })
    .to_string()
}

struct TtsReply {
    code: i64,
    message: String,
    sid: String,
    audio: Vec<u8>,
    done: bool,
}

fn decode_reply(text: &str) -> Result<TtsReply> {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(default)]
        code: i64,
        #[serde(default)]
        message: String,
        #[serde(default)]
        sid: String,
        #[serde(default)]
        data: Option<WireData>,
    }
    #[derive(Deserialize)]
    struct WireData {
        #[serde(default)]
        audio: String,
        #[serde(default)]
        status: u8,
    }

    let wire: Wire = serde_json::from_str(text)?;
    let (audio, done) = match wire.data {
        Some(data) => {
            let audio = BASE64
                .decode(data.audio.as_bytes())
                .map_err(|e| Error::Synthesis(format!("bad audio payload: {e}")))?;
            (audio, data.status == 2)
        }
        None => (Vec::new(), false),
    };
    Ok(TtsReply {
        code: wire.code,
        message: wire.message,
        sid: wire.sid,
        audio,
        done,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthesizer fake writing deterministic files.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub struct FakeSynthesizer {
        params: VoiceParams,
        dir: PathBuf,
        pub calls: AtomicUsize,
        pub fail: bool,
        pub delay: Duration,
    }

    impl FakeSynthesizer {
        pub fn new(dir: &Path) -> Self {
            Self {
                params: VoiceParams::default(),
                dir: dir.to_path_buf(),
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Synthesizer for FakeSynthesizer {
        fn params(&self) -> &VoiceParams {
            &self.params
        }

        async fn synthesize(&self, text: &str) -> Result<PathBuf> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Synthesis("fake failure".into()));
            }
            let path = self.dir.join(format!("fake-{n}.{}", self.params.format.extension()));
            tokio::fs::write(&path, text.as_bytes()).await?;
            Ok(path)
        }

        async fn synthesize_stream(&self, text: &str) -> Result<PcmChunks> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Synthesis("fake failure".into()));
            }
            let (tx, rx) = mpsc::channel(8);
            let len = text.chars().count();
            tokio::spawn(async move {
                for _ in 0..len {
                    if tx.send(Ok(vec![100i16; 160])).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_voice_and_text() {
        let body = build_request("app", &VoiceParams::default(), AudioFormat::Mp3, "你好");
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["common"]["app_id"], "app");
        assert_eq!(v["business"]["aue"], "lame");
        assert_eq!(v["business"]["vcn"], "x4_yezi");
        assert_eq!(v["business"]["speed"], 50);
        assert_eq!(v["data"]["status"], 2);
        let text = BASE64.decode(v["data"]["text"].as_str().unwrap()).unwrap();
        assert_eq!(String::from_utf8(text).unwrap(), "你好");

        let raw = build_request("app", &VoiceParams::default(), AudioFormat::Pcm, "x");
        assert!(raw.contains("\"aue\":\"raw\""));
    }

    #[test]
    fn test_decode_reply_audio_and_end() {
        let raw = r#"{"code":0,"sid":"tts1","data":{"audio":"AQACAA==","status":2}}"#;
        let reply = decode_reply(raw).unwrap();
        assert_eq!(reply.audio, vec![1, 0, 2, 0]);
        assert!(reply.done);
        assert_eq!(pcm_from_le_bytes(&reply.audio), vec![1, 2]);

        let err = decode_reply(r#"{"code":10005,"message":"licc failed","sid":"tts2"}"#).unwrap();
        assert_eq!(err.code, 10005);
        assert!(err.audio.is_empty());
        assert!(!err.done);
    }

    #[test]
    fn test_samples_split_across_chunks_stay_aligned() {
        let samples: Vec<i16> = vec![1, -2, 300, -32768, 32767];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut pcm = PcmAssembler::default();
        let mut out = Vec::new();
        for chunk in [&bytes[..3], &bytes[3..4], &bytes[4..4], &bytes[4..9], &bytes[9..]] {
            out.extend(pcm.push(chunk));
        }
        assert_eq!(out, samples);
        assert!(!pcm.has_pending());

        assert!(pcm.push(&[7]).is_empty());
        assert!(pcm.has_pending());
    }

    #[test]
    fn test_voice_params_from_yaml() {
        let yaml = "voice: xiaoyan\nspeed: 60\nformat: pcm\n";
        let p: VoiceParams = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.voice, "xiaoyan");
        assert_eq!(p.speed, 60);
        assert_eq!(p.volume, 50);
        assert_eq!(p.format, AudioFormat::Pcm);
    }
}
