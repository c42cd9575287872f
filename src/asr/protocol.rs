//! Frame model of the streaming recognition protocol and its JSON codec.
//! Outbound: first frame carries session meta + business params; later frames
//! carry only audio data. Inbound: error code, status and a word lattice.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Position of a frame within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameStatus {
    First,
    Continuation,
    Last,
}

impl FrameStatus {
    pub fn wire_code(self) -> u8 {
        match self {
            FrameStatus::First => 0,
            FrameStatus::Continuation => 1,
            FrameStatus::Last => 2,
        }
    }
}

/// One outbound audio frame. `audio` is little-endian PCM16.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub seq: usize,
    pub status: FrameStatus,
    pub audio: Vec<u8>,
}

/// One decoded inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub code: i64,
    pub message: String,
    pub sid: Option<String>,
    pub fragment: String,
    pub is_final: bool,
}

impl InboundMessage {
    pub fn is_error(&self) -> bool {
        self.code != 0
    }

    pub fn partial(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            ..Default::default()
        }
    }

    pub fn final_result(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            is_final: true,
            ..Default::default()
        }
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Recognition parameters sent once, in the first frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusinessParams {
    pub language: String,
    pub domain: String,
    pub accent: String,
    /// Remote endpointing: trailing silence (ms) after which the service finalizes.
    pub vad_eos: u32,
}

impl Default for BusinessParams {
    fn default() -> Self {
        Self {
            language: "zh_cn".into(),
            domain: "iat".into(),
            accent: "mandarin".into(),
            vad_eos: 3000,
        }
    }
}

/// Encodes frames and decodes messages for one application id.
#[derive(Debug, Clone)]
pub struct IatCodec {
    app_id: String,
    business: BusinessParams,
    format: String,
}

impl IatCodec {
    pub fn new(app_id: impl Into<String>, business: BusinessParams, sample_rate: u32) -> Self {
        Self {
            app_id: app_id.into(),
            business,
            format: format!("audio/L16;rate={sample_rate}"),
        }
    }

    pub fn encode(&self, frame: &OutboundFrame) -> String {
        let data = serde_json::json!({
            "status": frame.status.wire_code(),
            "format": self.format,
            "encoding": "raw",
            "audio": BASE64.encode(&frame.audio),
        });
        let value = match frame.status {
            FrameStatus::First => serde_json::json!({
                "common": {"app_id": self.app_id},
                "business": self.business,
                "data": data,
            }),
            FrameStatus::Continuation | FrameStatus::Last => serde_json::json!({ "data": data }),
        };
        value.to_string()
    }

    pub fn decode(text: &str) -> Result<InboundMessage> {
        let wire: WireMessage = serde_json::from_str(text)?;
        let (fragment, is_final) = match wire.data {
            Some(data) => {
                let (fragment, last) = match data.result {
                    Some(result) => {
                        let fragment = result
                            .ws
                            .iter()
                            .flat_map(|w| w.cw.iter())
                            .map(|c| c.w.as_str())
                            .collect::<String>();
                        (fragment, result.ls)
                    }
                    None => (String::new(), false),
                };
                (fragment, last || data.status == 2)
            }
            None => (String::new(), false),
        };
        Ok(InboundMessage {
            code: wire.code,
            message: wire.message,
            sid: wire.sid,
            fragment,
            is_final,
        })
    }
}

// --- Inbound wire types ---

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    data: Option<WireData>,
}

#[derive(Deserialize)]
struct WireData {
    #[serde(default)]
    status: u8,
    #[serde(default)]
    result: Option<WireResult>,
}

#[derive(Deserialize)]
struct WireResult {
    #[serde(default)]
    ws: Vec<WireWord>,
    #[serde(default)]
    ls: bool,
}

#[derive(Deserialize)]
struct WireWord {
    #[serde(default)]
    cw: Vec<WireCandidate>,
}

#[derive(Deserialize)]
struct WireCandidate {
    #[serde(default)]
    w: String,
}
