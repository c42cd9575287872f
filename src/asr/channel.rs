//! Bidirectional recognition channel.
//! `RecognitionChannel::open` yields a frame sink and a message stream over one
//! connection. The websocket implementation signs its URL per connection.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use super::protocol::{BusinessParams, IatCodec, InboundMessage, OutboundFrame};
use crate::auth::{signed_url, Credentials};
use crate::error::{Error, Result};

pub type FrameSink = Pin<Box<dyn Sink<OutboundFrame, Error = Error> + Send>>;
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<InboundMessage>> + Send>>;

/// A factory for per-session duplex channels.
#[async_trait]
pub trait RecognitionChannel: Send + Sync {
    async fn open(&self) -> Result<(FrameSink, MessageStream)>;
}

/// iFlytek-style streaming dictation over a websocket.
pub struct XunfeiIatChannel {
    endpoint: String,
    credentials: Credentials,
    codec: Arc<IatCodec>,
    connect_timeout: Duration,
}

impl XunfeiIatChannel {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: Credentials,
        business: BusinessParams,
        sample_rate: u32,
    ) -> Self {
        let codec = Arc::new(IatCodec::new(credentials.app_id.clone(), business, sample_rate));
        Self {
            endpoint: endpoint.into(),
            credentials,
            codec,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl RecognitionChannel for XunfeiIatChannel {
    async fn open(&self) -> Result<(FrameSink, MessageStream)> {
        let url = signed_url(&self.endpoint, &self.credentials, chrono::Utc::now())?;
        let (ws, response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| Error::Timeout(self.connect_timeout))??;
        info!(status = response.status().as_u16(), "recognition channel connected");

        let (ws_sink, ws_stream) = ws.split();

        let codec = Arc::clone(&self.codec);
        let sink = ws_sink.sink_map_err(Error::from).with(move |frame: OutboundFrame| {
            let text = codec.encode(&frame);
            async move { Ok::<_, Error>(Message::text(text)) }
        });

        let stream = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(IatCodec::decode(text.as_str())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "recognition channel closed by peer");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            }
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory channel driven by a responder closure.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::asr::protocol::FrameStatus;

    type Responder = dyn Fn(&OutboundFrame) -> Vec<InboundMessage> + Send + Sync;

    /// Every frame is recorded with its arrival time; the responder's replies
    /// are queued on the inbound stream in order.
    pub struct ScriptedChannel {
        responder: Arc<Responder>,
        pub frames: Arc<Mutex<Vec<(tokio::time::Instant, OutboundFrame)>>>,
        pub opened: AtomicUsize,
        /// Keep the inbound stream open after the sink is dropped.
        hold_open: bool,
        held: Mutex<Vec<mpsc::UnboundedSender<Result<InboundMessage>>>>,
        fail_open: bool,
        /// Close the inbound stream after replying to this frame; sends still succeed.
        hang_up_after: Option<usize>,
    }

    impl ScriptedChannel {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&OutboundFrame) -> Vec<InboundMessage> + Send + Sync + 'static,
        {
            Self {
                responder: Arc::new(responder),
                frames: Arc::new(Mutex::new(Vec::new())),
                opened: AtomicUsize::new(0),
                hold_open: false,
                held: Mutex::new(Vec::new()),
                fail_open: false,
                hang_up_after: None,
            }
        }

        /// Replies with `fragment` as final on the LAST frame.
        pub fn final_on_last(fragment: &'static str) -> Self {
            Self::new(move |frame| match frame.status {
                FrameStatus::Last => vec![InboundMessage::final_result(fragment)],
                _ => vec![],
            })
        }

        pub fn holding_open(mut self) -> Self {
            self.hold_open = true;
            self
        }

        pub fn failing_open(mut self) -> Self {
            self.fail_open = true;
            self
        }

        pub fn hanging_up_after(mut self, seq: usize) -> Self {
            self.hang_up_after = Some(seq);
            self
        }

        pub fn statuses(&self) -> Vec<FrameStatus> {
            self.frames.lock().iter().map(|(_, f)| f.status).collect()
        }
    }

    #[async_trait]
    impl RecognitionChannel for ScriptedChannel {
        async fn open(&self) -> Result<(FrameSink, MessageStream)> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(Error::Transport("connection refused".into()));
            }

            let (tx, rx) = mpsc::unbounded_channel::<Result<InboundMessage>>();
            if self.hold_open {
                self.held.lock().push(tx.clone());
            }

            let hang_up_after = self.hang_up_after;
            let state = (Arc::clone(&self.responder), Arc::clone(&self.frames), Some(tx));
            let sink = futures_util::sink::unfold(state, move |state, frame: OutboundFrame| {
                let (responder, frames, mut tx) = state;
                async move {
                    let replies = responder(&frame);
                    let seq = frame.seq;
                    frames.lock().push((tokio::time::Instant::now(), frame));
                    if let Some(inbound) = &tx {
                        for reply in replies {
                            let _ = inbound.send(Ok(reply));
                        }
                    }
                    if hang_up_after == Some(seq) {
                        tx = None;
                    }
                    Ok::<_, Error>((responder, frames, tx))
                }
            });

            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });

            Ok((Box::pin(sink), Box::pin(stream)))
        }
    }
}
