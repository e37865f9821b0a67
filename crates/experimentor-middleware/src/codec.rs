//! Wire format of one relayed message.
//!
//! Every message travels as three consecutive WebSocket frames on the same
//! connection:
//!
//! | # | Frame | Content |
//! |---|---|---|
//! | 1 | `Text` | topic (may be empty: the broadcast topic) |
//! | 2 | `Text` | [`Metadata`] as JSON |
//! | 3 | `Binary` | payload body (JSON bytes, or raw little-endian array data) |
//!
//! The relay never decodes the body; it forwards the three frames as it
//! received them.

use bytes::Bytes;
use experimentor_types::{ExpError, Metadata, Payload};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

/// One message as it crosses the relay.
///
/// The metadata is kept both parsed and as the text it arrived in; the
/// text is what goes back on the wire, so keys this crate does not know
/// about survive the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub metadata: Metadata,
    metadata_text: Utf8Bytes,
    pub body: Bytes,
}

impl Envelope {
    /// Encode `payload` for sending on `topic`.
    pub fn encode(topic: &str, payload: &Payload, seq: u64) -> Result<Self, ExpError> {
        Self::new(topic, payload.metadata(seq), Bytes::from(payload.to_bytes()?))
    }

    /// An envelope from already-encoded parts.  Nothing checks that `body`
    /// matches `metadata`; receivers do.
    pub fn new(topic: &str, metadata: Metadata, body: Bytes) -> Result<Self, ExpError> {
        let metadata_text = serde_json::to_string(&metadata)?.into();
        Ok(Self {
            topic: topic.to_string(),
            metadata,
            metadata_text,
            body,
        })
    }

    /// Decode the body according to the metadata.
    pub fn payload(&self) -> Result<Payload, ExpError> {
        Payload::from_bytes(&self.metadata, &self.body)
    }

    /// Metadata exactly as it will be sent.
    pub fn metadata_text(&self) -> &str {
        self.metadata_text.as_str()
    }

    /// `true` for a non-array body equal to the JSON string `sentinel`.
    ///
    /// Only bodies that look like a JSON string are decoded, so this is cheap
    /// enough to run on every relayed message.
    pub fn carries_sentinel(&self, sentinel: &str) -> bool {
        if self.metadata.array || self.body.first() != Some(&b'"') {
            return false;
        }
        matches!(self.payload(), Ok(p) if p.is_sentinel(sentinel))
    }

    /// The three frames, in sending order.
    pub fn frames(&self) -> [Message; 3] {
        [
            Message::Text(self.topic.clone().into()),
            Message::Text(self.metadata_text.clone()),
            Message::Binary(self.body.clone()),
        ]
    }
}

#[derive(Debug, Default)]
enum Expecting {
    #[default]
    Topic,
    Metadata {
        topic: String,
    },
    Body {
        topic: String,
        metadata: Metadata,
        metadata_text: Utf8Bytes,
    },
}

/// Rebuilds [`Envelope`]s from a stream of WebSocket frames.
///
/// Control frames (ping, pong, close) are ignored; the caller decides what a
/// close means.  A frame of the wrong kind resets the assembler and reports a
/// [`ExpError::Codec`] error so the stream can resynchronise on the next
/// topic frame.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    state: Expecting,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame. Returns `Some` when it completed a message.
    pub fn push(&mut self, frame: Message) -> Result<Option<Envelope>, ExpError> {
        if matches!(
            frame,
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_)
        ) {
            return Ok(None);
        }
        let state = std::mem::take(&mut self.state);
        match (state, frame) {
            (Expecting::Topic, Message::Text(topic)) => {
                self.state = Expecting::Metadata {
                    topic: topic.as_str().to_string(),
                };
                Ok(None)
            }
            (Expecting::Metadata { topic }, Message::Text(raw)) => {
                let metadata: Metadata = serde_json::from_str(raw.as_str())
                    .map_err(|e| ExpError::Codec(format!("bad metadata on '{topic}': {e}")))?;
                self.state = Expecting::Body {
                    topic,
                    metadata,
                    metadata_text: raw,
                };
                Ok(None)
            }
            (
                Expecting::Body {
                    topic,
                    metadata,
                    metadata_text,
                },
                Message::Binary(body),
            ) => Ok(Some(Envelope {
                topic,
                metadata,
                metadata_text,
                body,
            })),
            (state, frame) => Err(ExpError::Codec(format!(
                "unexpected {} frame while waiting for {}",
                frame_kind(&frame),
                state.describe()
            ))),
        }
    }

    /// `true` when no message is partially assembled.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, Expecting::Topic)
    }
}

impl Expecting {
    fn describe(&self) -> &'static str {
        match self {
            Expecting::Topic => "a topic",
            Expecting::Metadata { .. } => "metadata",
            Expecting::Body { .. } => "a payload",
        }
    }
}

fn frame_kind(frame: &Message) -> &'static str {
    match frame {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}
