use bytes::Bytes;
use chrono::SecondsFormat;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use zeromq::ZmqMessage;

use crate::error::WireError;

/// Separates routing frames from the message body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

const PROTOCOL_VERSION: &str = "5.3";
const USERNAME: &str = "orrery";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub version: String,
}

impl Header {
    pub fn new(msg_id: impl Into<String>, msg_type: impl Into<String>, session: &str) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_type: msg_type.into(),
            session: session.to_string(),
            username: USERNAME.to_string(),
            date: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// The message types this crate acts on. Everything else decodes to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ExecuteRequest,
    ExecuteReply,
    DisplayData,
    ExecuteResult,
    ExecuteInput,
    Status,
    Stream,
    Error,
    Other,
}

impl From<&str> for MessageKind {
    fn from(msg_type: &str) -> Self {
        match msg_type {
            "execute_request" => MessageKind::ExecuteRequest,
            "execute_reply" => MessageKind::ExecuteReply,
            "display_data" => MessageKind::DisplayData,
            "execute_result" | "pyout" => MessageKind::ExecuteResult,
            "execute_input" | "pyin" => MessageKind::ExecuteInput,
            "status" => MessageKind::Status,
            "stream" => MessageKind::Stream,
            "error" | "pyerr" => MessageKind::Error,
            _ => MessageKind::Other,
        }
    }
}

/// One protocol message as it travels over a channel socket:
///
/// `[identities..] <IDS|MSG> signature header parent_header metadata content [buffers..]`
///
/// Kernels are launched without a session key, so the signature frame is
/// always sent empty and ignored on receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub identities: Vec<Bytes>,
    pub header: Header,
    pub parent_header: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub content: Value,
    pub buffers: Vec<Bytes>,
}

impl WireMessage {
    pub fn new(header: Header, content: Value) -> Self {
        Self {
            identities: Vec::new(),
            header,
            parent_header: Map::new(),
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        }
    }

    /// Builds a message caused by `parent`, routed back to the same peers.
    pub fn reply_to(parent: &WireMessage, header: Header, content: Value) -> Self {
        let parent_header = match serde_json::to_value(&parent.header) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Self {
            identities: parent.identities.clone(),
            parent_header,
            ..Self::new(header, content)
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from(self.header.msg_type.as_str())
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        T::deserialize(&self.content).map_err(|source| WireError::Json {
            frame: "content",
            source,
        })
    }

    pub fn from_frames(frames: Vec<Bytes>) -> Result<Self, WireError> {
        if frames.is_empty() {
            return Err(WireError::Empty);
        }

        let delimiter = frames
            .iter()
            .position(|frame| frame.as_ref() == DELIMITER)
            .ok_or(WireError::MissingDelimiter)?;

        let mut frames = frames.into_iter();
        let identities = frames.by_ref().take(delimiter).collect();
        frames.next();

        frames.next().ok_or(WireError::MissingFrame("signature"))?;
        let header = parse_frame(frames.next(), "header")?;
        let parent_header = parse_frame(frames.next(), "parent_header")?;
        let metadata = parse_frame(frames.next(), "metadata")?;
        let content = parse_frame(frames.next(), "content")?;

        Ok(Self {
            identities,
            header,
            parent_header,
            metadata,
            content,
            buffers: frames.collect(),
        })
    }

    pub fn into_frames(self) -> Result<Vec<Bytes>, WireError> {
        let mut frames = self.identities;
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::new());
        frames.push(encode_frame(&self.header, "header")?);
        frames.push(encode_frame(&self.parent_header, "parent_header")?);
        frames.push(encode_frame(&self.metadata, "metadata")?);
        frames.push(encode_frame(&self.content, "content")?);
        frames.extend(self.buffers);

        Ok(frames)
    }
}

impl TryFrom<ZmqMessage> for WireMessage {
    type Error = WireError;

    fn try_from(message: ZmqMessage) -> Result<Self, Self::Error> {
        Self::from_frames(message.into_vec())
    }
}

impl TryFrom<WireMessage> for ZmqMessage {
    type Error = WireError;

    fn try_from(message: WireMessage) -> Result<Self, Self::Error> {
        ZmqMessage::try_from(message.into_frames()?).map_err(|_| WireError::Empty)
    }
}

fn parse_frame<T: DeserializeOwned>(
    frame: Option<Bytes>,
    name: &'static str,
) -> Result<T, WireError> {
    let frame = frame.ok_or(WireError::MissingFrame(name))?;
    serde_json::from_slice(&frame).map_err(|source| WireError::Json {
        frame: name,
        source,
    })
}

fn encode_frame<T: Serialize>(value: &T, name: &'static str) -> Result<Bytes, WireError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| WireError::Json {
            frame: name,
            source,
        })
}
