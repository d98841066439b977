//! JSON control frames exchanged with the synthesis service.
//!
//! # Outbound (client → service)
//!
//! ```json
//! {"type":"Clear"}
//! {"type":"Speak","text":"Hello"}
//! {"type":"Flush"}
//! ```
//!
//! # Inbound (service → client)
//!
//! ```json
//! {"type":"Metadata","request_id":"...","model_name":"aura-asteria-en"}
//! {"type":"SpeechEnded"}
//! {"type":"Error","err_code":"...","description":"..."}
//! {"type":"Flushed","sequence_id":0}
//! {"type":"Cleared","sequence_id":0}
//! {"type":"Warning","warn_code":"...","description":"..."}
//! ```
//!
//! Audio arrives as binary frames and never goes through this module.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Outbound
// =============================================================================

/// Control frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    /// Discard anything the service has queued for the current utterance.
    Clear,
    /// Text to synthesize.
    Speak { text: String },
    /// Synthesize everything sent so far without waiting for more text.
    Flush,
}

impl OutboundFrame {
    pub fn speak(text: impl Into<String>) -> Self {
        Self::Speak { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::Speak { .. } => "Speak",
            Self::Flush => "Flush",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Stream metadata announced by the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetadataFrame {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
    /// Any other fields, kept for logging.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Control frames the service sends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    Metadata(MetadataFrame),
    SpeechEnded,
    Error {
        #[serde(default)]
        err_code: Option<String>,
        #[serde(default = "unknown_description")]
        description: String,
    },
    Flushed {
        #[serde(default)]
        sequence_id: Option<u64>,
    },
    Cleared {
        #[serde(default)]
        sequence_id: Option<u64>,
    },
    Warning {
        #[serde(default)]
        warn_code: Option<String>,
        #[serde(default)]
        description: String,
    },
    /// Well-formed frame with a type this client does not know.
    #[serde(skip)]
    Unknown { kind: String },
}

fn unknown_description() -> String {
    "Unknown error".to_string()
}

/// Used to recover the `type` tag of frames that are not [`InboundFrame`]s.
#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: String,
}

const KNOWN_KINDS: &[&str] = &[
    "Metadata",
    "SpeechEnded",
    "Error",
    "Flushed",
    "Cleared",
    "Warning",
];

impl InboundFrame {
    /// Decode a text frame.
    ///
    /// Unknown frame types decode to [`InboundFrame::Unknown`]. Invalid JSON,
    /// a missing `type`, or a known type with invalid fields is an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                let tag: TypeTag = serde_json::from_str(text)?;
                if KNOWN_KINDS.contains(&tag.kind.as_str()) {
                    Err(err)
                } else {
                    Ok(Self::Unknown { kind: tag.kind })
                }
            }
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Metadata(_) => "Metadata",
            Self::SpeechEnded => "SpeechEnded",
            Self::Error { .. } => "Error",
            Self::Flushed { .. } => "Flushed",
            Self::Cleared { .. } => "Cleared",
            Self::Warning { .. } => "Warning",
            Self::Unknown { kind } => kind,
        }
    }
}
