//! The compact per-slot wire format spoken between the server and the client reassembler
//!
//! Every forwarded fragment is a JSON object `{"text": ..., "index": ...}`. How consecutive
//! objects are delimited depends on the [`Framing`]:
//!
//! - [`Framing::NdJson`]: each object is followed by `\n`. Reads may split objects anywhere.
//! - [`Framing::Concatenated`]: objects are written back to back with no separator. The reader
//!   repairs `}{` boundaries per read, so a read must never end inside an object.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Response header naming the framing used for the body.
pub const FRAMING_HEADER: &str = "chatcierge-framing";

/// Response header carrying the number of prompt slots in the stream.
pub const SLOT_COUNT_HEADER: &str = "chatcierge-slot-count";

/// One piece of generated text for one prompt slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionFragment {
    pub text: String,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    #[default]
    #[value(name = "ndjson")]
    NdJson,
    Concatenated,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::NdJson => "ndjson",
            Framing::Concatenated => "concatenated",
        }
    }

    /// Encode a fragment as the bytes written onto the outbound stream.
    pub fn encode(&self, fragment: &CompletionFragment) -> Result<Bytes, serde_json::Error> {
        let mut bytes = serde_json::to_vec(fragment)?;
        if *self == Framing::NdJson {
            bytes.push(b'\n');
        }
        Ok(Bytes::from(bytes))
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ndjson" => Ok(Framing::NdJson),
            "concatenated" => Ok(Framing::Concatenated),
            other => Err(format!("unknown framing '{other}'")),
        }
    }
}
