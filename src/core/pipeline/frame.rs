//! Chunk frames: the two control-frame shapes that bracket a transfer's
//! binary slices on the byte channel.
//!
//! Frames are distinguished by payload kind, not by a header: control
//! frames travel as JSON text, file data as raw binary. Exactly one
//! `file-meta` precedes all binary frames of a transfer and exactly one
//! `file-end` follows the last; the channel's ordering guarantee is the
//! only sequencing mechanism.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A control frame, JSON-encoded and sent as a text payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    /// Declares the file about to stream. The receiver initializes a fresh
    /// buffer and zeroes its byte counter on this frame.
    #[serde(rename = "file-meta")]
    FileMeta {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
        #[serde(rename = "fileType")]
        file_type: String,
        #[serde(rename = "senderId")]
        sender_id: String,
    },
    /// Marks the end of the binary stream; the receiver finalizes.
    #[serde(rename = "file-end")]
    FileEnd {},
}

impl ControlFrame {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("encoding control frame")
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("decoding control frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_uses_wire_field_names() {
        let frame = ControlFrame::FileMeta {
            file_name: "report.pdf".into(),
            file_size: 32768,
            file_type: "application/pdf".into(),
            sender_id: "1".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "file-meta");
        assert_eq!(json["fileName"], "report.pdf");
        assert_eq!(json["fileSize"], 32768);
        assert_eq!(json["senderId"], "1");
    }

    #[test]
    fn end_frame_round_trips() {
        let text = ControlFrame::FileEnd {}.encode().unwrap();
        assert_eq!(ControlFrame::decode(&text).unwrap(), ControlFrame::FileEnd {});
    }

    #[test]
    fn unknown_tag_is_an_error() {
        assert!(ControlFrame::decode("{\"type\":\"file-pause\"}").is_err());
    }
}
