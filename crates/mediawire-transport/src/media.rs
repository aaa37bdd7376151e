//! # Media Metadata
//!
//! Codec descriptors carried alongside every outgoing unit, plus an H.264
//! Annex B classifier used when a caller does not say whether a frame is an
//! I-frame or a P-frame.

use serde::{Deserialize, Serialize};

/// Video elementary stream format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    H264,
    Mjpeg,
    Other,
}

/// Audio encoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    #[default]
    Pcm,
    G711a,
    G711u,
    Aac,
    Other,
}

/// Position of a video frame in its GOP.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Intra-coded; starts a GOP.
    Intra,
    /// Predicted from earlier frames.
    Predicted,
    #[default]
    Unknown,
}

impl FrameKind {
    #[inline]
    pub fn is_intra(self) -> bool {
        self == FrameKind::Intra
    }
}

/// Classify an Annex B H.264 access unit by its slice NAL units.
///
/// An IDR slice (type 5) makes the frame [`FrameKind::Intra`]; a non-IDR
/// slice (types 1-4) makes it [`FrameKind::Predicted`]. Parameter sets, SEI
/// and delimiters are skipped. A buffer without start codes or without slices
/// is [`FrameKind::Unknown`].
pub fn classify_h264(data: &[u8]) -> FrameKind {
    let mut kind = FrameKind::Unknown;
    let mut i = 0;

    while i + 2 < data.len() {
        if data[i] != 0x00 || data[i + 1] != 0x00 {
            i += 1;
            continue;
        }
        let nal_start = if data[i + 2] == 0x01 {
            i + 3
        } else if data[i + 2] == 0x00 && data.get(i + 3) == Some(&0x01) {
            i + 4
        } else {
            i += 1;
            continue;
        };
        let Some(&header) = data.get(nal_start) else {
            break;
        };
        match header & 0x1F {
            5 => return FrameKind::Intra,
            1..=4 => kind = FrameKind::Predicted,
            _ => {}
        }
        i = nal_start;
    }

    kind
}
