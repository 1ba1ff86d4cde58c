//! Snapshot frame codec.
//!
//! # On-Disk Frame Format (little-endian)
//!
//! ```text
//! [4 bytes: magic "OSNP"][2 bytes: version][8 bytes: frame_sequence]
//! [4 bytes: payload_length][N bytes: JSON payload][4 bytes: CRC32]
//! ```
//!
//! - CRC32 covers: version ‖ frame_sequence ‖ payload_length ‖ payload
//!   (not the magic).
//! - A store file is a plain concatenation of frames. The last frame that
//!   validates is the current image; anything after the first invalid frame
//!   is a torn write.

use super::error::StoreError;
use std::ops::Range;

pub(crate) const MAGIC: [u8; 4] = *b"OSNP";
pub(crate) const VERSION: u16 = 1;
pub(crate) const HEADER_SIZE: usize = 4 + 2 + 8 + 4;
pub(crate) const CRC_SIZE: usize = 4;

/// A frame that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScannedFrame {
    pub offset: usize,
    pub sequence: u64,
    pub payload: Range<usize>,
}

/// Why a scan stopped before the end of the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameDefect {
    /// Truncated or checksum-failing data, i.e. a torn write.
    Torn { offset: usize, message: String },
    /// A well-formed frame from a format this build does not read.
    UnsupportedVersion { offset: usize, version: u16 },
}

/// Result of walking a store file.
#[derive(Debug, Default)]
pub(crate) struct FrameScan {
    pub frames: Vec<ScannedFrame>,
    /// Length of the valid prefix.
    pub valid_len: usize,
    pub defect: Option<FrameDefect>,
}

impl FrameScan {
    pub fn last(&self) -> Option<&ScannedFrame> {
        self.frames.last()
    }
}

/// Encode one frame around `payload`.
pub(crate) fn encode(sequence: u64, payload: &[u8]) -> Result<Vec<u8>, StoreError> {
    let payload_len = u32::try_from(payload.len()).map_err(|_| StoreError::SerializationError {
        message: format!("snapshot payload of {} bytes is too large", payload.len()),
    })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(payload);

    let crc = crc32fast::hash(&buf[MAGIC.len()..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Walk `data` frame by frame, stopping at the first one that does not
/// validate.
pub(crate) fn scan(data: &[u8]) -> FrameScan {
    let mut scan = FrameScan::default();
    let mut offset = 0usize;

    while offset < data.len() {
        match read_frame(data, offset) {
            Ok((frame, end)) => {
                scan.frames.push(frame);
                offset = end;
            }
            Err(defect) => {
                scan.defect = Some(defect);
                break;
            }
        }
    }

    scan.valid_len = offset;
    scan
}

fn read_frame(data: &[u8], offset: usize) -> Result<(ScannedFrame, usize), FrameDefect> {
    let torn = |message: &str| FrameDefect::Torn {
        offset,
        message: message.to_string(),
    };

    let header = offset
        .checked_add(HEADER_SIZE)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| torn("truncated header"))?;

    if header[0..4] != MAGIC {
        return Err(torn("bad magic"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    let sequence = u64::from_le_bytes([
        header[6], header[7], header[8], header[9], header[10], header[11], header[12], header[13],
    ]);
    let payload_len =
        u32::from_le_bytes([header[14], header[15], header[16], header[17]]) as usize;

    let payload_start = offset + HEADER_SIZE;
    let payload_end = payload_start
        .checked_add(payload_len)
        .ok_or_else(|| torn("payload length overflow"))?;
    let frame_end = payload_end
        .checked_add(CRC_SIZE)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| torn("truncated payload"))?;

    let crc_bytes = &data[payload_end..frame_end];
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32fast::hash(&data[offset + MAGIC.len()..payload_end]);
    if expected != actual {
        return Err(FrameDefect::Torn {
            offset,
            message: format!("expected CRC {expected:#010x}, got {actual:#010x}"),
        });
    }
    if version != VERSION {
        return Err(FrameDefect::UnsupportedVersion { offset, version });
    }

    Ok((
        ScannedFrame {
            offset,
            sequence,
            payload: payload_start..payload_end,
        },
        frame_end,
    ))
}
