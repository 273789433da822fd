//! Tag to byte-stream serialization for progressive HTTP bodies
//!
//! FLV output wraps each media payload in an FLV tag:
//! ```text
//! +--------+-------------+-----------+-------------+---------+---------------+
//! | Type(1)| DataSize(3) | TS(3+1)   | StreamID(3) | Data(N) | PrevTagSize(4)|
//! +--------+-------------+-----------+-------------+---------+---------------+
//! ```
//! preceded once by the 9-byte file header and `PreviousTagSize0`.

use bytes::{BufMut, BytesMut};

use crate::tag::{MediaFormat, Tag, TagKind};

/// FLV file signature: "FLV" in ASCII
const FLV_SIGNATURE: [u8; 3] = [0x46, 0x4C, 0x56];

/// FLV version (always 1)
const FLV_VERSION: u8 = 0x01;

/// Type flags: bit 0 = video, bit 2 = audio
const FLV_TYPE_FLAGS_AV: u8 = 0x05;

/// FLV header is always 9 bytes
const FLV_HEADER_SIZE: u32 = 9;

/// FLV tag header size
const FLV_TAG_HEADER_SIZE: u32 = 11;

const FLV_TAG_AUDIO: u8 = 8;
const FLV_TAG_VIDEO: u8 = 9;
const FLV_TAG_SCRIPT: u8 = 18;

/// Writes tags of one format into a response body
pub trait TagSerializer: Send {
    /// Bytes opening the body
    fn initialize(&mut self, _out: &mut BytesMut) {}

    /// Append `tag`; false if it cannot be represented
    fn serialize(&mut self, tag: &Tag, timestamp_ms: i64, out: &mut BytesMut) -> bool;
}

/// Serializer for `format`, if one exists
pub fn create_serializer(format: MediaFormat) -> Option<Box<dyn TagSerializer>> {
    match format {
        MediaFormat::Flv => Some(Box::new(FlvSerializer)),
        MediaFormat::Mp3 | MediaFormat::Aac | MediaFormat::Raw => {
            Some(Box::new(RawSerializer { format }))
        }
        MediaFormat::F4v | MediaFormat::Internal => None,
    }
}

/// FLV file stream
#[derive(Debug, Default)]
pub struct FlvSerializer;

impl FlvSerializer {
    fn write_tag(out: &mut BytesMut, tag_type: u8, timestamp: u32, data: &[u8]) {
        let data_size = data.len() as u32;
        out.reserve(data.len() + 15);
        out.put_u8(tag_type);
        // Data size (24-bit BE)
        out.put_uint(data_size as u64, 3);
        // Timestamp: lower 24 bits, then upper 8 bits (extension byte)
        out.put_uint((timestamp & 0x00FF_FFFF) as u64, 3);
        out.put_u8((timestamp >> 24) as u8);
        // Stream ID (always 0)
        out.put_uint(0, 3);
        out.put_slice(data);
        out.put_u32(FLV_TAG_HEADER_SIZE + data_size);
    }
}

impl TagSerializer for FlvSerializer {
    fn initialize(&mut self, out: &mut BytesMut) {
        out.put_slice(&FLV_SIGNATURE);
        out.put_u8(FLV_VERSION);
        out.put_u8(FLV_TYPE_FLAGS_AV);
        out.put_u32(FLV_HEADER_SIZE);
        // PreviousTagSize0
        out.put_u32(0);
    }

    fn serialize(&mut self, tag: &Tag, timestamp_ms: i64, out: &mut BytesMut) -> bool {
        match tag.kind() {
            TagKind::Media { format, data, .. } => {
                if *format != MediaFormat::Flv {
                    return false;
                }
                let tag_type = if tag.is_video() {
                    FLV_TAG_VIDEO
                } else if tag.is_audio() {
                    FLV_TAG_AUDIO
                } else {
                    FLV_TAG_SCRIPT
                };
                Self::write_tag(out, tag_type, timestamp_ms.max(0) as u32, data);
                true
            }
            TagKind::Composed(tags) => tags
                .iter()
                .all(|t| self.serialize(t, timestamp_ms + t.timestamp_ms(), out)),
            _ => true,
        }
    }
}

/// Payload bytes as they are (elementary audio streams, opaque data)
#[derive(Debug)]
pub struct RawSerializer {
    format: MediaFormat,
}

impl TagSerializer for RawSerializer {
    fn serialize(&mut self, tag: &Tag, timestamp_ms: i64, out: &mut BytesMut) -> bool {
        match tag.kind() {
            TagKind::Media { format, data, .. } => {
                if *format != self.format {
                    return false;
                }
                out.put_slice(data);
                true
            }
            TagKind::Composed(tags) => tags
                .iter()
                .all(|t| self.serialize(t, timestamp_ms + t.timestamp_ms(), out)),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_flv_header() {
        let mut ser = create_serializer(MediaFormat::Flv).unwrap();
        let mut out = BytesMut::new();
        ser.initialize(&mut out);
        assert_eq!(&out[..], &[0x46, 0x4C, 0x56, 0x01, 0x05, 0, 0, 0, 9, 0, 0, 0, 0]);
    }

    #[test]
    fn test_flv_video_tag() {
        let mut ser = FlvSerializer;
        let mut out = BytesMut::new();
        let tag = Tag::video(MediaFormat::Flv, 0, Bytes::from_static(&[0x17, 0x01]), true);
        assert!(ser.serialize(&tag, 0x0102_0304, &mut out));

        assert_eq!(out.len(), 11 + 2 + 4);
        assert_eq!(out[0], FLV_TAG_VIDEO);
        assert_eq!(&out[1..4], &[0, 0, 2]);
        // lower 24 bits then extension byte
        assert_eq!(&out[4..8], &[0x02, 0x03, 0x04, 0x01]);
        assert_eq!(&out[8..11], &[0, 0, 0]);
        assert_eq!(&out[11..13], &[0x17, 0x01]);
        assert_eq!(&out[13..17], &13u32.to_be_bytes());
    }

    #[test]
    fn test_control_tags_write_nothing() {
        let mut ser = FlvSerializer;
        let mut out = BytesMut::new();
        assert!(ser.serialize(&Tag::seek_performed(1, 0), 0, &mut out));
        assert!(ser.serialize(&Tag::flush(1), 0, &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn test_format_mismatch() {
        let mut flv = FlvSerializer;
        let mut out = BytesMut::new();
        let mp3 = Tag::audio(MediaFormat::Mp3, 0, Bytes::from_static(b"ID3"));
        assert!(!flv.serialize(&mp3, 0, &mut out));

        let mut raw = create_serializer(MediaFormat::Mp3).unwrap();
        assert!(raw.serialize(&mp3, 0, &mut out));
        assert_eq!(&out[..], b"ID3");
        assert!(create_serializer(MediaFormat::F4v).is_none());
    }
}
