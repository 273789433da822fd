//! Tags: the units of media and control information flowing through elements
//!
//! A [`Tag`] is immutable once built and cheap to clone: payloads are
//! `bytes::Bytes` or `Arc`-shared, so every downstream callback shares the
//! same allocation and the last holder frees it.

pub mod format;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

pub use format::{
    first_flavour, flavour_id, flavour_ids, Attributes, MediaFormat, DEFAULT_FLAVOUR_ID, DEFAULT_FLAVOUR_MASK,
    NUM_FLAVOURS,
};

/// Names the media a source-changed tag refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChange {
    /// The element that produced the media (e.g. `"files/intro.flv"`)
    pub source_element_name: Arc<str>,
    /// Path through the elements the tag travelled
    pub path: Arc<str>,
}

/// A seekable position: timestamp and byte offset into the media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuePoint {
    /// Media time in milliseconds
    pub timestamp_ms: i64,
    /// Position inside the media (index or byte offset)
    pub position: i64,
}

/// Index of the last cue at or before `t`
pub fn cue_for_time(cues: &[CuePoint], t: i64) -> Option<usize> {
    if cues.is_empty() {
        return None;
    }
    if t < 0 {
        return Some(0);
    }
    Some(cues.partition_point(|c| c.timestamp_ms <= t).saturating_sub(1))
}

/// Description of the media being served
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    /// Total duration, if known
    pub duration_ms: Option<i64>,
    /// Consumer may seek
    pub seekable: bool,
    /// Consumer may pause
    pub pausable: bool,
    /// Free-form metadata forwarded to the wire
    pub extra: BTreeMap<String, String>,
}

/// The closed set of tag variants
#[derive(Debug, Clone)]
pub enum TagKind {
    /// Media payload
    Media {
        /// Payload format
        format: MediaFormat,
        /// Payload bytes
        data: Bytes,
        /// Duration covered by the payload
        duration_ms: i64,
    },
    /// Several tags of one format carried together; inner timestamps are
    /// relative to the composed tag
    Composed(Arc<[Tag]>),
    /// Media description
    MediaInfo(Arc<MediaInfo>),
    /// A source started producing tags
    SourceStarted(SourceChange),
    /// A source stopped producing tags
    SourceEnded(SourceChange),
    /// Last tag on a processing callback
    Eos {
        /// True when the stream was cut short (close, error) rather than
        /// reaching its natural end
        forced: bool,
    },
    /// A seek happened; a new sequence of media tags follows
    SeekPerformed,
    /// Pipeline flush
    Flush,
    /// Cue points of the current media
    CuePoint(Arc<[CuePoint]>),
    /// Start of the catch-up sequence sent to a late joiner
    BootstrapBegin,
    /// End of the catch-up sequence
    BootstrapEnd,
}

/// One unit of media or control information
#[derive(Debug, Clone)]
pub struct Tag {
    kind: TagKind,
    attributes: Attributes,
    flavour_mask: u32,
    timestamp_ms: i64,
}

impl Tag {
    /// Build a tag
    ///
    /// `flavour_mask` must carry exactly one flavour bit.
    pub fn new(kind: TagKind, attributes: Attributes, flavour_mask: u32, timestamp_ms: i64) -> Self {
        debug_assert!(
            flavour_id(flavour_mask).is_some(),
            "tag flavour mask must carry exactly one flavour: {:#x}",
            flavour_mask
        );
        Self {
            kind,
            attributes,
            flavour_mask,
            timestamp_ms,
        }
    }

    /// Media payload tag
    pub fn media(
        format: MediaFormat,
        attributes: Attributes,
        flavour_mask: u32,
        timestamp_ms: i64,
        data: Bytes,
    ) -> Self {
        Self::new(
            TagKind::Media {
                format,
                data,
                duration_ms: 0,
            },
            attributes,
            flavour_mask,
            timestamp_ms,
        )
    }

    /// Video payload in the default flavour; keyframes can resync
    pub fn video(format: MediaFormat, timestamp_ms: i64, data: Bytes, is_keyframe: bool) -> Self {
        let mut attributes = Attributes::VIDEO | Attributes::DROPPABLE;
        if is_keyframe {
            attributes = attributes | Attributes::CAN_RESYNC;
        }
        Self::media(format, attributes, DEFAULT_FLAVOUR_MASK, timestamp_ms, data)
    }

    /// Audio payload in the default flavour
    pub fn audio(format: MediaFormat, timestamp_ms: i64, data: Bytes) -> Self {
        Self::media(
            format,
            Attributes::AUDIO | Attributes::DROPPABLE | Attributes::CAN_RESYNC,
            DEFAULT_FLAVOUR_MASK,
            timestamp_ms,
            data,
        )
    }

    /// Metadata / sequence header payload in the default flavour
    pub fn metadata(format: MediaFormat, timestamp_ms: i64, data: Bytes) -> Self {
        Self::media(
            format,
            Attributes::METADATA,
            DEFAULT_FLAVOUR_MASK,
            timestamp_ms,
            data,
        )
    }

    /// Composed tag
    pub fn composed(flavour_mask: u32, timestamp_ms: i64, tags: Vec<Tag>) -> Self {
        Self::new(
            TagKind::Composed(tags.into()),
            Attributes::NONE,
            flavour_mask,
            timestamp_ms,
        )
    }

    /// Media description tag
    pub fn media_info(flavour_mask: u32, info: MediaInfo) -> Self {
        Self::new(
            TagKind::MediaInfo(Arc::new(info)),
            Attributes::METADATA,
            flavour_mask,
            0,
        )
    }

    /// End of stream
    pub fn eos(flavour_mask: u32, timestamp_ms: i64, forced: bool) -> Self {
        Self::new(
            TagKind::Eos { forced },
            Attributes::NONE,
            flavour_mask,
            timestamp_ms,
        )
    }

    /// Seek marker
    pub fn seek_performed(flavour_mask: u32, timestamp_ms: i64) -> Self {
        Self::new(
            TagKind::SeekPerformed,
            Attributes::NONE,
            flavour_mask,
            timestamp_ms,
        )
    }

    /// Flush marker
    pub fn flush(flavour_mask: u32) -> Self {
        Self::new(TagKind::Flush, Attributes::NONE, flavour_mask, 0)
    }

    /// Cue points
    pub fn cue_points(flavour_mask: u32, cues: Vec<CuePoint>) -> Self {
        Self::new(
            TagKind::CuePoint(cues.into()),
            Attributes::METADATA,
            flavour_mask,
            0,
        )
    }

    /// Source started
    pub fn source_started(flavour_mask: u32, timestamp_ms: i64, source: &str, path: &str) -> Self {
        Self::new(
            TagKind::SourceStarted(SourceChange {
                source_element_name: source.into(),
                path: path.into(),
            }),
            Attributes::NONE,
            flavour_mask,
            timestamp_ms,
        )
    }

    /// Source ended
    pub fn source_ended(flavour_mask: u32, timestamp_ms: i64, source: &str, path: &str) -> Self {
        Self::new(
            TagKind::SourceEnded(SourceChange {
                source_element_name: source.into(),
                path: path.into(),
            }),
            Attributes::NONE,
            flavour_mask,
            timestamp_ms,
        )
    }

    /// Bootstrap begin marker
    pub fn bootstrap_begin(flavour_mask: u32, timestamp_ms: i64) -> Self {
        Self::new(
            TagKind::BootstrapBegin,
            Attributes::NONE,
            flavour_mask,
            timestamp_ms,
        )
    }

    /// Bootstrap end marker
    pub fn bootstrap_end(flavour_mask: u32, timestamp_ms: i64) -> Self {
        Self::new(
            TagKind::BootstrapEnd,
            Attributes::NONE,
            flavour_mask,
            timestamp_ms,
        )
    }

    /// Copy of this tag with another timestamp; the payload stays shared
    pub fn with_timestamp(&self, timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            ..self.clone()
        }
    }

    /// Copy of this tag in another flavour
    pub fn with_flavour(&self, flavour_mask: u32) -> Self {
        debug_assert!(flavour_id(flavour_mask).is_some());
        Self {
            flavour_mask,
            ..self.clone()
        }
    }

    /// Variant
    pub fn kind(&self) -> &TagKind {
        &self.kind
    }

    /// Attributes
    pub fn attributes(&self) -> Attributes {
        self.attributes
    }

    /// The single flavour this tag belongs to
    pub fn flavour_mask(&self) -> u32 {
        self.flavour_mask
    }

    /// Tag's own timestamp
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Duration covered by the tag
    pub fn duration_ms(&self) -> i64 {
        match &self.kind {
            TagKind::Media { duration_ms, .. } => *duration_ms,
            TagKind::Composed(tags) => tags
                .last()
                .map(|t| t.timestamp_ms + t.duration_ms())
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        match &self.kind {
            TagKind::Media { data, .. } => data.len(),
            TagKind::Composed(tags) => tags.iter().map(Tag::size).sum(),
            _ => 0,
        }
    }

    /// Format of the payload, for media and composed tags
    pub fn media_format(&self) -> Option<MediaFormat> {
        match &self.kind {
            TagKind::Media { format, .. } => Some(*format),
            TagKind::Composed(tags) => tags.first().and_then(Tag::media_format),
            _ => None,
        }
    }

    /// Payload bytes of a media tag
    pub fn data(&self) -> Option<&Bytes> {
        match &self.kind {
            TagKind::Media { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Name of the variant
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            TagKind::Media { format, .. } => format.name(),
            TagKind::Composed(_) => "composed",
            TagKind::MediaInfo(_) => "media_info",
            TagKind::SourceStarted(_) => "source_started",
            TagKind::SourceEnded(_) => "source_ended",
            TagKind::Eos { .. } => "eos",
            TagKind::SeekPerformed => "seek_performed",
            TagKind::Flush => "flush",
            TagKind::CuePoint(_) => "cue_point",
            TagKind::BootstrapBegin => "bootstrap_begin",
            TagKind::BootstrapEnd => "bootstrap_end",
        }
    }

    /// Media or composed payload
    pub fn is_media(&self) -> bool {
        matches!(self.kind, TagKind::Media { .. } | TagKind::Composed(_))
    }

    /// End of stream
    pub fn is_eos(&self) -> bool {
        matches!(self.kind, TagKind::Eos { .. })
    }

    /// Video tag
    pub fn is_video(&self) -> bool {
        self.attributes.contains(Attributes::VIDEO)
    }

    /// Audio tag
    pub fn is_audio(&self) -> bool {
        self.attributes.contains(Attributes::AUDIO)
    }

    /// Metadata tag
    pub fn is_metadata(&self) -> bool {
        self.attributes.contains(Attributes::METADATA)
    }

    /// May be dropped under flow control
    pub fn is_droppable(&self) -> bool {
        self.attributes.contains(Attributes::DROPPABLE)
    }

    /// Keyframe / resync point
    pub fn can_resync(&self) -> bool {
        self.attributes.contains(Attributes::CAN_RESYNC)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{:>8} - {} [{}] fl:{:x}",
            self.timestamp_ms,
            self.type_name(),
            self.attributes,
            self.flavour_mask
        )?;
        match &self.kind {
            TagKind::Eos { forced } => write!(f, " forced: {}", forced),
            TagKind::SourceStarted(s) | TagKind::SourceEnded(s) => {
                write!(f, " source: {}", s.source_element_name)
            }
            TagKind::Media { data, .. } => write!(f, " {} bytes", data.len()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_attributes() {
        let key = Tag::video(MediaFormat::Flv, 0, Bytes::from_static(&[0x17]), true);
        let inter = Tag::video(MediaFormat::Flv, 40, Bytes::from_static(&[0x27]), false);

        assert!(key.is_video() && key.is_droppable() && key.can_resync());
        assert!(inter.is_video() && !inter.can_resync());
        assert_eq!(key.media_format(), Some(MediaFormat::Flv));
        assert_eq!(key.size(), 1);
    }

    #[test]
    fn test_with_timestamp_shares_payload() {
        let data = Bytes::from(vec![1u8; 64]);
        let tag = Tag::audio(MediaFormat::Aac, 10, data.clone());
        let moved = tag.with_timestamp(99);

        assert_eq!(moved.timestamp_ms(), 99);
        assert_eq!(tag.timestamp_ms(), 10);
        assert_eq!(moved.data().unwrap().as_ptr(), data.as_ptr());
    }

    #[test]
    fn test_eos() {
        let tag = Tag::eos(DEFAULT_FLAVOUR_MASK, 80, false);
        assert!(tag.is_eos());
        assert!(!tag.is_media());
        assert!(matches!(tag.kind(), TagKind::Eos { forced: false }));
        assert!(tag.to_string().contains("forced: false"));
    }

    #[test]
    fn test_composed() {
        let inner = vec![
            Tag::audio(MediaFormat::Mp3, 0, Bytes::from_static(&[0; 10])),
            Tag::audio(MediaFormat::Mp3, 26, Bytes::from_static(&[0; 12])),
        ];
        let tag = Tag::composed(DEFAULT_FLAVOUR_MASK, 1000, inner);
        assert!(tag.is_media());
        assert_eq!(tag.size(), 22);
        assert_eq!(tag.media_format(), Some(MediaFormat::Mp3));
        assert_eq!(tag.duration_ms(), 26);
    }

    #[test]
    fn test_cue_for_time() {
        let cues = [
            CuePoint { timestamp_ms: 0, position: 0 },
            CuePoint { timestamp_ms: 2000, position: 50 },
            CuePoint { timestamp_ms: 4000, position: 100 },
        ];
        assert_eq!(cue_for_time(&cues, -5), Some(0));
        assert_eq!(cue_for_time(&cues, 0), Some(0));
        assert_eq!(cue_for_time(&cues, 3999), Some(1));
        assert_eq!(cue_for_time(&cues, 4000), Some(2));
        assert_eq!(cue_for_time(&cues, 100_000), Some(2));
        assert_eq!(cue_for_time(&[], 10), None);
    }
}
