//! Media formats, tag attributes and flavours

use std::fmt;
use std::ops::BitOr;

/// Wire format of a media payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaFormat {
    /// FLV tags
    Flv,
    /// F4V (fragmented MP4) atoms
    F4v,
    /// MP3 frames
    Mp3,
    /// AAC (ADTS) frames
    Aac,
    /// Internal framing
    Internal,
    /// Opaque bytes
    Raw,
}

impl MediaFormat {
    /// All formats, in discriminant order
    pub const ALL: [MediaFormat; 6] = [
        MediaFormat::Flv,
        MediaFormat::F4v,
        MediaFormat::Mp3,
        MediaFormat::Aac,
        MediaFormat::Internal,
        MediaFormat::Raw,
    ];

    /// Short name
    pub fn name(self) -> &'static str {
        match self {
            MediaFormat::Flv => "flv",
            MediaFormat::F4v => "f4v",
            MediaFormat::Mp3 => "mp3",
            MediaFormat::Aac => "aac",
            MediaFormat::Internal => "internal",
            MediaFormat::Raw => "raw",
        }
    }

    /// HTTP content type
    pub fn content_type(self) -> &'static str {
        match self {
            MediaFormat::Flv => "video/x-flv",
            MediaFormat::F4v => "video/x-f4v",
            MediaFormat::Mp3 => "audio/mpeg",
            MediaFormat::Aac => "audio/aac",
            MediaFormat::Internal => "application/x-mediacast-internal",
            MediaFormat::Raw => "application/octet-stream",
        }
    }

    /// Format for an HTTP content type
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let base = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match base.as_str() {
            "audio/aacp" => Some(MediaFormat::Aac),
            other => Self::ALL.into_iter().find(|f| f.content_type() == other),
        }
    }

    /// Format for a file extension (without the dot)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "flv" => Some(MediaFormat::Flv),
            "f4v" | "mp4" | "m4v" => Some(MediaFormat::F4v),
            "mp3" => Some(MediaFormat::Mp3),
            "aac" => Some(MediaFormat::Aac),
            "raw" | "bin" => Some(MediaFormat::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tag attribute bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Attributes(u32);

impl Attributes {
    /// No attributes
    pub const NONE: Attributes = Attributes(0);
    /// Metadata tag
    pub const METADATA: Attributes = Attributes(0x0001);
    /// Audio tag
    pub const AUDIO: Attributes = Attributes(0x0002);
    /// Video tag
    pub const VIDEO: Attributes = Attributes(0x0004);
    /// May be dropped under flow control
    pub const DROPPABLE: Attributes = Attributes(0x0008);
    /// A decoder can restart from this tag (keyframe)
    pub const CAN_RESYNC: Attributes = Attributes(0x0010);

    /// Raw bits
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Attributes {
    type Output = Attributes;

    fn bitor(self, rhs: Attributes) -> Attributes {
        Attributes(self.0 | rhs.0)
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Attributes::METADATA, "metadata"),
            (Attributes::AUDIO, "audio"),
            (Attributes::VIDEO, "video"),
            (Attributes::DROPPABLE, "droppable"),
            (Attributes::CAN_RESYNC, "can_resync"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(attr, _)| self.contains(*attr))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&set.join("|"))
    }
}

/// Flavour id used when nothing else is specified
pub const DEFAULT_FLAVOUR_ID: u32 = 0;
/// Mask of the default flavour
pub const DEFAULT_FLAVOUR_MASK: u32 = 1 << DEFAULT_FLAVOUR_ID;
/// Number of distinct flavours
pub const NUM_FLAVOURS: u32 = 32;

/// Flavour id of a single-flavour mask
///
/// Returns `None` for an empty mask or one with more than one bit set.
pub fn flavour_id(mask: u32) -> Option<u32> {
    if mask.is_power_of_two() {
        Some(mask.trailing_zeros())
    } else {
        None
    }
}

/// Lowest flavour of `mask`, as a single-flavour mask
///
/// An empty mask maps to the default flavour.
pub fn first_flavour(mask: u32) -> u32 {
    if mask == 0 {
        DEFAULT_FLAVOUR_MASK
    } else {
        1 << mask.trailing_zeros()
    }
}

/// Iterate the flavour ids set in `mask`, lowest first
pub fn flavour_ids(mask: u32) -> impl Iterator<Item = u32> {
    (0..NUM_FLAVOURS).filter(move |id| mask & (1 << id) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavour_id() {
        assert_eq!(flavour_id(1), Some(0));
        assert_eq!(flavour_id(128), Some(7));
        assert_eq!(flavour_id(0), None);
        assert_eq!(flavour_id(3), None);
        assert_eq!(flavour_ids(0b1010).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(first_flavour(0b1100), 0b100);
        assert_eq!(first_flavour(0), DEFAULT_FLAVOUR_MASK);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(
            MediaFormat::from_content_type("video/x-flv; charset=binary"),
            Some(MediaFormat::Flv)
        );
        assert_eq!(
            MediaFormat::from_content_type("audio/aacp"),
            Some(MediaFormat::Aac)
        );
        assert_eq!(MediaFormat::from_content_type("text/html"), None);
        assert_eq!(MediaFormat::from_extension("MP3"), Some(MediaFormat::Mp3));
    }

    #[test]
    fn test_attributes() {
        let attrs = Attributes::VIDEO | Attributes::DROPPABLE;
        assert!(attrs.contains(Attributes::VIDEO));
        assert!(!attrs.contains(Attributes::CAN_RESYNC));
        assert_eq!(attrs.to_string(), "video|droppable");
    }
}
