//! Producer/consumer compatibility descriptor

use std::fmt;

use crate::tag::{MediaFormat, Tag, DEFAULT_FLAVOUR_MASK};

/// Media format plus flavour mask
///
/// `format == None` is the wildcard: it matches every format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Payload format, `None` for any
    pub format: Option<MediaFormat>,
    /// Flavours accepted or produced
    pub flavour_mask: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            format: None,
            flavour_mask: DEFAULT_FLAVOUR_MASK,
        }
    }
}

impl Capabilities {
    /// Create capabilities
    pub fn new(format: Option<MediaFormat>, flavour_mask: u32) -> Self {
        Self {
            format,
            flavour_mask,
        }
    }

    /// Any format, every flavour
    pub fn any() -> Self {
        Self::new(None, u32::MAX)
    }

    /// Intersection of two descriptors
    ///
    /// `None` when the formats differ (neither being the wildcard) or the
    /// flavour masks share no bit.
    pub fn intersect(&self, other: &Capabilities) -> Option<Capabilities> {
        let format = match (self.format, other.format) {
            (None, f) | (f, None) => f,
            (Some(a), Some(b)) if a == b => Some(a),
            _ => return None,
        };
        let flavour_mask = self.flavour_mask & other.flavour_mask;
        if flavour_mask == 0 {
            return None;
        }
        Some(Capabilities {
            format,
            flavour_mask,
        })
    }

    /// Whether the two descriptors intersect
    pub fn is_compatible(&self, other: &Capabilities) -> bool {
        self.intersect(other).is_some()
    }

    /// Whether a tag belongs to one of these flavours
    pub fn accepts(&self, tag: &Tag) -> bool {
        self.flavour_mask & tag.flavour_mask() != 0
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            Some(format) => write!(f, "{}", format)?,
            None => f.write_str("any")?,
        }
        write!(f, "/fl:{:x}", self.flavour_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_takes_other_format() {
        let any = Capabilities::new(None, 0b11);
        let flv = Capabilities::new(Some(MediaFormat::Flv), 0b10);
        let caps = any.intersect(&flv).unwrap();
        assert_eq!(caps.format, Some(MediaFormat::Flv));
        assert_eq!(caps.flavour_mask, 0b10);
        assert_eq!(flv.intersect(&any), Some(caps));
    }

    #[test]
    fn test_mismatch() {
        let flv = Capabilities::new(Some(MediaFormat::Flv), 1);
        let mp3 = Capabilities::new(Some(MediaFormat::Mp3), 1);
        assert!(!flv.is_compatible(&mp3));

        let other_flavour = Capabilities::new(Some(MediaFormat::Flv), 2);
        assert!(!flv.is_compatible(&other_flavour));
    }

    #[test]
    fn test_intersection_only_narrows() {
        let wide = Capabilities::any();
        let narrow = Capabilities::new(Some(MediaFormat::Aac), 4);
        let caps = wide.intersect(&narrow).unwrap();
        assert_eq!(caps, narrow);
        assert_eq!(caps.intersect(&wide), Some(narrow));
        assert_eq!(caps.to_string(), "aac/fl:4");
    }
}
