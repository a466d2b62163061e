//! Tag string parsing.
//!
//! ControlLogix tags name a variable, optionally drilling into structure
//! members with `.` and array elements with `[N]`:
//!
//! ```text
//! tag = segment ("." name | "[" integer "]")*
//! ```
//!
//! `"Local:2:I.Ch0Data"` parses into three name segments;
//! `"arr[258].val"` into name, element, name. A parsed [`TagPath`] is
//! immutable and owned by one `TagInfo`; parsing happens once when a tag is
//! registered.

use std::fmt;
use std::str::FromStr;

use crate::error::{EipError, Result};

/// One step of a tag path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSegment {
    /// A symbolic name (structure member or base tag).
    Name(String),
    /// An array element index.
    Element(u32),
}

/// A parsed tag: an ordered, non-empty list of segments whose first entry
/// is always a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPath {
    segments: Vec<TagSegment>,
}

impl TagPath {
    /// Parses a tag string.
    ///
    /// Array indices follow the C `strtol` radix rules for compatibility
    /// with existing databases: a `0x`/`0X` prefix is hexadecimal, a leading
    /// `0` is octal, anything else decimal. So `arr[010]` addresses element
    /// 8, not 10.
    ///
    /// # Errors
    ///
    /// Fails on an empty tag, a tag starting with `[`, an unclosed `]`,
    /// empty brackets, a non-digit inside brackets, or a zero-length name
    /// between separators.
    pub fn parse(tag: &str) -> Result<Self> {
        let bytes = tag.as_bytes();
        let mut segments = Vec::new();
        let mut pos = 0;

        while pos < bytes.len() {
            match bytes[pos] {
                b'.' => {
                    // separator; a name must follow
                    pos += 1;
                    let len = name_len(&bytes[pos..]);
                    if len == 0 {
                        return Err(EipError::Parse(format!(
                            "'{tag}': empty name after '.'"
                        )));
                    }
                    segments.push(TagSegment::Name(tag[pos..pos + len].to_string()));
                    pos += len;
                }
                b'[' => {
                    if segments.is_empty() {
                        return Err(EipError::Parse(format!(
                            "'{tag}': tag cannot start with an element index"
                        )));
                    }
                    let close = match bytes[pos..].iter().position(|&b| b == b']') {
                        Some(off) => pos + off,
                        None => {
                            return Err(EipError::Parse(format!("'{tag}': unclosed '['")))
                        }
                    };
                    let index = parse_index(&tag[pos + 1..close])
                        .ok_or_else(|| {
                            EipError::Parse(format!(
                                "'{tag}': bad element index '{}'",
                                &tag[pos + 1..close]
                            ))
                        })?;
                    segments.push(TagSegment::Element(index));
                    pos = close + 1;
                }
                _ => {
                    let len = name_len(&bytes[pos..]);
                    if len == 0 {
                        return Err(EipError::Parse(format!(
                            "'{tag}': unexpected '{}'",
                            bytes[pos] as char
                        )));
                    }
                    if !segments.is_empty() {
                        // a bare name is only legal at the very start;
                        // later names need the '.' separator
                        return Err(EipError::Parse(format!(
                            "'{tag}': expected '.' or '[' at offset {pos}"
                        )));
                    }
                    segments.push(TagSegment::Name(tag[pos..pos + len].to_string()));
                    pos += len;
                }
            }
        }

        match segments.first() {
            Some(TagSegment::Name(_)) => Ok(TagPath { segments }),
            _ => Err(EipError::Parse(format!("'{tag}': empty tag"))),
        }
    }

    /// The ordered segments of this path.
    pub fn segments(&self) -> &[TagSegment] {
        &self.segments
    }
}

impl FromStr for TagPath {
    type Err = EipError;

    fn from_str(s: &str) -> Result<Self> {
        TagPath::parse(s)
    }
}

impl fmt::Display for TagPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                TagSegment::Name(name) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{name}")?;
                }
                TagSegment::Element(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

fn name_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .position(|&b| b == b'.' || b == b'[')
        .unwrap_or(bytes.len())
}

/// C-style integer parse: `0x` hex, leading `0` octal, else decimal.
fn parse_index(text: &str) -> Option<u32> {
    if text.is_empty() {
        return None;
    }
    let (digits, radix) = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> TagSegment {
        TagSegment::Name(s.to_string())
    }

    #[test]
    fn parses_dotted_names() {
        let tag = TagPath::parse("Local:2:I.Ch0Data").unwrap();
        assert_eq!(
            tag.segments(),
            &[name("Local:2:I"), name("Ch0Data")]
        );
    }

    #[test]
    fn parses_elements_and_members() {
        let tag = TagPath::parse("arr[258].val[2]").unwrap();
        assert_eq!(
            tag.segments(),
            &[
                name("arr"),
                TagSegment::Element(258),
                name("val"),
                TagSegment::Element(2),
            ]
        );
    }

    #[test]
    fn index_radix_follows_c_rules() {
        let hex = TagPath::parse("a[0x10]").unwrap();
        assert_eq!(hex.segments()[1], TagSegment::Element(16));
        let oct = TagPath::parse("a[010]").unwrap();
        assert_eq!(oct.segments()[1], TagSegment::Element(8));
        let dec = TagPath::parse("a[10]").unwrap();
        assert_eq!(dec.segments()[1], TagSegment::Element(10));
        let zero = TagPath::parse("a[0]").unwrap();
        assert_eq!(zero.segments()[1], TagSegment::Element(0));
    }

    #[test]
    fn rejects_malformed_tags() {
        assert!(TagPath::parse("").is_err());
        assert!(TagPath::parse("[3]").is_err());
        assert!(TagPath::parse("a[3").is_err());
        assert!(TagPath::parse("a[]").is_err());
        assert!(TagPath::parse("a[3x]").is_err());
        assert!(TagPath::parse("a..b").is_err());
        assert!(TagPath::parse("a.").is_err());
    }

    #[test]
    fn display_round_trip() {
        for text in ["fred", "Local:2:I.Ch0Data", "arr[258]", "a[1].b[2].c"] {
            let tag = TagPath::parse(text).unwrap();
            assert_eq!(tag.to_string(), text);
        }
    }
}
