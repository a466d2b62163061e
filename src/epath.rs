//! CIP IOI path encoding.
//!
//! A CIP request addresses its target object through a padded EPATH: a
//! sequence of 16-bit words holding port, logical (class / instance /
//! attribute) or symbolic segments. Size functions return word counts;
//! fill functions append bytes. Built paths always have even byte length.

use crate::codec::{put_u16, put_u32, put_u8};
use crate::tag_path::{TagPath, TagSegment};

/// ANSI extended symbol segment marker.
const SEG_SYMBOLIC: u8 = 0x91;
/// Logical class segment, 8-bit id.
const SEG_CLASS: u8 = 0x20;
/// Logical instance segment, 8-bit id.
const SEG_INSTANCE: u8 = 0x24;
/// Logical attribute segment, 8-bit id.
const SEG_ATTRIBUTE: u8 = 0x30;
/// Element segments by index width.
const SEG_ELEMENT_8: u8 = 0x28;
const SEG_ELEMENT_16: u8 = 0x29;
const SEG_ELEMENT_32: u8 = 0x2A;

/// Word size of a port segment. Only ports 1..=14 are supported; wider
/// ports would need the extended port-segment format.
pub fn port_path_size(_port: u8, _link: u8) -> usize {
    1
}

/// Appends a one-word port segment (`port`, then `link`).
pub fn push_port_path(buf: &mut Vec<u8>, port: u8, link: u8) {
    debug_assert!((1..=14).contains(&port), "ports >= 15 not supported");
    put_u8(buf, port);
    put_u8(buf, link);
}

/// Word size of a Class/Instance\[/Attribute\] path. `attribute == 0`
/// means "no attribute segment".
pub fn cia_path_size(_class: u8, _instance: u8, attribute: u8) -> usize {
    if attribute != 0 {
        3
    } else {
        2
    }
}

/// Appends a Class/Instance\[/Attribute\] path.
pub fn push_cia_path(buf: &mut Vec<u8>, class: u8, instance: u8, attribute: u8) {
    put_u8(buf, SEG_CLASS);
    put_u8(buf, class);
    put_u8(buf, SEG_INSTANCE);
    put_u8(buf, instance);
    if attribute != 0 {
        put_u8(buf, SEG_ATTRIBUTE);
        put_u8(buf, attribute);
    }
}

/// Word size of the symbolic path for a parsed tag.
pub fn tag_path_size(tag: &TagPath) -> usize {
    let mut bytes = 0;
    for seg in tag.segments() {
        bytes += match seg {
            TagSegment::Name(name) => {
                let len = name.len();
                2 + len + len % 2 // 0x91, len, name [, pad]
            }
            TagSegment::Element(idx) => match idx {
                0..=0xFF => 2,
                0x100..=0xFFFF => 4,
                _ => 6,
            },
        };
    }
    bytes / 2
}

/// Appends the symbolic path for a parsed tag, padding every name segment
/// to even length.
pub fn push_tag_path(buf: &mut Vec<u8>, tag: &TagPath) {
    for seg in tag.segments() {
        match seg {
            TagSegment::Name(name) => {
                put_u8(buf, SEG_SYMBOLIC);
                put_u8(buf, name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                if name.len() % 2 != 0 {
                    put_u8(buf, 0);
                }
            }
            TagSegment::Element(idx) => {
                if *idx <= 0xFF {
                    put_u8(buf, SEG_ELEMENT_8);
                    put_u8(buf, *idx as u8);
                } else if *idx <= 0xFFFF {
                    put_u8(buf, SEG_ELEMENT_16);
                    put_u8(buf, 0);
                    put_u16(buf, *idx as u16);
                } else {
                    put_u8(buf, SEG_ELEMENT_32);
                    put_u8(buf, 0);
                    put_u32(buf, *idx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(tag: &str) -> (TagPath, Vec<u8>) {
        let parsed = TagPath::parse(tag).unwrap();
        let mut buf = Vec::new();
        push_tag_path(&mut buf, &parsed);
        (parsed, buf)
    }

    #[test]
    fn symbolic_segments_with_padding() {
        // Names of odd length get a zero pad so each segment ends on a
        // word boundary.
        let (_, buf) = build("Local:2:I.Ch0Data");
        assert_eq!(
            buf,
            [
                0x91, 0x09, b'L', b'o', b'c', b'a', b'l', b':', b'2', b':', b'I', 0x00, //
                0x91, 0x07, b'C', b'h', b'0', b'D', b'a', b't', b'a', 0x00,
            ]
        );
    }

    #[test]
    fn element_segment_widths() {
        let (_, buf) = build("arr[258]");
        assert_eq!(
            buf,
            [0x91, 0x03, b'a', b'r', b'r', 0x00, 0x29, 0x00, 0x02, 0x01]
        );

        let (_, small) = build("arr[5]");
        assert_eq!(&small[6..], [0x28, 0x05]);

        let (_, wide) = build("arr[0x12345]");
        assert_eq!(&wide[6..], [0x2A, 0x00, 0x45, 0x23, 0x01, 0x00]);
    }

    #[test]
    fn size_matches_built_bytes() {
        for text in [
            "fred",
            "my_tag",
            "Local:2:I.Ch0Data",
            "arr[258]",
            "arr[5].member.sub[70000]",
            "a[0].b[256]",
        ] {
            let (parsed, buf) = build(text);
            assert_eq!(buf.len() % 2, 0, "{text}: odd path length");
            assert_eq!(
                tag_path_size(&parsed) * 2,
                buf.len(),
                "{text}: size mismatch"
            );
        }
    }

    #[test]
    fn cia_path_with_and_without_attribute() {
        let mut buf = Vec::new();
        push_cia_path(&mut buf, 0x01, 1, 7);
        assert_eq!(buf, [0x20, 0x01, 0x24, 0x01, 0x30, 0x07]);
        assert_eq!(cia_path_size(0x01, 1, 7) * 2, buf.len());

        let mut buf = Vec::new();
        push_cia_path(&mut buf, 0x02, 1, 0);
        assert_eq!(buf, [0x20, 0x02, 0x24, 0x01]);
        assert_eq!(cia_path_size(0x02, 1, 0) * 2, buf.len());
    }

    #[test]
    fn port_segment() {
        let mut buf = Vec::new();
        push_port_path(&mut buf, 1, 3);
        assert_eq!(buf, [0x01, 0x03]);
        assert_eq!(port_path_size(1, 3) * 2, buf.len());
    }
}
