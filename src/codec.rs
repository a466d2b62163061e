//! Little-endian byte codec for the ENIP/CIP wire format.
//!
//! Every multi-byte integer on the wire is little-endian; REAL values are
//! IEEE-754 single precision, also little-endian regardless of host byte
//! order (`to_le_bytes`/`from_le_bytes` handle the swap at compile time).
//!
//! Writing appends to a `Vec<u8>`; reading goes through the cursor-style
//! [`ByteReader`], which replaces the printf-style format-driven unpacker of
//! older drivers with typed `read_*`/`skip` calls.

use crate::error::{EipError, Result};

/// Appends a single byte.
#[inline]
pub fn put_u8(buf: &mut Vec<u8>, val: u8) {
    buf.push(val);
}

/// Appends a 16-bit integer, little-endian.
#[inline]
pub fn put_u16(buf: &mut Vec<u8>, val: u16) {
    buf.extend_from_slice(&val.to_le_bytes());
}

/// Appends a 32-bit integer, little-endian.
#[inline]
pub fn put_u32(buf: &mut Vec<u8>, val: u32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

/// Appends a 32-bit REAL, little-endian. NaN payloads survive untouched.
#[inline]
pub fn put_f32(buf: &mut Vec<u8>, val: f32) {
    buf.extend_from_slice(&val.to_le_bytes());
}

/// Cursor over a received buffer.
///
/// All reads are bounds-checked; running off the end yields
/// [`EipError::Protocol`] rather than a panic, since the buffer contents
/// came from the network.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader over `buf`, positioned at the start.
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(EipError::Protocol(format!(
                "buffer underrun: need {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Reads a 16-bit little-endian integer.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    /// Reads a 32-bit little-endian integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_le_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    /// Reads a 32-bit little-endian REAL, preserving the exact bit pattern.
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    /// Takes the next `n` bytes as a slice.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Returns everything from the cursor to the end.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Formats a buffer as a classic offset/hex/ASCII dump for TRACE logging.
pub fn hexdump(data: &[u8]) -> String {
    use std::fmt::Write;

    const WIDTH: usize = 16;
    let mut out = String::new();
    for (row, chunk) in data.chunks(WIDTH).enumerate() {
        let _ = write!(out, "{:08X} ", row * WIDTH);
        for i in 0..WIDTH {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02X} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("- ");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trips() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 0xAB);
        put_u16(&mut buf, 0x1234);
        put_u32(&mut buf, 0xDEADBEEF);
        assert_eq!(buf, [0xAB, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn real_wire_order_is_little_endian() {
        let mut buf = Vec::new();
        put_f32(&mut buf, 1.0);
        // 1.0f32 = 0x3F800000
        assert_eq!(buf, [0x00, 0x00, 0x80, 0x3F]);
        assert_eq!(ByteReader::new(&buf).read_f32().unwrap(), 1.0);
    }

    #[test]
    fn real_round_trip_preserves_bits() {
        for bits in [
            0x0000_0000u32, // +0
            0x8000_0000,    // -0
            0x0000_0001,    // smallest subnormal
            0x7F80_0000,    // +inf
            0xFF80_0000,    // -inf
            0x7FC0_0001,    // quiet NaN with payload
            0x7FA0_0000,    // signaling NaN
        ] {
            let mut buf = Vec::new();
            put_f32(&mut buf, f32::from_bits(bits));
            let back = ByteReader::new(&buf).read_f32().unwrap();
            assert_eq!(back.to_bits(), bits, "bits 0x{bits:08X}");
        }
    }

    #[test]
    fn underrun_is_an_error() {
        let buf = [0x01u8, 0x02];
        let mut r = ByteReader::new(&buf);
        assert!(r.read_u32().is_err());
        // the failed read must not move the cursor
        assert_eq!(r.read_u16().unwrap(), 0x0201);
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn skip_and_take() {
        let buf = [1u8, 2, 3, 4, 5];
        let mut r = ByteReader::new(&buf);
        r.skip(2).unwrap();
        assert_eq!(r.take(2).unwrap(), &[3, 4]);
        assert_eq!(r.rest(), &[5]);
    }

    #[test]
    fn hexdump_shape() {
        let dump = hexdump(b"AIRPLANE\x00\x01");
        assert!(dump.starts_with("00000000 41 49 52 50"));
        assert!(dump.contains("AIRPLANE.."));
    }
}
