//! CIP Message-Router PDUs and the services used by this driver.
//!
//! Covers the request builders and response views for:
//!
//! - `Read Tag` (0x4C) and `Write Tag` (0x4D) from "Logix 5000 Data Access"
//! - `Get_Attribute_Single` (0x0E)
//! - `Unconnected_Send` (0x52) routing through the Connection Manager
//! - `Multiple Service Packet` (0x0A) bundling, with the offset-table
//!   append protocol
//!
//! plus the abbreviated CIP data types, general/extended status texts and
//! typed access into raw `type | data` payloads.

use crate::codec::{put_u16, put_u8, ByteReader};
use crate::epath::{cia_path_size, port_path_size, push_cia_path, push_port_path, push_tag_path, tag_path_size};
use crate::error::{EipError, Result};
use crate::tag_path::TagPath;

// =========================================================================
// Classes and services
// =========================================================================

/// Identity object class.
pub const CLASS_IDENTITY: u8 = 0x01;
/// Message Router class.
pub const CLASS_MESSAGE_ROUTER: u8 = 0x02;
/// Connection Manager class.
pub const CLASS_CONNECTION_MANAGER: u8 = 0x06;

/// Get_Attribute_All service.
pub const S_GET_ATTRIBUTE_ALL: u8 = 0x01;
/// Multiple Service Packet service.
pub const S_MULTI_REQUEST: u8 = 0x0A;
/// Get_Attribute_Single service.
pub const S_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
/// Read Tag service.
pub const S_READ_DATA: u8 = 0x4C;
/// Write Tag service.
pub const S_WRITE_DATA: u8 = 0x4D;
/// Connection Manager Unconnected_Send service.
pub const S_UNCONNECTED_SEND: u8 = 0x52;
/// Connection Manager Forward_Open service (diagnostics only; connected
/// messaging is not implemented).
pub const S_FORWARD_OPEN: u8 = 0x54;

/// High bit of the service byte marks a response.
pub const REPLY_BIT: u8 = 0x80;

/// Human-readable service name for diagnostics.
pub fn service_name(service: u8) -> &'static str {
    match service & !REPLY_BIT {
        S_GET_ATTRIBUTE_ALL => "Get_Attribute_All",
        S_GET_ATTRIBUTE_SINGLE => "Get_Attribute_Single",
        S_MULTI_REQUEST => "CIP_MultiRequest",
        S_READ_DATA => "CIP_ReadData",
        S_WRITE_DATA => "CIP_WriteData",
        S_UNCONNECTED_SEND => "CM_Unconnected_Send",
        S_FORWARD_OPEN => "CM_Forward_Open",
        _ => "<unknown>",
    }
}

/// Text for a CIP general status. The status space is an open enum;
/// unknown codes report as `<unknown>` and are never treated as success.
pub fn status_text(status: u8) -> &'static str {
    match status {
        0x00 => "Ok",
        0x04 => "Unknown tag or Path error",
        0x05 => "Instance not found",
        0x06 => "Buffer too small, partial data only",
        0x08 => "Service not supported",
        0x09 => "Invalid Attribute",
        0x13 => "Not enough data",
        0x14 => "Attribute not supported, ext. shows attribute",
        0x15 => "Too much data",
        0x1E => "One of the MultiRequests failed",
        _ => "<unknown>",
    }
}

/// Text for known extended status words (reported under general status
/// 0xFF, plus the connection-manager 0x0107).
pub fn extended_status_text(general: u8, extended: u16) -> Option<&'static str> {
    if general == 0xFF {
        match extended {
            0x2104 => return Some("Beginning offset beyond end of template"),
            0x2105 => return Some("Access beyond end of object, wrong array index"),
            0x2107 => return Some("CIP type does not match object type"),
            _ => {}
        }
    }
    if extended == 0x0107 {
        return Some("Connection not found");
    }
    None
}

// =========================================================================
// Abbreviated CIP types
// =========================================================================

/// Abbreviated CIP data types as they appear ahead of tag data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipType {
    Bool,
    Sint,
    Int,
    Dint,
    Real,
    Bits,
}

impl CipType {
    /// Decodes the 16-bit abbreviated type code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x00C1 => Some(CipType::Bool),
            0x00C2 => Some(CipType::Sint),
            0x00C3 => Some(CipType::Int),
            0x00C4 => Some(CipType::Dint),
            0x00CA => Some(CipType::Real),
            0x00D3 => Some(CipType::Bits),
            _ => None,
        }
    }

    /// The 16-bit wire code.
    pub fn code(self) -> u16 {
        match self {
            CipType::Bool => 0x00C1,
            CipType::Sint => 0x00C2,
            CipType::Int => 0x00C3,
            CipType::Dint => 0x00C4,
            CipType::Real => 0x00CA,
            CipType::Bits => 0x00D3,
        }
    }

    /// Per-element byte size.
    pub fn size(self) -> usize {
        match self {
            CipType::Bool | CipType::Sint => 1,
            CipType::Int => 2,
            CipType::Dint | CipType::Real | CipType::Bits => 4,
        }
    }

    /// Type name as shown by dump/report output.
    pub fn name(self) -> &'static str {
        match self {
            CipType::Bool => "BOOL",
            CipType::Sint => "SINT",
            CipType::Int => "INT",
            CipType::Dint => "DINT",
            CipType::Real => "REAL",
            CipType::Bits => "BITS",
        }
    }
}

// =========================================================================
// MR_Request / MR_Response
// =========================================================================

/// Byte size of an MR request for a path of `path_words` words,
/// excluding service data.
pub fn mr_request_size(path_words: usize) -> usize {
    2 + path_words * 2
}

/// Appends the two fixed MR request bytes; the caller appends the path.
pub fn push_mr_request(buf: &mut Vec<u8>, service: u8, path_words: usize) {
    put_u8(buf, service);
    put_u8(buf, path_words as u8);
}

/// View over a raw MR response.
///
/// Layout: `service|0x80, reserved, general_status, ext_status_size_words,
/// ext_status[..], data[..]`.
#[derive(Debug, Clone, Copy)]
pub struct MrResponse<'a> {
    buf: &'a [u8],
}

impl<'a> MrResponse<'a> {
    /// Wraps a buffer; needs at least the 4 fixed bytes.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(EipError::Protocol(format!(
                "MR response too short: {} bytes",
                buf.len()
            )));
        }
        Ok(MrResponse { buf })
    }

    /// Service byte, reply bit included.
    pub fn service(&self) -> u8 {
        self.buf[0]
    }

    /// General status; 0 means success.
    pub fn general_status(&self) -> u8 {
        self.buf[2]
    }

    /// Number of extended status words.
    pub fn ext_status_size(&self) -> usize {
        self.buf[3] as usize
    }

    /// First extended status word, if present and complete.
    pub fn ext_status(&self) -> Option<u16> {
        if self.ext_status_size() > 0 && self.buf.len() >= 6 {
            Some(u16::from_le_bytes([self.buf[4], self.buf[5]]))
        } else {
            None
        }
    }

    /// Service data: everything past `4 + 2 * ext_status_size`, empty when
    /// the response ends before that offset.
    pub fn data(&self) -> &'a [u8] {
        let skip = 4 + 2 * self.ext_status_size();
        if self.buf.len() > skip {
            &self.buf[skip..]
        } else {
            &[]
        }
    }

    /// Verifies the service echo (`request | 0x80`) and a zero general
    /// status, returning the data section.
    pub fn check(&self, request_service: u8) -> Result<&'a [u8]> {
        if self.service() != request_service | REPLY_BIT {
            return Err(EipError::Protocol(format!(
                "service 0x{:02X} does not answer request 0x{:02X} ({})",
                self.service(),
                request_service,
                service_name(request_service)
            )));
        }
        if self.general_status() != 0 {
            return Err(EipError::cip(self.general_status(), self.ext_status()));
        }
        Ok(self.data())
    }
}

// =========================================================================
// ReadData / WriteData / Get_Attribute_Single
// =========================================================================

/// Byte size of a ReadData request for a tag.
pub fn read_data_size(tag: &TagPath) -> usize {
    mr_request_size(tag_path_size(tag)) + 2 // + elements
}

/// Appends a ReadData request: MR header, tag path, element count.
pub fn push_read_data(buf: &mut Vec<u8>, tag: &TagPath, elements: u16) {
    push_mr_request(buf, S_READ_DATA, tag_path_size(tag));
    push_tag_path(buf, tag);
    put_u16(buf, elements);
}

/// Byte size of a WriteData request for a tag and `data_size` value bytes.
pub fn write_data_size(tag: &TagPath, data_size: usize) -> usize {
    mr_request_size(tag_path_size(tag)) + 4 + data_size // + type, elements
}

/// Appends a WriteData request. `raw_data` must already be in wire format.
pub fn push_write_data(
    buf: &mut Vec<u8>,
    tag: &TagPath,
    ty: CipType,
    elements: u16,
    raw_data: &[u8],
) {
    push_mr_request(buf, S_WRITE_DATA, tag_path_size(tag));
    push_tag_path(buf, tag);
    put_u16(buf, ty.code());
    put_u16(buf, elements);
    buf.extend_from_slice(raw_data);
}

/// Builds a Get_Attribute_Single request against class/instance/attribute.
pub fn make_get_attribute_single(class: u8, instance: u8, attribute: u8) -> Vec<u8> {
    let words = cia_path_size(class, instance, attribute);
    let mut buf = Vec::with_capacity(mr_request_size(words));
    push_mr_request(&mut buf, S_GET_ATTRIBUTE_SINGLE, words);
    push_cia_path(&mut buf, class, instance, attribute);
    buf
}

// =========================================================================
// Connection Manager: Unconnected_Send
// =========================================================================

/// Unconnected_Send timeout target, milliseconds. With the tick encoding
/// below this comes out as tick_time 10, 240 ticks.
pub const UNCONNECTED_TIMEOUT_MS: u32 = 245_760;

/// Splits a millisecond timeout into `(tick_time, ticks)` such that
/// `ticks << tick_time` recovers the (8-bit-truncated) value.
/// Returns `None` above the encodable domain of 8 355 840 ms.
pub fn tick_time(mut millisec: u32) -> Option<(u8, u8)> {
    if millisec > 8_355_840 {
        return None;
    }
    let mut tick_time = 0u8;
    while millisec > 0xFF {
        tick_time += 1;
        millisec >>= 1;
    }
    Some((tick_time, millisec as u8))
}

/// Byte size of an Unconnected_Send wrapping `message_size` inner bytes.
pub fn unconnected_send_size(message_size: usize) -> usize {
    mr_request_size(cia_path_size(CLASS_CONNECTION_MANAGER, 1, 0))
        + 1                               // priority / tick time
        + 1                               // timeout ticks
        + 2                               // message size
        + message_size + message_size % 2 // padded inner request
        + 2                               // path size, reserved
        + 2 * port_path_size(1, 0)        // backplane port path
}

/// Wraps an inner MR request in `CM_Unconnected_Send`, routed over the
/// backplane (port 1) to `slot`.
pub fn wrap_unconnected_send(inner: &[u8], slot: u8) -> Vec<u8> {
    let (ticks_exp, ticks) =
        tick_time(UNCONNECTED_TIMEOUT_MS).expect("constant timeout is encodable");
    let mut buf = Vec::with_capacity(unconnected_send_size(inner.len()));
    push_mr_request(&mut buf, S_UNCONNECTED_SEND, cia_path_size(CLASS_CONNECTION_MANAGER, 1, 0));
    push_cia_path(&mut buf, CLASS_CONNECTION_MANAGER, 1, 0);
    put_u8(&mut buf, ticks_exp);
    put_u8(&mut buf, ticks);
    put_u16(&mut buf, inner.len() as u16);
    buf.extend_from_slice(inner);
    if inner.len() % 2 != 0 {
        put_u8(&mut buf, 0); // pad to even
    }
    put_u8(&mut buf, port_path_size(1, slot) as u8);
    put_u8(&mut buf, 0); // reserved
    push_port_path(&mut buf, 1, slot);
    buf
}

/// Strips a `CM_Unconnected_Send` reply wrapper if the target sent one.
///
/// On success the Connection Manager normally forwards the inner response
/// untouched; some targets (and every routing failure) answer with a 0xD2
/// frame instead. A non-zero CM status surfaces as a CIP error.
pub fn unwrap_unconnected_send_response(response: &[u8]) -> Result<&[u8]> {
    if response.first() != Some(&(S_UNCONNECTED_SEND | REPLY_BIT)) {
        return Ok(response);
    }
    let mr = MrResponse::parse(response)?;
    if mr.general_status() != 0 {
        return Err(EipError::cip(mr.general_status(), mr.ext_status()));
    }
    Ok(mr.data())
}

// =========================================================================
// Multiple Service Packet
// =========================================================================

/// Byte size of a MultiRequest holding `count` requests totalling
/// `requests_size` bytes.
pub fn multi_request_size(count: usize, requests_size: usize) -> usize {
    mr_request_size(cia_path_size(CLASS_MESSAGE_ROUTER, 1, 0)) + 2 + 2 * count + requests_size
}

/// Estimated byte size of the matching MultiResponse.
pub fn multi_response_size(count: usize, responses_size: usize) -> usize {
    4 + 2 + 2 * count + responses_size
}

/// Incremental MultiRequest builder.
///
/// Offsets count from the `count` field; `offset[0] = 2 + 2 * count` and
/// each later offset is fixed up when the preceding item's size is known,
/// so items must be pushed in order 0, 1, ... count-1.
#[derive(Debug)]
pub struct MultiRequestBuilder {
    buf: Vec<u8>,
    count: usize,
    pushed: usize,
    /// Byte index of the `count` field inside `buf`.
    count_pos: usize,
}

impl MultiRequestBuilder {
    /// Starts a MultiRequest for exactly `count` items.
    pub fn new(count: usize) -> Self {
        let mut buf = Vec::with_capacity(multi_request_size(count, 0));
        push_mr_request(&mut buf, S_MULTI_REQUEST, cia_path_size(CLASS_MESSAGE_ROUTER, 1, 0));
        push_cia_path(&mut buf, CLASS_MESSAGE_ROUTER, 1, 0);
        let count_pos = buf.len();
        put_u16(&mut buf, count as u16);
        put_u16(&mut buf, (2 + 2 * count) as u16); // offset[0]
        for _ in 1..count {
            put_u16(&mut buf, 0); // fixed up as items arrive
        }
        MultiRequestBuilder {
            buf,
            count,
            pushed: 0,
            count_pos,
        }
    }

    /// Appends the next item request.
    pub fn push(&mut self, item: &[u8]) -> Result<()> {
        if self.pushed >= self.count {
            return Err(EipError::Protocol(format!(
                "MultiRequest holds {} items already",
                self.count
            )));
        }
        let offset_table = self.count_pos + 2;
        let this_offset = u16::from_le_bytes([
            self.buf[offset_table + 2 * self.pushed],
            self.buf[offset_table + 2 * self.pushed + 1],
        ]);
        self.buf.extend_from_slice(item);
        self.pushed += 1;
        if self.pushed < self.count {
            let next = this_offset + item.len() as u16;
            let slot = offset_table + 2 * self.pushed;
            self.buf[slot..slot + 2].copy_from_slice(&next.to_le_bytes());
        }
        Ok(())
    }

    /// Finishes the request; errors unless every announced item was pushed.
    pub fn finish(self) -> Result<Vec<u8>> {
        if self.pushed != self.count {
            return Err(EipError::Protocol(format!(
                "MultiRequest incomplete: {} of {} items",
                self.pushed, self.count
            )));
        }
        Ok(self.buf)
    }
}

/// View over the data section of a MultiRequest response.
#[derive(Debug, Clone, Copy)]
pub struct MultiResponse<'a> {
    /// The MR response data: `count, offset[..], response bytes`.
    data: &'a [u8],
    count: usize,
}

impl<'a> MultiResponse<'a> {
    /// Parses the data section of an MR response to `CIP_MultiRequest`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let count = r.read_u16()? as usize;
        if data.len() < 2 + 2 * count {
            return Err(EipError::Protocol(format!(
                "MultiResponse truncated: {count} items in {} bytes",
                data.len()
            )));
        }
        Ok(MultiResponse { data, count })
    }

    /// Number of enclosed responses.
    pub fn count(&self) -> usize {
        self.count
    }

    fn offset(&self, item: usize) -> usize {
        u16::from_le_bytes([self.data[2 + 2 * item], self.data[3 + 2 * item]]) as usize
    }

    /// The raw MR response for item `item`; size comes from the offset
    /// delta, the last item running to the end of the data.
    pub fn get(&self, item: usize) -> Result<&'a [u8]> {
        if item >= self.count {
            return Err(EipError::Protocol(format!(
                "MultiResponse item {item} out of range ({} items)",
                self.count
            )));
        }
        let start = self.offset(item);
        let end = if item + 1 < self.count {
            self.offset(item + 1)
        } else {
            self.data.len()
        };
        if start >= end || end > self.data.len() {
            return Err(EipError::Protocol(format!(
                "MultiResponse item {item}: bad offsets {start}..{end}"
            )));
        }
        Ok(&self.data[start..end])
    }
}

// =========================================================================
// Typed access to raw `type | data` payloads
// =========================================================================

/// Byte length of the abbreviated type code ahead of tag data.
pub const TYPECODE_SIZE: usize = 2;

/// Decodes the abbreviated type at the front of a payload.
pub fn payload_type(raw: &[u8]) -> Result<CipType> {
    if raw.len() < TYPECODE_SIZE {
        return Err(EipError::NoData);
    }
    let code = u16::from_le_bytes([raw[0], raw[1]]);
    CipType::from_code(code)
        .ok_or_else(|| EipError::Type(format!("unknown CIP type 0x{code:04X}")))
}

fn element_slice(raw: &[u8], element: usize) -> Result<(CipType, &[u8])> {
    let ty = payload_type(raw)?;
    let start = TYPECODE_SIZE + element * ty.size();
    let end = start + ty.size();
    if raw.len() < end {
        return Err(EipError::Type(format!(
            "element {element} beyond payload ({} bytes of {})",
            raw.len(),
            ty.name()
        )));
    }
    Ok((ty, &raw[start..end]))
}

/// Reads element `element` of a payload as `f64`.
pub fn get_f64(raw: &[u8], element: usize) -> Result<f64> {
    let (ty, bytes) = element_slice(raw, element)?;
    Ok(match ty {
        CipType::Bool | CipType::Sint => bytes[0] as f64,
        CipType::Int => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        CipType::Dint | CipType::Bits => {
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
        }
        CipType::Real => {
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
        }
    })
}

/// Reads element `element` of a payload as `u32`.
pub fn get_u32(raw: &[u8], element: usize) -> Result<u32> {
    let (ty, bytes) = element_slice(raw, element)?;
    Ok(match ty {
        CipType::Bool | CipType::Sint => bytes[0] as u32,
        CipType::Int => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
        CipType::Dint | CipType::Bits => {
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        }
        CipType::Real => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u32,
    })
}

fn element_slice_mut(raw: &mut [u8], element: usize) -> Result<(CipType, &mut [u8])> {
    let ty = payload_type(raw)?;
    let start = TYPECODE_SIZE + element * ty.size();
    let end = start + ty.size();
    if raw.len() < end {
        return Err(EipError::Type(format!(
            "element {element} beyond payload ({} bytes of {})",
            raw.len(),
            ty.name()
        )));
    }
    Ok((ty, &mut raw[start..end]))
}

/// Writes `value` into element `element`, coerced to the payload's
/// observed type.
pub fn put_f64(raw: &mut [u8], element: usize, value: f64) -> Result<()> {
    let (ty, bytes) = element_slice_mut(raw, element)?;
    match ty {
        CipType::Bool | CipType::Sint => bytes[0] = value as i64 as u8,
        CipType::Int => bytes.copy_from_slice(&(value as i64 as u16).to_le_bytes()),
        CipType::Dint | CipType::Bits => {
            bytes.copy_from_slice(&(value as i64 as u32).to_le_bytes())
        }
        CipType::Real => bytes.copy_from_slice(&(value as f32).to_le_bytes()),
    }
    Ok(())
}

/// Writes `value` into element `element`, coerced to the payload's
/// observed type.
pub fn put_u32(raw: &mut [u8], element: usize, value: u32) -> Result<()> {
    let (ty, bytes) = element_slice_mut(raw, element)?;
    match ty {
        CipType::Bool | CipType::Sint => bytes[0] = value as u8,
        CipType::Int => bytes.copy_from_slice(&(value as u16).to_le_bytes()),
        CipType::Dint | CipType::Bits => bytes.copy_from_slice(&value.to_le_bytes()),
        CipType::Real => bytes.copy_from_slice(&(value as f32).to_le_bytes()),
    }
    Ok(())
}

/// Renders a payload the way `dump` and the CLI print it:
/// `TYPE v0 v1 ...`, up to `elements` entries or the payload end.
pub fn format_payload(raw: &[u8], elements: usize) -> String {
    use std::fmt::Write;

    let ty = match payload_type(raw) {
        Ok(ty) => ty,
        Err(_) => {
            if raw.len() >= TYPECODE_SIZE {
                let code = u16::from_le_bytes([raw[0], raw[1]]);
                return format!("raw CIP data, unknown type 0x{code:04X}");
            }
            return "-no data-".to_string();
        }
    };
    let available = (raw.len() - TYPECODE_SIZE) / ty.size();
    let mut out = String::from(ty.name());
    for i in 0..elements.min(available) {
        match ty {
            CipType::Real => {
                let _ = write!(out, " {}", get_f64(raw, i).unwrap_or(f64::NAN));
            }
            CipType::Bits => {
                let _ = write!(out, " 0x{:08X}", get_u32(raw, i).unwrap_or(0));
            }
            _ => {
                let _ = write!(out, " {}", get_u32(raw, i).unwrap_or(0));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mr_response_data_offsets() {
        // no extended status: data starts at byte 4
        let buf = [0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 1, 0, 0, 0];
        let resp = MrResponse::parse(&buf).unwrap();
        assert_eq!(resp.data(), &buf[4..]);
        assert_eq!(resp.check(S_READ_DATA).unwrap().len(), 6);

        // one extended status word: data starts at byte 6
        let buf = [0xCC, 0x00, 0xFF, 0x01, 0x05, 0x21, 0xAA];
        let resp = MrResponse::parse(&buf).unwrap();
        assert_eq!(resp.data(), &[0xAA]);
        assert_eq!(resp.ext_status(), Some(0x2105));
        match resp.check(S_READ_DATA) {
            Err(EipError::Cip { status, extended }) => {
                assert_eq!(status, 0xFF);
                assert_eq!(extended, Some(0x2105));
            }
            other => panic!("expected CIP error, got {other:?}"),
        }

        // data length clamps to zero when the frame ends early
        let buf = [0xCC, 0x00, 0x00, 0x02, 0x01, 0x02];
        let resp = MrResponse::parse(&buf).unwrap();
        assert!(resp.data().is_empty());
    }

    #[test]
    fn service_echo_is_enforced() {
        let buf = [S_WRITE_DATA | REPLY_BIT, 0x00, 0x00, 0x00];
        let resp = MrResponse::parse(&buf).unwrap();
        assert!(resp.check(S_READ_DATA).is_err());
        assert!(resp.check(S_WRITE_DATA).is_ok());
    }

    #[test]
    fn read_request_bytes() {
        let tag = TagPath::parse("fred").unwrap();
        let mut buf = Vec::new();
        push_read_data(&mut buf, &tag, 1);
        assert_eq!(
            buf,
            [0x4C, 0x03, 0x91, 0x04, b'f', b'r', b'e', b'd', 0x01, 0x00]
        );
        assert_eq!(read_data_size(&tag), buf.len());
    }

    #[test]
    fn write_request_bytes() {
        let tag = TagPath::parse("fred").unwrap();
        let mut buf = Vec::new();
        push_write_data(&mut buf, &tag, CipType::Dint, 1, &42u32.to_le_bytes());
        assert_eq!(
            buf,
            [
                0x4D, 0x03, 0x91, 0x04, b'f', b'r', b'e', b'd', //
                0xC4, 0x00, 0x01, 0x00, 42, 0, 0, 0
            ]
        );
        assert_eq!(write_data_size(&tag, 4), buf.len());
    }

    #[test]
    fn tick_time_encoding() {
        assert_eq!(tick_time(245_760), Some((10, 240)));
        assert_eq!(tick_time(0), Some((0, 0)));
        assert_eq!(tick_time(255), Some((0, 255)));
        assert_eq!(tick_time(256), Some((1, 128)));
        assert_eq!(tick_time(8_355_840), Some((15, 255)));
        assert_eq!(tick_time(8_355_841), None);

        // (ticks << tick_time) recovers the truncated value for the whole
        // domain shape: sample across magnitudes
        for ms in [0u32, 1, 100, 255, 256, 1000, 65_535, 245_760, 8_355_840] {
            let (t, ticks) = tick_time(ms).unwrap();
            assert!(ticks as u32 <= 255);
            assert_eq!(ms >> t, ticks as u32, "ms = {ms}");
        }
    }

    #[test]
    fn unconnected_send_layout() {
        let inner = [0x4C, 0x01, 0x91, 0x01, b'x', 0x00, 0x01]; // odd length
        let wrapped = wrap_unconnected_send(&inner, 3);
        assert_eq!(
            &wrapped[..6],
            [0x52, 0x02, 0x20, 0x06, 0x24, 0x01],
            "CM path"
        );
        assert_eq!(wrapped[6], 10, "tick time");
        assert_eq!(wrapped[7], 240, "ticks");
        assert_eq!(u16::from_le_bytes([wrapped[8], wrapped[9]]), 7);
        assert_eq!(&wrapped[10..17], inner);
        assert_eq!(wrapped[17], 0, "pad to even");
        assert_eq!(wrapped[18], 1, "port path words");
        assert_eq!(wrapped[19], 0, "reserved");
        assert_eq!(&wrapped[20..], [0x01, 0x03], "port 1, link = slot");
        assert_eq!(wrapped.len(), unconnected_send_size(inner.len()));
        assert_eq!(wrapped.len() % 2, 0);
    }

    #[test]
    fn multi_request_offsets() {
        let tag = TagPath::parse("fred").unwrap();
        let mut item = Vec::new();
        push_read_data(&mut item, &tag, 1);
        let item_len = item.len() as u16;

        let mut multi = MultiRequestBuilder::new(3);
        multi.push(&item).unwrap();
        multi.push(&item).unwrap();
        multi.push(&item).unwrap();
        let buf = multi.finish().unwrap();

        // MR header + MessageRouter/1 path
        assert_eq!(&buf[..6], [0x0A, 0x02, 0x20, 0x02, 0x24, 0x01]);
        // count, then the offset table from the count field
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 3);
        let off = |k: usize| u16::from_le_bytes([buf[8 + 2 * k], buf[9 + 2 * k]]);
        assert_eq!(off(0), 8);
        assert_eq!(off(1), 8 + item_len);
        assert_eq!(off(2), 8 + 2 * item_len);
        assert_eq!(buf.len(), multi_request_size(3, 3 * item.len()));
    }

    #[test]
    fn multi_request_must_be_complete() {
        let mut multi = MultiRequestBuilder::new(2);
        multi.push(&[0x4C, 0x00, 0x01, 0x00]).unwrap();
        assert!(multi.finish().is_err());
    }

    #[test]
    fn multi_response_extraction() {
        // count = 3, offsets 8, 12, 18 from the count field
        let mut data = Vec::new();
        put_u16(&mut data, 3);
        put_u16(&mut data, 8);
        put_u16(&mut data, 12);
        put_u16(&mut data, 18);
        data.extend_from_slice(&[0xCC, 0, 0, 0]); // item 0: 4 bytes
        data.extend_from_slice(&[0xCC, 0, 0, 0, 0xC4, 0x00]); // item 1: 6 bytes
        data.extend_from_slice(&[0xCD, 0, 0, 0, 0xAA]); // item 2: runs to end

        let multi = MultiResponse::parse(&data).unwrap();
        assert_eq!(multi.count(), 3);
        assert_eq!(multi.get(0).unwrap().len(), 4);
        assert_eq!(multi.get(1).unwrap().len(), 6);
        assert_eq!(multi.get(2).unwrap(), &[0xCD, 0, 0, 0, 0xAA]);
        assert!(multi.get(3).is_err());
    }

    #[test]
    fn typed_payload_access() {
        // DINT 42, 1000
        let mut raw = vec![0xC4, 0x00];
        raw.extend_from_slice(&42u32.to_le_bytes());
        raw.extend_from_slice(&1000u32.to_le_bytes());

        assert_eq!(payload_type(&raw).unwrap(), CipType::Dint);
        assert_eq!(get_u32(&raw, 0).unwrap(), 42);
        assert_eq!(get_f64(&raw, 1).unwrap(), 1000.0);
        assert!(get_u32(&raw, 2).is_err());

        put_u32(&mut raw, 0, 7).unwrap();
        assert_eq!(get_u32(&raw, 0).unwrap(), 7);
        assert_eq!(format_payload(&raw, 2), "DINT 7 1000");

        // REAL payload coerces through f64
        let mut real = vec![0xCA, 0x00, 0, 0, 0, 0];
        put_f64(&mut real, 0, 2.5).unwrap();
        assert_eq!(get_f64(&real, 0).unwrap(), 2.5);
        assert_eq!(format_payload(&real, 1), "REAL 2.5");

        // BITS render as hex
        let bits = [0xD3, 0x00, 0xEF, 0xBE, 0xAD, 0xDE];
        assert_eq!(format_payload(&bits, 1), "BITS 0xDEADBEEF");

        // unknown type is an error, not a silent success
        let unknown = [0xA0, 0x02, 0x00];
        assert!(matches!(payload_type(&unknown), Err(EipError::Type(_))));
        assert!(format_payload(&unknown, 1).contains("unknown type 0x02A0"));

        // empty payload reports NoData
        assert!(matches!(payload_type(&[]), Err(EipError::NoData)));
    }
}
