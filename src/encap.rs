//! EtherNet/IP encapsulation layer.
//!
//! Every message on the TCP connection starts with a 24-byte encapsulation
//! header; `length` counts the bytes that follow it. This module builds and
//! parses the header, the RegisterSession / ListServices payloads and the
//! SendRRData common-packet-format preamble that carries unconnected CIP
//! requests and responses.

use crate::codec::{put_u16, put_u32, ByteReader};
use crate::error::{EipError, Result};

/// Default EtherNet/IP TCP port.
pub const ENIP_PORT: u16 = 0xAF12;

/// Encapsulation header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Sender context echoed by the target; the value is opaque to the
/// protocol, this one is just recognizable in captures.
pub const SENDER_CONTEXT: [u8; 8] = *b"AIRPLANE";

/// Encapsulation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EncapCommand {
    Nop = 0x0000,
    ListServices = 0x0004,
    ListInterfaces = 0x0064,
    RegisterSession = 0x0065,
    UnRegisterSession = 0x0066,
    SendRRData = 0x006F,
    SendUnitData = 0x0070,
}

impl EncapCommand {
    /// Command name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            EncapCommand::Nop => "Nop",
            EncapCommand::ListServices => "ListServices",
            EncapCommand::ListInterfaces => "ListInterfaces",
            EncapCommand::RegisterSession => "RegisterSession",
            EncapCommand::UnRegisterSession => "UnRegisterSession",
            EncapCommand::SendRRData => "SendRRData",
            EncapCommand::SendUnitData => "SendUnitData",
        }
    }
}

/// Text for an encapsulation status code.
pub fn status_text(status: u32) -> &'static str {
    match status {
        0x00 => "OK",
        0x01 => "invalid/unsupported command",
        0x02 => "no memory on target",
        0x03 => "malformed data in request",
        0x64 => "invalid session ID",
        0x65 => "invalid data length",
        0x69 => "unsupported protocol revision",
        _ => "<unknown>",
    }
}

/// Decoded encapsulation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapHeader {
    pub command: u16,
    /// Byte count following the header.
    pub length: u16,
    pub session: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    /// Builds a header frame for `command` with `length` payload bytes to
    /// follow; the payload is appended by the caller.
    pub fn encode(command: EncapCommand, length: u16, session: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + length as usize);
        put_u16(&mut buf, command as u16);
        put_u16(&mut buf, length);
        put_u32(&mut buf, session);
        put_u32(&mut buf, 0); // status
        buf.extend_from_slice(&SENDER_CONTEXT);
        put_u32(&mut buf, 0); // options
        buf
    }

    /// Decodes the first 24 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(buf);
        let command = r.read_u16()?;
        let length = r.read_u16()?;
        let session = r.read_u32()?;
        let status = r.read_u32()?;
        let mut context = [0u8; 8];
        context.copy_from_slice(r.take(8)?);
        let options = r.read_u32()?;
        Ok(EncapHeader {
            command,
            length,
            session,
            status,
            context,
            options,
        })
    }

    /// Verifies the command echo and a zero status.
    pub fn check(&self, expected: EncapCommand) -> Result<()> {
        if self.command != expected as u16 {
            return Err(EipError::Protocol(format!(
                "expected {} (0x{:04X}), got command 0x{:04X}",
                expected.name(),
                expected as u16,
                self.command
            )));
        }
        if self.status != 0 {
            return Err(EipError::Protocol(format!(
                "{} failed with status 0x{:02X} ({})",
                expected.name(),
                self.status,
                status_text(self.status)
            )));
        }
        Ok(())
    }
}

// =========================================================================
// RegisterSession
// =========================================================================

/// RegisterSession payload: protocol version 1, options 0. The response
/// echoes it; the granted session handle arrives in the response header.
pub fn register_session_payload(buf: &mut Vec<u8>) {
    put_u16(buf, 1); // protocol version
    put_u16(buf, 0); // option flags
}

/// Byte length of the RegisterSession payload.
pub const REGISTER_SESSION_LEN: u16 = 4;

// =========================================================================
// ListServices
// =========================================================================

/// Bit 5 of the service flags: target encapsulates CIP PDUs. Without it
/// the target is unusable for this driver.
pub const FLAG_CIP_PDU: u16 = 1 << 5;

/// One service entry of a ListServices reply.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub type_code: u16,
    pub length: u16,
    pub version: u16,
    pub flags: u16,
    pub name: String,
}

impl ServiceInfo {
    /// Whether this service supports CIP PDU encapsulation.
    pub fn supports_cip_pdu(&self) -> bool {
        self.flags & FLAG_CIP_PDU != 0
    }
}

/// Parses the payload of a ListServices reply: count, then per-service
/// `{type, length, version, flags, name[16]}` entries.
pub fn parse_list_services(payload: &[u8]) -> Result<Vec<ServiceInfo>> {
    let mut r = ByteReader::new(payload);
    let count = r.read_u16()?;
    let mut services = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_code = r.read_u16()?;
        let length = r.read_u16()?;
        let version = r.read_u16()?;
        let flags = r.read_u16()?;
        let raw_name = r.take(16)?;
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(16);
        services.push(ServiceInfo {
            type_code,
            length,
            version,
            flags,
            name: String::from_utf8_lossy(&raw_name[..end]).into_owned(),
        });
    }
    Ok(services)
}

// =========================================================================
// SendRRData
// =========================================================================

/// Byte length of the SendRRData preamble between the encapsulation header
/// and the enclosed MR frame.
pub const RR_DATA_PREAMBLE: usize = 16;

/// Unconnected data item type code.
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

/// Appends the SendRRData preamble for an unconnected request of
/// `inner_len` bytes: interface handle 0, timeout 0, two items (null
/// address, unconnected data).
pub fn push_rr_data_preamble(buf: &mut Vec<u8>, inner_len: u16) {
    put_u32(buf, 0); // interface handle
    put_u16(buf, 0); // timeout
    put_u16(buf, 2); // item count: address + data
    put_u16(buf, 0x0000); // address type: UCMM (null)
    put_u16(buf, 0); // address length
    put_u16(buf, ITEM_UNCONNECTED_DATA);
    put_u16(buf, inner_len);
}

/// Extracts the unconnected-data item from a SendRRData response payload,
/// scanning the item list for type 0x00B2.
pub fn parse_rr_data(payload: &[u8]) -> Result<&[u8]> {
    let mut r = ByteReader::new(payload);
    r.read_u32()?; // interface handle
    r.read_u16()?; // timeout
    let items = r.read_u16()?;
    for _ in 0..items {
        let item_type = r.read_u16()?;
        let item_len = r.read_u16()? as usize;
        let data = r.take(item_len)?;
        if item_type == ITEM_UNCONNECTED_DATA {
            return Ok(data);
        }
    }
    Err(EipError::Protocol(
        "SendRRData response carries no unconnected data item".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut frame = EncapHeader::encode(EncapCommand::SendRRData, 30, 0xDEAD_0001);
        assert_eq!(frame.len(), HEADER_SIZE);
        // fill in a fake status to exercise decode
        frame[8..12].copy_from_slice(&0x64u32.to_le_bytes());

        let header = EncapHeader::decode(&frame).unwrap();
        assert_eq!(header.command, 0x006F);
        assert_eq!(header.length, 30);
        assert_eq!(header.session, 0xDEAD_0001);
        assert_eq!(header.status, 0x64);
        assert_eq!(&header.context, b"AIRPLANE");
        assert_eq!(header.options, 0);

        assert!(header.check(EncapCommand::SendRRData).is_err()); // bad status
        assert!(EncapHeader::decode(&frame[..20]).is_err());
    }

    #[test]
    fn command_echo_is_checked() {
        let frame = EncapHeader::encode(EncapCommand::RegisterSession, 4, 0);
        let header = EncapHeader::decode(&frame).unwrap();
        assert!(header.check(EncapCommand::RegisterSession).is_ok());
        assert!(header.check(EncapCommand::ListServices).is_err());
    }

    #[test]
    fn register_session_payload_bytes() {
        let mut buf = Vec::new();
        register_session_payload(&mut buf);
        assert_eq!(buf, [0x01, 0x00, 0x00, 0x00]);
        assert_eq!(buf.len(), REGISTER_SESSION_LEN as usize);
    }

    #[test]
    fn list_services_reply() {
        let mut payload = Vec::new();
        put_u16(&mut payload, 1);
        put_u16(&mut payload, 0x0100); // type
        put_u16(&mut payload, 16); // length
        put_u16(&mut payload, 1); // version
        put_u16(&mut payload, FLAG_CIP_PDU); // flags
        payload.extend_from_slice(b"Communications\0\0");

        let services = parse_list_services(&payload).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "Communications");
        assert!(services[0].supports_cip_pdu());

        // clear bit 5 in the flags (low byte at offset 8)
        payload[8] = 0;
        let services = parse_list_services(&payload).unwrap();
        assert!(!services[0].supports_cip_pdu());
    }

    #[test]
    fn rr_data_preamble_bytes() {
        let mut buf = Vec::new();
        push_rr_data_preamble(&mut buf, 0x0012);
        assert_eq!(buf.len(), RR_DATA_PREAMBLE);
        assert_eq!(
            buf,
            [
                0, 0, 0, 0, // interface handle
                0, 0, // timeout
                2, 0, // item count
                0, 0, 0, 0, // null address item
                0xB2, 0x00, 0x12, 0x00, // unconnected data item
            ]
        );
    }

    #[test]
    fn rr_data_response_item_scan() {
        let mut payload = Vec::new();
        put_u32(&mut payload, 0);
        put_u16(&mut payload, 0);
        put_u16(&mut payload, 2);
        put_u16(&mut payload, 0x0000); // null address item
        put_u16(&mut payload, 0);
        put_u16(&mut payload, ITEM_UNCONNECTED_DATA);
        put_u16(&mut payload, 4);
        payload.extend_from_slice(&[0xCC, 0x00, 0x00, 0x00]);

        let inner = parse_rr_data(&payload).unwrap();
        assert_eq!(inner, [0xCC, 0x00, 0x00, 0x00]);

        // a response without the 0xB2 item is a protocol error
        let mut bad = Vec::new();
        put_u32(&mut bad, 0);
        put_u16(&mut bad, 0);
        put_u16(&mut bad, 1);
        put_u16(&mut bad, 0x0000);
        put_u16(&mut bad, 0);
        assert!(parse_rr_data(&bad).is_err());
    }
}
