//! TCP transport session.
//!
//! One [`TcpSession`] owns one socket to one target and walks the
//! encapsulation state machine:
//!
//! ```text
//! Disconnected -> resolve + connect + ListServices + RegisterSession
//!              -> (identity probe, best effort)
//!              -> Connected
//!              -> UnRegisterSession + close -> Disconnected
//! ```
//!
//! All socket operations are bounded by the configured timeout. Frames are
//! length-prefixed by the encapsulation header; receives go through a
//! session-owned, grow-only contiguous buffer.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::cip::{
    self, make_get_attribute_single, push_read_data, push_write_data, read_data_size,
    unwrap_unconnected_send_response, wrap_unconnected_send, CipType, MrResponse,
    CLASS_IDENTITY, S_GET_ATTRIBUTE_SINGLE, S_READ_DATA, S_WRITE_DATA,
};
use crate::codec::{hexdump, ByteReader};
use crate::encap::{
    parse_list_services, parse_rr_data, push_rr_data_preamble, register_session_payload,
    EncapCommand, EncapHeader, HEADER_SIZE, REGISTER_SESSION_LEN,
};
use crate::error::{EipError, Result};
use crate::tag_path::TagPath;

/// Default socket timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default limit on one bundled transfer, request or response side.
/// Conservative; ControlLogix ENET modules choke well above this.
pub const DEFAULT_TRANSFER_BUFFER_LIMIT: usize = 500;

/// Splits an optional `:port` suffix off a host string, falling back to
/// `default_port`. Lets a PLC address name a non-standard port.
pub fn split_host_port(host: &str, default_port: u16) -> (&str, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name, port),
            Err(_) => (host, default_port),
        },
        None => (host, default_port),
    }
}

/// Identity record probed from the target after session setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub vendor: u16,
    pub device_type: u16,
    pub revision: u16,
    pub serial_number: u32,
    pub name: String,
}

/// Outcome of a standalone tag read, including the sizing information the
/// scan engine's discovery pass records.
#[derive(Debug, Clone)]
pub struct TagReadResult {
    /// Raw payload: abbreviated type, then value bytes.
    pub data: Vec<u8>,
    /// Byte size of the inner CIP ReadData request.
    pub request_size: usize,
    /// Byte size of the MR response.
    pub response_size: usize,
}

/// A registered EtherNet/IP session over TCP.
#[derive(Debug)]
pub struct TcpSession {
    stream: TcpStream,
    timeout: Duration,
    /// Session handle granted by RegisterSession; non-zero iff registered.
    session: u32,
    /// Backplane slot of the target processor.
    slot: u8,
    /// Grow-only receive buffer; contents survive growth.
    buffer: Vec<u8>,
    identity: Option<Identity>,
    transfer_buffer_limit: usize,
}

impl TcpSession {
    /// Resolves `host`, connects, and performs the ListServices /
    /// RegisterSession handshake followed by a best-effort identity probe.
    ///
    /// Resolution failure and connect failure are distinguished: the former
    /// never creates a socket. An identity-probe failure only logs a
    /// warning.
    pub async fn connect(host: &str, port: u16, slot: u8, millisec_timeout: Duration) -> Result<Self> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| EipError::Resolve(host.to_string()))?
            .next()
            .ok_or_else(|| EipError::Resolve(host.to_string()))?;

        let stream = match timeout(millisec_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(EipError::Connect(e)),
            Err(_) => return Err(EipError::ConnectTimeout(millisec_timeout)),
        };
        debug!(%addr, slot, "connected");

        let mut session = TcpSession {
            stream,
            timeout: millisec_timeout,
            session: 0,
            slot,
            buffer: Vec::new(),
            identity: None,
            transfer_buffer_limit: DEFAULT_TRANSFER_BUFFER_LIMIT,
        };

        session.list_services().await?;
        session.register_session().await?;
        if let Err(e) = session.probe_identity().await {
            // Ignored: some targets answer CIP data requests but not the
            // Identity object.
            warn!(host, "cannot determine target identity: {e}");
        }
        Ok(session)
    }

    /// The session handle granted by the target.
    pub fn session_handle(&self) -> u32 {
        self.session
    }

    /// Slot the Unconnected_Send port path routes to.
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Identity record, when the probe succeeded.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Limit applied to one bundled transfer in either direction.
    pub fn transfer_buffer_limit(&self) -> usize {
        self.transfer_buffer_limit
    }

    /// Overrides the transfer buffer limit.
    pub fn set_transfer_buffer_limit(&mut self, limit: usize) {
        self.transfer_buffer_limit = limit;
    }

    /// Configured socket timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends UnRegisterSession (no response expected) and closes.
    pub async fn shutdown(mut self) {
        if self.session != 0 {
            let frame = EncapHeader::encode(EncapCommand::UnRegisterSession, 0, self.session);
            if let Err(e) = self.send_frame(&frame).await {
                debug!("unregister session: {e}");
            }
        }
        debug!("session closed");
    }

    // ---------------------------------------------------------------------
    // Framed I/O
    // ---------------------------------------------------------------------

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        trace!("send {} bytes\n{}", frame.len(), hexdump(frame));
        match timeout(self.timeout, self.stream.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EipError::Transport(e)),
            Err(_) => Err(EipError::Timeout(self.timeout)),
        }
    }

    /// Grows the receive buffer to at least `requested` bytes, keeping
    /// existing contents.
    fn reserve_buffer(&mut self, requested: usize) {
        if self.buffer.len() < requested {
            self.buffer.resize(requested, 0);
        }
    }

    /// Reads one encapsulated frame into the receive buffer: header first,
    /// then `length` more bytes. Returns the total frame length. EOF or an
    /// I/O error aborts; partial data is discarded.
    async fn read_frame(&mut self) -> Result<usize> {
        self.reserve_buffer(HEADER_SIZE);
        match timeout(self.timeout, self.stream.read_exact(&mut self.buffer[..HEADER_SIZE])).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(EipError::Transport(e)),
            Err(_) => return Err(EipError::Timeout(self.timeout)),
        }
        let length = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
        let total = HEADER_SIZE + length;
        self.reserve_buffer(total);
        if length > 0 {
            match timeout(
                self.timeout,
                self.stream.read_exact(&mut self.buffer[HEADER_SIZE..total]),
            )
            .await
            {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(EipError::Transport(e)),
                Err(_) => return Err(EipError::Timeout(self.timeout)),
            }
        }
        trace!("received {} bytes\n{}", total, hexdump(&self.buffer[..total]));
        Ok(total)
    }

    /// Sends `payload` under `command` and reads the response frame.
    /// Returns the decoded response header and the total frame length.
    async fn transact(&mut self, command: EncapCommand, payload: &[u8]) -> Result<(EncapHeader, usize)> {
        let mut frame = EncapHeader::encode(command, payload.len() as u16, self.session);
        frame.extend_from_slice(payload);
        self.send_frame(&frame).await?;
        let total = self.read_frame().await?;
        let header = EncapHeader::decode(&self.buffer[..HEADER_SIZE])?;
        Ok((header, total))
    }

    // ---------------------------------------------------------------------
    // Handshake
    // ---------------------------------------------------------------------

    /// ListServices: the target must report CIP PDU encapsulation support,
    /// otherwise it is unusable and session setup fails.
    async fn list_services(&mut self) -> Result<()> {
        let (header, total) = self.transact(EncapCommand::ListServices, &[]).await?;
        header.check(EncapCommand::ListServices)?;
        let services = parse_list_services(&self.buffer[HEADER_SIZE..total])?;
        for service in &services {
            if !service.supports_cip_pdu() {
                return Err(EipError::Handshake(format!(
                    "service '{}' reports no CIP PDU encapsulation support",
                    service.name
                )));
            }
            debug!(
                "target service '{}', version {}, flags 0x{:04X}",
                service.name, service.version, service.flags
            );
        }
        Ok(())
    }

    /// RegisterSession: remembers the handle granted in the response
    /// header for every subsequent command.
    async fn register_session(&mut self) -> Result<()> {
        let mut payload = Vec::with_capacity(REGISTER_SESSION_LEN as usize);
        register_session_payload(&mut payload);
        let (header, _) = self.transact(EncapCommand::RegisterSession, &payload).await?;
        header
            .check(EncapCommand::RegisterSession)
            .map_err(|e| EipError::Handshake(e.to_string()))?;
        self.session = header.session;
        debug!("registered session 0x{:08X}", self.session);
        Ok(())
    }

    /// Probes the Identity object: vendor, device type, revision, serial
    /// number and the short-string product name.
    async fn probe_identity(&mut self) -> Result<()> {
        let vendor = self.get_attribute_single(CLASS_IDENTITY, 1, 1).await?;
        let device_type = self.get_attribute_single(CLASS_IDENTITY, 1, 2).await?;
        let revision = self.get_attribute_single(CLASS_IDENTITY, 1, 4).await?;
        let serial = self.get_attribute_single(CLASS_IDENTITY, 1, 6).await?;
        let name = self.get_attribute_single(CLASS_IDENTITY, 1, 7).await?;

        let mut identity = Identity {
            vendor: ByteReader::new(&vendor).read_u16()?,
            device_type: ByteReader::new(&device_type).read_u16()?,
            revision: ByteReader::new(&revision).read_u16()?,
            serial_number: ByteReader::new(&serial).read_u32()?,
            name: String::new(),
        };
        let mut r = ByteReader::new(&name);
        let len = r.read_u8()? as usize;
        identity.name = String::from_utf8_lossy(r.take(len)?).into_owned();
        debug!(
            "target identity: vendor 0x{:04X}, type 0x{:04X}, revision 0x{:04X}, serial 0x{:08X}, name '{}'",
            identity.vendor, identity.device_type, identity.revision,
            identity.serial_number, identity.name
        );
        self.identity = Some(identity);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Unconnected requests
    // ---------------------------------------------------------------------

    /// Sends one CIP frame inside SendRRData and returns the enclosed MR
    /// response.
    pub async fn send_rr_data(&mut self, cip: &[u8]) -> Result<&[u8]> {
        let mut payload = Vec::with_capacity(crate::encap::RR_DATA_PREAMBLE + cip.len());
        push_rr_data_preamble(&mut payload, cip.len() as u16);
        payload.extend_from_slice(cip);
        let (header, total) = self.transact(EncapCommand::SendRRData, &payload).await?;
        header.check(EncapCommand::SendRRData)?;
        parse_rr_data(&self.buffer[HEADER_SIZE..total])
    }

    /// Unconnected Get_Attribute_Single; returns the raw attribute value.
    pub async fn get_attribute_single(&mut self, class: u8, instance: u8, attribute: u8) -> Result<Vec<u8>> {
        let request = make_get_attribute_single(class, instance, attribute);
        let response = self.send_rr_data(&request).await?;
        let data = MrResponse::parse(response)?.check(S_GET_ATTRIBUTE_SINGLE)?;
        Ok(data.to_vec())
    }

    /// Reads one tag in a standalone Unconnected_Send-wrapped ReadData
    /// request, reporting the request/response sizes the scan engine's
    /// discovery pass caches.
    pub async fn read_tag(&mut self, tag: &TagPath, elements: u16) -> Result<TagReadResult> {
        let mut inner = Vec::with_capacity(read_data_size(tag));
        push_read_data(&mut inner, tag, elements);
        let request_size = inner.len();
        let wrapped = wrap_unconnected_send(&inner, self.slot);

        let raw = self.send_rr_data(&wrapped).await?;
        let response = unwrap_unconnected_send_response(raw)?;
        let response_size = response.len();
        let data = MrResponse::parse(response)?.check(S_READ_DATA)?;
        Ok(TagReadResult {
            data: data.to_vec(),
            request_size,
            response_size,
        })
    }

    /// Writes one tag in a standalone Unconnected_Send-wrapped WriteData
    /// request. `raw_data` is the wire-format value, without the type word.
    pub async fn write_tag(
        &mut self,
        tag: &TagPath,
        ty: CipType,
        elements: u16,
        raw_data: &[u8],
    ) -> Result<()> {
        let mut inner = Vec::with_capacity(cip::write_data_size(tag, raw_data.len()));
        push_write_data(&mut inner, tag, ty, elements, raw_data);
        let wrapped = wrap_unconnected_send(&inner, self.slot);

        let raw = self.send_rr_data(&wrapped).await?;
        let response = unwrap_unconnected_send_response(raw)?;
        MrResponse::parse(response)?.check(S_WRITE_DATA)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("plc5", 0xAF12), ("plc5", 0xAF12));
        assert_eq!(split_host_port("10.0.0.7:2222", 0xAF12), ("10.0.0.7", 2222));
        // a non-numeric suffix is part of the host name
        assert_eq!(split_host_port("rack:left", 0xAF12), ("rack:left", 0xAF12));
    }
}
