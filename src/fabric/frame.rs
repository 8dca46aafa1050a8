use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

// Constants
pub const PORT_HEADER_SIZE: usize = 4;
pub const ENVELOPE_HEADER_SIZE: usize = 8; // ip(4) + port(2) + len(2)
pub const MAX_UDP_PAYLOAD: usize = 65507;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Declared port {0} exceeds 65535")]
    PortOutOfRange(u32),

    #[error("Envelope payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Zero client address with non-zero port {0}")]
    ZeroAddressMismatch(u16),

    #[error("Non-zero client address {0} with zero port")]
    ZeroPortMismatch(Ipv4Addr),
}

/// Encode the port-selection header an agent writes immediately after
/// dialing the data-plane port.
pub fn encode_port_header(port: u16) -> [u8; PORT_HEADER_SIZE] {
    (port as u32).to_be_bytes()
}

/// Decode a port-selection header. The wire field is 4 bytes wide, so
/// values above 65535 are representable but invalid.
pub fn decode_port_header(bytes: [u8; PORT_HEADER_SIZE]) -> Result<u16, FrameError> {
    let raw = u32::from_be_bytes(bytes);
    u16::try_from(raw).map_err(|_| FrameError::PortOutOfRange(raw))
}

/// A single UDP datagram encapsulated for transport over a session.
///
/// Wire format, big-endian: client IPv4 (4 bytes), client UDP port
/// (2 bytes), payload length (2 bytes), payload. The all-zero address
/// form is reserved for agent-to-gateway control signalling; data
/// envelopes always carry the originating client address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEnvelope {
    client_ip: Ipv4Addr,
    client_port: u16,
    payload: Bytes,
}

impl UdpEnvelope {
    pub fn new(client: SocketAddrV4, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_UDP_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_UDP_PAYLOAD,
            });
        }
        if client.ip().is_unspecified() && client.port() != 0 {
            return Err(FrameError::ZeroAddressMismatch(client.port()));
        }
        if !client.ip().is_unspecified() && client.port() == 0 {
            return Err(FrameError::ZeroPortMismatch(*client.ip()));
        }
        Ok(Self {
            client_ip: *client.ip(),
            client_port: client.port(),
            payload,
        })
    }

    /// The reserved control form: address and port both zero.
    pub fn control(payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        Self::new(
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            payload,
        )
    }

    pub fn is_control(&self) -> bool {
        self.client_ip.is_unspecified() && self.client_port == 0
    }

    /// The client address, `None` for the control form.
    pub fn client(&self) -> Option<SocketAddrV4> {
        if self.is_control() {
            None
        } else {
            Some(SocketAddrV4::new(self.client_ip, self.client_port))
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn encoded_len(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.payload.len()
    }

    /// Encode into a single contiguous buffer so one `write_all` keeps
    /// the envelope atomic on the stream.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.client_ip.octets());
        buf.put_u16(self.client_port);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Incremental envelope decoder for a session's byte stream.
///
/// Envelopes may arrive concatenated or split across reads; `feed`
/// buffers raw bytes and `decode` yields as many complete envelopes as
/// are available. Any framing violation is fatal for the session.
pub struct EnvelopeCodec {
    buffer: BytesMut,
    max_payload: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_UDP_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + max_payload),
            max_payload,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode one envelope. `Ok(None)` means more bytes are
    /// needed; an error means the stream is corrupt and the session
    /// must be closed.
    pub fn decode(&mut self) -> Result<Option<UdpEnvelope>, FrameError> {
        if self.buffer.len() < ENVELOPE_HEADER_SIZE {
            return Ok(None);
        }

        // Validate the header before waiting for the payload so a
        // corrupt length field fails fast.
        let ip = Ipv4Addr::new(
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        );
        let port = u16::from_be_bytes([self.buffer[4], self.buffer[5]]);
        let len = u16::from_be_bytes([self.buffer[6], self.buffer[7]]) as usize;

        if len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.max_payload,
            });
        }
        if ip.is_unspecified() && port != 0 {
            return Err(FrameError::ZeroAddressMismatch(port));
        }
        if !ip.is_unspecified() && port == 0 {
            return Err(FrameError::ZeroPortMismatch(ip));
        }

        if self.buffer.len() < ENVELOPE_HEADER_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(ENVELOPE_HEADER_SIZE);
        let payload = self.buffer.split_to(len).freeze();

        Ok(Some(UdpEnvelope {
            client_ip: ip,
            client_port: port,
            payload,
        }))
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Quick structural check used by agents serving `both`-protocol
/// mappings: does this chunk begin with a plausible envelope header?
pub fn looks_like_envelope(chunk: &[u8]) -> bool {
    if chunk.len() < ENVELOPE_HEADER_SIZE {
        return false;
    }
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    let len = u16::from_be_bytes([chunk[6], chunk[7]]) as usize;

    if len > MAX_UDP_PAYLOAD {
        return false;
    }
    ip.is_unspecified() == (port == 0)
}
