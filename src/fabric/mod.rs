pub mod frame;
pub mod session;

pub use frame::{
    decode_port_header, encode_port_header, EnvelopeCodec, FrameError, UdpEnvelope,
    ENVELOPE_HEADER_SIZE, MAX_UDP_PAYLOAD, PORT_HEADER_SIZE,
};
pub use session::{
    Session, SessionIds, SessionState, SessionWriteQueue, SessionWriter, WriteError,
    DRAIN_TIMEOUT, WRITE_QUEUE_WATERMARK,
};
