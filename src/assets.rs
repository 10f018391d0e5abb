// deployment constants for the streaming session

/// UDP port carrying the media stream.
pub const MEDIA_PORT: u16 = 48000;
/// Auxiliary control-channel port paired with the media port.
pub const CONTROL_PORT: u16 = 47999;

/// Largest datagram the transport will carry; pooled receive buffers
/// are sized to this.
pub const MAX_PACKET_SIZE: usize = 1500;

// keepalive
pub const KEEPALIVE_PAYLOAD: [u8; 4] = *b"PING";
pub const KEEPALIVE_SSRC: u32 = 0x4543_484F;
