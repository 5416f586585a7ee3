use std::fmt;

pub const MAX_PACKET_SIZE: usize = 4096;
pub const STREAMING_MTU: usize = 1730;

// Flag bits of the big-endian u16 flags word.
pub const FLAG_SYNCHRONIZE: u16 = 0x0001;
pub const FLAG_CLOSE: u16 = 0x0002;
pub const FLAG_RESET: u16 = 0x0004;
pub const FLAG_SIGNATURE_INCLUDED: u16 = 0x0008;
pub const FLAG_SIGNATURE_REQUESTED: u16 = 0x0010;
pub const FLAG_FROM_INCLUDED: u16 = 0x0020;
pub const FLAG_DELAY_REQUESTED: u16 = 0x0040;
pub const FLAG_MAX_PACKET_SIZE_INCLUDED: u16 = 0x0080;
pub const FLAG_PROFILE_INTERACTIVE: u16 = 0x0100;
pub const FLAG_ECHO: u16 = 0x0200;
pub const FLAG_NO_ACK: u16 = 0x0400;

#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    TooLarge { actual: usize },
    Truncated { needed: usize, actual: usize },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { actual } => {
                write!(f, "packet of {actual} bytes exceeds {MAX_PACKET_SIZE}")
            }
            Self::Truncated { needed, actual } => {
                write!(f, "truncated packet: needed {needed} bytes, got {actual}")
            }
        }
    }
}

impl std::error::Error for PacketError {}

/// One stream-layer packet in its wire form:
///
/// ```text
/// sendStreamId u32 | recvStreamId u32 | seqn u32 | ackThrough u32
/// | nackCount u8 | nacks u32 x count | resendDelay u8 | flags u16
/// | optionSize u16 | options | payload
/// ```
///
/// Owns a fixed 4 KiB buffer; `offset` tracks how far the application has
/// consumed the payload while the packet sits in a receive queue.
pub struct Packet {
    buf: [u8; MAX_PACKET_SIZE],
    len: usize,
    offset: usize,
    pub num_resend_attempts: u32,
}

impl Packet {
    /// Validate and copy a received or locally built packet. The header,
    /// NACK block and options must all lie within `len`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Box<Packet>, PacketError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge {
                actual: bytes.len(),
            });
        }
        let mut p = Box::new(Packet {
            buf: [0u8; MAX_PACKET_SIZE],
            len: bytes.len(),
            offset: 0,
            num_resend_attempts: 0,
        });
        p.buf[..bytes.len()].copy_from_slice(bytes);

        // 17 fixed bytes, the NACK block, then resendDelay + flags +
        // optionSize before the options themselves.
        let need = |n: usize| {
            if bytes.len() < n {
                Err(PacketError::Truncated {
                    needed: n,
                    actual: bytes.len(),
                })
            } else {
                Ok(())
            }
        };
        need(17)?;
        let nacks_end = 17 + p.nack_count() as usize * 4;
        need(nacks_end + 5)?;
        need(p.payload_offset())?;
        Ok(p)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn u32_at(&self, i: usize) -> u32 {
        u32::from_be_bytes(self.buf[i..i + 4].try_into().expect("in-bounds header"))
    }

    fn u16_at(&self, i: usize) -> u16 {
        u16::from_be_bytes(self.buf[i..i + 2].try_into().expect("in-bounds header"))
    }

    pub fn send_stream_id(&self) -> u32 {
        self.u32_at(0)
    }

    pub fn recv_stream_id(&self) -> u32 {
        self.u32_at(4)
    }

    pub fn seqn(&self) -> u32 {
        self.u32_at(8)
    }

    pub fn ack_through(&self) -> u32 {
        self.u32_at(12)
    }

    pub fn nack_count(&self) -> u8 {
        self.buf[16]
    }

    pub fn nack(&self, i: usize) -> u32 {
        self.u32_at(17 + i * 4)
    }

    pub fn resend_delay(&self) -> u8 {
        self.buf[17 + self.nack_count() as usize * 4]
    }

    fn option_offset(&self) -> usize {
        // resendDelay byte + flags word after the NACK block.
        17 + self.nack_count() as usize * 4 + 3
    }

    pub fn flags(&self) -> u16 {
        self.u16_at(self.option_offset() - 2)
    }

    pub fn option_size(&self) -> u16 {
        self.u16_at(self.option_offset())
    }

    /// Byte offset of the option data within the packet.
    pub fn option_data_offset(&self) -> usize {
        self.option_offset() + 2
    }

    pub fn option_data(&self) -> &[u8] {
        let start = self.option_data_offset();
        &self.buf[start..start + self.option_size() as usize]
    }

    pub fn payload_offset(&self) -> usize {
        self.option_data_offset() + self.option_size() as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..self.len]
    }

    pub fn is_syn(&self) -> bool {
        self.flags() & FLAG_SYNCHRONIZE != 0
    }

    pub fn is_no_ack(&self) -> bool {
        self.flags() & FLAG_NO_ACK != 0
    }

    /// Consumption cursor used while queued for the application.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        debug_assert!(offset <= self.len);
        self.offset = offset;
    }

    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.len);
    }

    /// Unconsumed bytes from the cursor to the end of the packet.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.offset..self.len]
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("send_stream_id", &self.send_stream_id())
            .field("recv_stream_id", &self.recv_stream_id())
            .field("seqn", &self.seqn())
            .field("flags", &format_args!("{:#06x}", self.flags()))
            .field("len", &self.len)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Linear packet writer used by the send paths. Fields are appended in
/// wire order; `patch_u32` backfills length-prefix style fixups and the
/// signature option is patched after signing.
pub struct PacketWriter {
    out: Vec<u8>,
}

impl PacketWriter {
    pub fn new(send_stream_id: u32, recv_stream_id: u32, seqn: u32, ack_through: u32) -> Self {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&send_stream_id.to_be_bytes());
        out.extend_from_slice(&recv_stream_id.to_be_bytes());
        out.extend_from_slice(&seqn.to_be_bytes());
        out.extend_from_slice(&ack_through.to_be_bytes());
        out.push(0); // NACK count
        out.push(0); // resend delay
        Self { out }
    }

    pub fn flags(&mut self, flags: u16) -> &mut Self {
        self.out.extend_from_slice(&flags.to_be_bytes());
        self
    }

    pub fn option_size(&mut self, size: u16) -> &mut Self {
        self.out.extend_from_slice(&size.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.out.extend_from_slice(b);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.out
    }

    pub fn patch(&mut self, at: usize, b: &[u8]) {
        self.out[at..at + b.len()].copy_from_slice(b);
    }

    pub fn build(self) -> Result<Box<Packet>, PacketError> {
        Packet::from_bytes(&self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xAABBCCDDu32.to_be_bytes()); // send stream id
        out.extend_from_slice(&0x11223344u32.to_be_bytes()); // recv stream id
        out.extend_from_slice(&7u32.to_be_bytes()); // seqn
        out.extend_from_slice(&5u32.to_be_bytes()); // ack through
        out.push(2); // nack count
        out.extend_from_slice(&3u32.to_be_bytes());
        out.extend_from_slice(&4u32.to_be_bytes());
        out.push(9); // resend delay
        out.extend_from_slice(&(FLAG_SYNCHRONIZE | FLAG_NO_ACK).to_be_bytes());
        out.extend_from_slice(&3u16.to_be_bytes()); // option size
        out.extend_from_slice(&[0xD0, 0xD1, 0xD2]);
        out.extend_from_slice(b"payload!");
        out
    }

    #[test]
    fn decode_reads_every_field() {
        let bytes = sample_packet();
        let p = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(p.send_stream_id(), 0xAABBCCDD);
        assert_eq!(p.recv_stream_id(), 0x11223344);
        assert_eq!(p.seqn(), 7);
        assert_eq!(p.ack_through(), 5);
        assert_eq!(p.nack_count(), 2);
        assert_eq!(p.nack(0), 3);
        assert_eq!(p.nack(1), 4);
        assert_eq!(p.resend_delay(), 9);
        assert_eq!(p.flags(), FLAG_SYNCHRONIZE | FLAG_NO_ACK);
        assert!(p.is_syn());
        assert!(p.is_no_ack());
        assert_eq!(p.option_data(), &[0xD0, 0xD1, 0xD2]);
        assert_eq!(p.payload(), b"payload!");
        // Encode-then-decode is the identity on the raw bytes.
        assert_eq!(p.bytes(), bytes.as_slice());
    }

    #[test]
    fn writer_round_trips_through_decoder() {
        let mut w = PacketWriter::new(1, 2, 3, 4);
        w.flags(FLAG_CLOSE).option_size(0).bytes(b"fin");
        let p = w.build().unwrap();
        assert_eq!(p.send_stream_id(), 1);
        assert_eq!(p.recv_stream_id(), 2);
        assert_eq!(p.seqn(), 3);
        assert_eq!(p.ack_through(), 4);
        assert_eq!(p.nack_count(), 0);
        assert_eq!(p.flags(), FLAG_CLOSE);
        assert_eq!(p.payload(), b"fin");
    }

    #[test]
    fn rejects_truncated_and_oversized() {
        assert!(matches!(
            Packet::from_bytes(&[0u8; 10]),
            Err(PacketError::Truncated { .. })
        ));
        // nack count of 200 pushes the header past the buffer end
        let mut bytes = sample_packet();
        bytes[16] = 200;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(PacketError::Truncated { .. })
        ));
        assert!(matches!(
            Packet::from_bytes(&vec![0u8; MAX_PACKET_SIZE + 1]),
            Err(PacketError::TooLarge { .. })
        ));
    }

    #[test]
    fn offset_tracks_consumption() {
        let bytes = sample_packet();
        let mut p = Packet::from_bytes(&bytes).unwrap();
        p.set_offset(p.payload_offset());
        assert_eq!(p.remaining(), b"payload!");
        p.advance(3);
        assert_eq!(p.remaining(), b"load!");
        p.advance(100);
        assert!(p.remaining().is_empty());
    }

    #[test]
    fn option_size_must_fit() {
        let mut bytes = sample_packet();
        // Option size far past the end of the packet.
        let option_size_at = 17 + 2 * 4 + 3;
        bytes[option_size_at..option_size_at + 2].copy_from_slice(&4000u16.to_be_bytes());
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(PacketError::Truncated { .. })
        ));
    }
}
