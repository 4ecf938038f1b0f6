//! Wire framing for handshakes and data packets
//!
//! Handshake message: `u16_be(node_id_len) || node_id || payload`, carried on
//! a stream as `u32_be(length) || message`.
//!
//! Data packet: `b"PQC1" || u32_be(length) || ciphertext`.

use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Data packet magic
pub const PACKET_MAGIC: &[u8; 4] = b"PQC1";

/// Packet header: magic + length
pub const PACKET_HEADER_LEN: usize = 8;

/// Maximum stream frame size (64 KiB). ML-KEM-768 messages are under 2 KiB.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// One handshake message (init carries a public key, response a ciphertext)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub node_id: String,
    pub payload: Vec<u8>,
}

impl HandshakeMessage {
    pub fn new(node_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            node_id: node_id.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let id = self.node_id.as_bytes();
        let id_len = u16::try_from(id.len())
            .map_err(|_| Error::HandshakeFailed(format!("node id too long: {} bytes", id.len())))?;

        let mut buf = BytesMut::with_capacity(2 + id.len() + self.payload.len());
        buf.put_u16(id_len);
        buf.put_slice(id);
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::HandshakeFailed("message shorter than id length".into()));
        }
        let id_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let rest = &data[2..];
        if id_len == 0 || rest.len() < id_len {
            return Err(Error::HandshakeFailed(format!(
                "bad node id length {} for {} remaining bytes",
                id_len,
                rest.len()
            )));
        }

        let (id, payload) = rest.split_at(id_len);
        if payload.is_empty() {
            return Err(Error::HandshakeFailed("empty handshake payload".into()));
        }
        let node_id = std::str::from_utf8(id)
            .map_err(|_| Error::HandshakeFailed("node id is not UTF-8".into()))?
            .to_string();

        Ok(Self {
            node_id,
            payload: payload.to_vec(),
        })
    }
}

/// Frame an already-encrypted body as a data packet
pub fn encode_packet(ciphertext: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(ciphertext.len()).map_err(|_| Error::FrameTooLarge(ciphertext.len()))?;

    let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + ciphertext.len());
    buf.put_slice(PACKET_MAGIC);
    buf.put_u32(length);
    buf.put_slice(ciphertext);
    Ok(buf.to_vec())
}

/// Validate a packet header and return the ciphertext it declares
pub fn decode_packet(data: &[u8]) -> Result<&[u8]> {
    if data.len() < PACKET_MAGIC.len() || &data[..4] != PACKET_MAGIC {
        return Err(Error::InvalidMagic);
    }
    if data.len() < PACKET_HEADER_LEN {
        return Err(Error::TruncatedPacket {
            needed: PACKET_HEADER_LEN,
            available: data.len(),
        });
    }

    let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let body = &data[PACKET_HEADER_LEN..];
    if body.len() < length {
        return Err(Error::TruncatedPacket {
            needed: PACKET_HEADER_LEN + length,
            available: data.len(),
        });
    }
    Ok(&body[..length])
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
///
/// Uses exact reads so nothing past the frame is taken off the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
