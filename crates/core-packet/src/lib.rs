//! Wire packet codec and application payload helpers.
//!
//! Every message on the overlay is a fixed 14-byte header followed by an
//! opaque payload:
//!
//! ```text
//! +---------+----------+-------+-------+---------+---------+---------+
//! | version | msg_type | src   | dst   | seq     | ttl     | payload |
//! | u8      | u8       | u16   | u16   | u32     | u32     | var     |
//! +---------+----------+-------+-------+---------+---------+---------+
//! ```
//!
//! All integers are network byte order. The header stays in cleartext on the
//! wire; only the payload is encrypted hop by hop. Image payloads are
//! zlib-compressed end to end and split into 512-byte chunks, each carried in
//! one `msg_type = 2` packet with an ASCII `"<i>/<N>|"` metadata prefix.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Peer identity on the wire. Satellites take small IDs; ground stations are
/// offset by a fixed constant (see the mesh crate's config).
pub type PeerId = u16;

pub const HEADER_LEN: usize = 14;
pub const VERSION: u8 = 1;
pub const DEFAULT_TTL: u32 = 10;
pub const CHUNK_SIZE: usize = 512;

/// Errors from packet and chunk decoding.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("header too short: expected {HEADER_LEN} bytes, got {0}")]
    HeaderTooShort(usize),

    #[error("unknown message type: {0}")]
    UnknownMsgType(u8),

    #[error("bad chunk metadata: {0}")]
    BadChunkMeta(String),

    #[error("inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Data = 1,
    ImageChunk = 2,
    /// Reserved for future control traffic.
    Control = 3,
}

impl TryFrom<u8> for MsgType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MsgType::Data),
            2 => Ok(MsgType::ImageChunk),
            3 => Ok(MsgType::Control),
            other => Err(PacketError::UnknownMsgType(other)),
        }
    }
}

/// One overlay packet: header fields plus the (possibly encrypted) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub msg_type: MsgType,
    pub src: PeerId,
    pub dst: PeerId,
    pub seq: u32,
    pub ttl: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(msg_type: MsgType, src: PeerId, dst: PeerId, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            msg_type,
            src,
            dst,
            seq,
            ttl: DEFAULT_TTL,
            payload,
        }
    }

    /// Serialize header and payload for transmission.
    pub fn to_bytes(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        b.put_u8(self.version);
        b.put_u8(self.msg_type as u8);
        b.put_u16(self.src);
        b.put_u16(self.dst);
        b.put_u32(self.seq);
        b.put_u32(self.ttl);
        b.extend_from_slice(&self.payload);
        b.freeze()
    }

    /// Parse a packet from raw bytes. Anything shorter than the header is
    /// rejected; the payload is whatever follows and may be empty.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_LEN {
            return Err(PacketError::HeaderTooShort(data.len()));
        }
        let msg_type = MsgType::try_from(data[1])?;
        Ok(Self {
            version: data[0],
            msg_type,
            src: u16::from_be_bytes([data[2], data[3]]),
            dst: u16::from_be_bytes([data[4], data[5]]),
            seq: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
            ttl: u32::from_be_bytes([data[10], data[11], data[12], data[13]]),
            payload: data[HEADER_LEN..].to_vec(),
        })
    }

    /// Decrease TTL by one hop, saturating at zero. Returns the new value.
    pub fn decrement_ttl(&mut self) -> u32 {
        self.ttl = self.ttl.saturating_sub(1);
        self.ttl
    }
}

pub mod chunk {
    //! End-to-end image chunk payloads: `"<i>/<N>|"` prefix, then raw bytes.

    use super::{PacketError, CHUNK_SIZE};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkMeta {
        /// 1-based chunk index.
        pub index: u32,
        /// Total chunk count for the payload.
        pub total: u32,
    }

    /// Build one chunk payload with its metadata prefix.
    pub fn encode(index: u32, total: u32, data: &[u8]) -> Vec<u8> {
        let mut out = format!("{}/{}|", index, total).into_bytes();
        out.extend_from_slice(data);
        out
    }

    /// Split a metadata-prefixed payload into `(meta, chunk bytes)`.
    pub fn decode(payload: &[u8]) -> Result<(ChunkMeta, &[u8]), PacketError> {
        let bar = payload
            .iter()
            .position(|&b| b == b'|')
            .ok_or_else(|| PacketError::BadChunkMeta("missing '|' separator".into()))?;
        let meta = std::str::from_utf8(&payload[..bar])
            .map_err(|_| PacketError::BadChunkMeta("metadata is not UTF-8".into()))?;
        let (idx, total) = meta
            .split_once('/')
            .ok_or_else(|| PacketError::BadChunkMeta(format!("missing '/' in {meta:?}")))?;
        let index: u32 = idx
            .parse()
            .map_err(|_| PacketError::BadChunkMeta(format!("bad index {idx:?}")))?;
        let total: u32 = total
            .parse()
            .map_err(|_| PacketError::BadChunkMeta(format!("bad total {total:?}")))?;
        if index == 0 || total == 0 || index > total {
            return Err(PacketError::BadChunkMeta(format!(
                "index {index} out of range 1..={total}"
            )));
        }
        Ok((ChunkMeta { index, total }, &payload[bar + 1..]))
    }

    /// Split compressed data into ready-to-send chunk payloads of at most
    /// [`CHUNK_SIZE`] data bytes each. Empty input yields a single empty chunk
    /// so the receiver still observes a complete transfer.
    pub fn split(data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return vec![encode(1, 1, &[])];
        }
        let total = data.len().div_ceil(CHUNK_SIZE) as u32;
        data.chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(i, part)| encode(i as u32 + 1, total, part))
            .collect()
    }
}

pub mod zlib {
    //! zlib compression for image payloads (deflated end to end).

    use super::PacketError;
    use flate2::write::{ZlibDecoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    pub fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).expect("deflate into Vec");
        enc.finish().expect("deflate finish")
    }

    pub fn inflate(data: &[u8]) -> Result<Vec<u8>, PacketError> {
        let mut dec = ZlibDecoder::new(Vec::new());
        dec.write_all(data)?;
        Ok(dec.finish()?)
    }
}

pub mod image {
    //! Synthesized capture images. A capture produces a solid-color RGB PNG,
    //! standing in for camera hardware.

    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub const CAPTURE_WIDTH: u32 = 1024;
    pub const CAPTURE_HEIGHT: u32 = 1024;

    /// Encode a solid-color RGB PNG in memory.
    pub fn synthesize_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().expect("png header");
            let pixels: Vec<u8> = rgb
                .iter()
                .copied()
                .cycle()
                .take(width as usize * height as usize * 3)
                .collect();
            writer.write_image_data(&pixels).expect("png data");
        }
        out
    }

    /// Write a synthesized capture to `dir`, returning its path.
    pub fn capture(dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_secs();
        let path = dir.join(format!("astro_image_{unix}.png"));
        fs::write(&path, synthesize_png(CAPTURE_WIDTH, CAPTURE_HEIGHT, [0, 0, 255]))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_roundtrip_preserves_all_fields() {
        for (ty, payload) in [
            (MsgType::Data, b"hello".to_vec()),
            (MsgType::ImageChunk, vec![0u8; 600]),
            (MsgType::Control, Vec::new()),
        ] {
            let mut p = Packet::new(ty, 1, 2, 77, payload);
            p.ttl = 9;
            let bytes = p.to_bytes();
            assert_eq!(bytes.len(), HEADER_LEN + p.payload.len());
            let q = Packet::from_bytes(&bytes).expect("decode");
            assert_eq!(p, q);
        }
    }

    #[test]
    fn packet_header_too_short() {
        for len in 0..HEADER_LEN {
            let data = vec![1u8; len];
            assert!(matches!(
                Packet::from_bytes(&data),
                Err(PacketError::HeaderTooShort(l)) if l == len
            ));
        }
    }

    #[test]
    fn packet_rejects_unknown_msg_type() {
        let mut bytes = Packet::new(MsgType::Data, 1, 2, 0, vec![]).to_bytes().to_vec();
        bytes[1] = 9;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(PacketError::UnknownMsgType(9))
        ));
    }

    #[test]
    fn ttl_decrements_and_saturates() {
        let mut p = Packet::new(MsgType::Data, 1, 2, 0, vec![]);
        assert_eq!(p.ttl, DEFAULT_TTL);
        assert_eq!(p.decrement_ttl(), DEFAULT_TTL - 1);
        p.ttl = 0;
        assert_eq!(p.decrement_ttl(), 0);
    }

    #[test]
    fn chunk_metadata_roundtrip() {
        let payload = chunk::encode(3, 7, b"abc|def");
        let (meta, data) = chunk::decode(&payload).expect("decode");
        assert_eq!(meta, chunk::ChunkMeta { index: 3, total: 7 });
        // Only the first '|' separates metadata from data
        assert_eq!(data, b"abc|def");
    }

    #[test]
    fn chunk_decode_rejects_malformed_metadata() {
        assert!(chunk::decode(b"no separator at all").is_err());
        assert!(chunk::decode(b"12|payload").is_err()); // missing '/'
        assert!(chunk::decode(b"x/3|payload").is_err()); // bad index
        assert!(chunk::decode(b"1/y|payload").is_err()); // bad total
        assert!(chunk::decode(b"0/3|payload").is_err()); // 1-based indices
        assert!(chunk::decode(b"4/3|payload").is_err()); // index > total
        assert!(chunk::decode(&[0xff, 0xfe, b'|']).is_err()); // non-UTF-8 metadata
    }

    #[test]
    fn chunk_split_sizes() {
        // 1500 compressed bytes -> chunks of 512, 512, 476
        let data = vec![7u8; 1500];
        let chunks = chunk::split(&data);
        assert_eq!(chunks.len(), 3);
        let sizes: Vec<usize> = chunks
            .iter()
            .map(|c| chunk::decode(c).unwrap().1.len())
            .collect();
        assert_eq!(sizes, vec![512, 512, 476]);
        for (i, c) in chunks.iter().enumerate() {
            let (meta, _) = chunk::decode(c).unwrap();
            assert_eq!(meta.index, i as u32 + 1);
            assert_eq!(meta.total, 3);
        }
    }

    #[test]
    fn chunk_split_exact_multiple_and_empty() {
        assert_eq!(chunk::split(&vec![0u8; 1024]).len(), 2);
        let empty = chunk::split(&[]);
        assert_eq!(empty.len(), 1);
        let (meta, data) = chunk::decode(&empty[0]).unwrap();
        assert_eq!((meta.index, meta.total), (1, 1));
        assert!(data.is_empty());
    }

    #[test]
    fn zlib_roundtrip() {
        let original: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let packed = zlib::deflate(&original);
        assert!(packed.len() < original.len());
        assert_eq!(zlib::inflate(&packed).unwrap(), original);
    }

    #[test]
    fn zlib_inflate_rejects_garbage() {
        assert!(zlib::inflate(b"definitely not a zlib stream").is_err());
    }

    #[test]
    fn capture_writes_decodable_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = image::capture(dir.path()).expect("capture");
        assert!(path.extension().is_some_and(|e| e == "png"));

        let bytes = std::fs::read(&path).unwrap();
        let decoder = png::Decoder::new(std::io::Cursor::new(bytes));
        let reader = decoder.read_info().expect("valid png");
        let info = reader.info();
        assert_eq!(info.width, image::CAPTURE_WIDTH);
        assert_eq!(info.height, image::CAPTURE_HEIGHT);
    }
}
