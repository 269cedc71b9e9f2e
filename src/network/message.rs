//! Wire protocol messages and framing.
//!
//! Every frame starts with a 24-byte header: magic (u32 LE), a 12-byte
//! zero-padded command string, payload length (u32 LE) and the first four
//! bytes of the payload's double SHA-256. Any framing defect disconnects
//! the peer.

use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, Read, Write};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::hash::{sha256d, Uint256};
use crate::core::header::BlockHeader;
use crate::core::serialize::{
    read_hash, read_i64, read_u16, read_u32, read_u64, read_var_bytes, read_var_string,
    read_varint, write_hash, write_i64, write_u16, write_u32, write_u64, write_var_bytes,
    write_var_string, write_varint, Serializable,
};
use crate::core::transaction::Transaction;
use crate::error::Error;
use crate::spv::bloom::BloomFilter;
use crate::spv::merkle::MerkleProof;

/// Minimum protocol version this client will talk to.
pub const PROTOCOL_VERSION: u32 = 10001;

/// Service bit a peer must advertise to serve SPV clients.
pub const SERVICE_SPV: u64 = 1 << 0;

/// Frame header length: magic + command + length + checksum.
pub const HEADER_SIZE: usize = 24;

/// Maximum payload accepted from a peer.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Reject codes carried by `reject` messages.
pub mod reject_code {
    pub const MALFORMED: u8 = 0x01;
    pub const INVALID: u8 = 0x10;
    pub const OBSOLETE: u8 = 0x11;
    pub const DUPLICATE: u8 = 0x12;
    pub const NONSTANDARD: u8 = 0x40;
    pub const DUST: u8 = 0x41;
    pub const INSUFFICIENT_FEE: u8 = 0x42;
}

/// Inventory type tags for `inv`, `getdata` and `notfound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    Transaction,
    Block,
    FilteredBlock,
}

impl InvType {
    fn to_u32(self) -> u32 {
        match self {
            InvType::Transaction => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
        }
    }

    fn from_u32(value: u32) -> io::Result<Self> {
        match value {
            1 => Ok(InvType::Transaction),
            2 => Ok(InvType::Block),
            3 => Ok(InvType::FilteredBlock),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown inventory type {}", other),
            )),
        }
    }
}

/// `version` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMsg {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub port: u16,
    pub nonce: u64,
    pub height: u64,
    pub relay: u8,
}

impl Serializable for VersionMsg {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_u32(writer, self.version)?;
        write_u64(writer, self.services)?;
        write_i64(writer, self.timestamp)?;
        write_u16(writer, self.port)?;
        write_u64(writer, self.nonce)?;
        write_u64(writer, self.height)?;
        writer.write_all(&[self.relay])
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let version = read_u32(reader)?;
        let services = read_u64(reader)?;
        let timestamp = read_i64(reader)?;
        let port = read_u16(reader)?;
        let nonce = read_u64(reader)?;
        let height = read_u64(reader)?;
        let mut relay = [0u8; 1];
        reader.read_exact(&mut relay)?;
        Ok(Self {
            version,
            services,
            timestamp,
            port,
            nonce,
            height,
            relay: relay[0],
        })
    }
}

/// `merkleblock` payload: a header plus the partial merkle tree of the
/// transactions that passed the peer's filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMsg {
    pub header: BlockHeader,
    pub total_tx: u32,
    pub hashes: Vec<Uint256>,
    pub flags: Vec<u8>,
}

impl MerkleBlockMsg {
    /// The storable proof for this block.
    pub fn to_proof(&self) -> MerkleProof {
        MerkleProof {
            block_hash: self.header.hash(),
            height: self.header.height,
            total_tx: self.total_tx,
            hashes: self.hashes.clone(),
            flags: self.flags.clone(),
        }
    }
}

impl Serializable for MerkleBlockMsg {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.header.serialize(writer)?;
        write_u32(writer, self.total_tx)?;
        write_varint(writer, self.hashes.len() as u64)?;
        for hash in &self.hashes {
            write_hash(writer, hash)?;
        }
        write_var_bytes(writer, &self.flags)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let header = BlockHeader::deserialize(reader)?;
        let total_tx = read_u32(reader)?;
        let count = read_varint(reader)?;
        if count > total_tx as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "merkleblock hash count exceeds total",
            ));
        }
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            hashes.push(read_hash(reader)?);
        }
        let flags = read_var_bytes(reader)?;
        Ok(Self {
            header,
            total_tx,
            hashes,
            flags,
        })
    }
}

/// `reject` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMsg {
    pub command: String,
    pub code: u8,
    pub reason: String,
    pub data: Uint256,
}

impl RejectMsg {
    /// Whether this reject permanently fails a broadcast. A duplicate means
    /// the network already has the transaction.
    pub fn is_hard_failure(&self) -> bool {
        self.code != reject_code::DUPLICATE
    }
}

impl Serializable for RejectMsg {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_var_string(writer, &self.command)?;
        writer.write_all(&[self.code])?;
        write_var_string(writer, &self.reason)?;
        write_hash(writer, &self.data)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let command = read_var_string(reader)?;
        let mut code = [0u8; 1];
        reader.read_exact(&mut code)?;
        let reason = read_var_string(reader)?;
        let data = read_hash(reader)?;
        Ok(Self {
            command,
            code: code[0],
            reason,
            data,
        })
    }
}

/// All protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMsg),
    VerAck,
    GetAddr,
    Addr(Vec<String>),
    Ping { height: u64 },
    Pong { height: u64 },
    GetBlocks { locator: Vec<Uint256>, hash_stop: Uint256 },
    Inv { inv_type: InvType, hashes: Vec<Uint256> },
    GetData { inv_type: InvType, hashes: Vec<Uint256> },
    Tx(Transaction),
    MerkleBlock(MerkleBlockMsg),
    NotFound { inv_type: InvType, hashes: Vec<Uint256> },
    Reject(RejectMsg),
    FilterLoad(BloomFilter),
}

impl Message {
    /// Wire command string.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::GetAddr => "getaddr",
            Message::Addr(_) => "addr",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::GetBlocks { .. } => "getblocks",
            Message::Inv { .. } => "inv",
            Message::GetData { .. } => "getdata",
            Message::Tx(_) => "tx",
            Message::MerkleBlock(_) => "merkleblock",
            Message::NotFound { .. } => "notfound",
            Message::Reject(_) => "reject",
            Message::FilterLoad(_) => "filterload",
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_payload(&mut buf).expect("serialize to vec");
        buf
    }

    fn write_payload<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Message::Version(version) => version.serialize(writer),
            Message::VerAck | Message::GetAddr => Ok(()),
            Message::Addr(addrs) => {
                write_varint(writer, addrs.len() as u64)?;
                for addr in addrs {
                    write_var_string(writer, addr)?;
                }
                Ok(())
            }
            Message::Ping { height } => write_u64(writer, *height),
            Message::Pong { height } => write_u64(writer, *height),
            Message::GetBlocks { locator, hash_stop } => {
                write_varint(writer, locator.len() as u64)?;
                for hash in locator {
                    write_hash(writer, hash)?;
                }
                write_hash(writer, hash_stop)
            }
            Message::Inv { inv_type, hashes }
            | Message::GetData { inv_type, hashes }
            | Message::NotFound { inv_type, hashes } => {
                write_u32(writer, inv_type.to_u32())?;
                write_varint(writer, hashes.len() as u64)?;
                for hash in hashes {
                    write_hash(writer, hash)?;
                }
                Ok(())
            }
            Message::Tx(tx) => tx.serialize(writer),
            Message::MerkleBlock(block) => block.serialize(writer),
            Message::Reject(reject) => reject.serialize(writer),
            Message::FilterLoad(filter) => filter.serialize(writer),
        }
    }

    fn decode_payload(command: &str, payload: &[u8]) -> io::Result<Self> {
        let mut reader = io::Cursor::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMsg::deserialize(&mut reader)?),
            "verack" => Message::VerAck,
            "getaddr" => Message::GetAddr,
            "addr" => {
                let count = read_varint(&mut reader)?;
                if count > 1000 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "too many addresses",
                    ));
                }
                let mut addrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    addrs.push(read_var_string(&mut reader)?);
                }
                Message::Addr(addrs)
            }
            "ping" => Message::Ping {
                height: read_u64(&mut reader)?,
            },
            "pong" => Message::Pong {
                height: read_u64(&mut reader)?,
            },
            "getblocks" => {
                let count = read_varint(&mut reader)?;
                if count > 500 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "locator too long",
                    ));
                }
                let mut locator = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    locator.push(read_hash(&mut reader)?);
                }
                let hash_stop = read_hash(&mut reader)?;
                Message::GetBlocks { locator, hash_stop }
            }
            "inv" | "getdata" | "notfound" => {
                let inv_type = InvType::from_u32(read_u32(&mut reader)?)?;
                let count = read_varint(&mut reader)?;
                if count > 50_000 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "too many inventory entries",
                    ));
                }
                let mut hashes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    hashes.push(read_hash(&mut reader)?);
                }
                match command {
                    "inv" => Message::Inv { inv_type, hashes },
                    "getdata" => Message::GetData { inv_type, hashes },
                    _ => Message::NotFound { inv_type, hashes },
                }
            }
            "tx" => Message::Tx(Transaction::deserialize(&mut reader)?),
            "merkleblock" => Message::MerkleBlock(MerkleBlockMsg::deserialize(&mut reader)?),
            "reject" => Message::Reject(RejectMsg::deserialize(&mut reader)?),
            "filterload" => Message::FilterLoad(BloomFilter::deserialize(&mut reader)?),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown command {:?}", other),
                ))
            }
        };
        if reader.position() as usize != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes in payload",
            ));
        }
        Ok(message)
    }
}

/// Length-delimited frame codec carrying [`Message`]s.
pub struct FrameCodec {
    magic: u32,
}

impl FrameCodec {
    pub fn new(magic: u32) -> Self {
        Self { magic }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload();
        let checksum = sha256d(&payload);

        let mut command = [0u8; 12];
        command[..item.command().len()].copy_from_slice(item.command().as_bytes());

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32_le(self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum[..4]);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if magic != self.magic {
            return Err(Error::Codec(format!("bad magic {:#010x}", magic)));
        }

        let command_bytes = &src[4..16];
        let command_len = command_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(command_bytes.len());
        let command = std::str::from_utf8(&command_bytes[..command_len])
            .map_err(|_| Error::Codec("non-utf8 command".to_string()))?
            .to_string();

        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(Error::Codec(format!("payload length {} too large", length)));
        }

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&src[20..24]);

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length);

        if sha256d(&payload)[..4] != checksum {
            return Err(Error::Codec(format!("bad checksum for {:?}", command)));
        }

        Message::decode_payload(&command, &payload)
            .map(Some)
            .map_err(|e| Error::Codec(format!("{}: {}", command, e)))
    }
}
