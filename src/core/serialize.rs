//! Binary serialization primitives for the wire protocol and disk records.
//!
//! Integers are little-endian. Variable-length integers use the compact
//! 1/3/5/9-byte scheme. Hashes are written as raw 32-byte values.

use std::io::{self, Read, Write};

use crate::core::hash::{Uint168, Uint256};

/// Types that can be written to and read back from a byte stream.
pub trait Serializable {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()>;
    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self>
    where
        Self: Sized;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing to a Vec cannot fail
        self.serialize(&mut buf).expect("serialize to vec");
        buf
    }

    fn from_bytes(data: &[u8]) -> io::Result<Self>
    where
        Self: Sized,
    {
        let mut cursor = io::Cursor::new(data);
        Self::deserialize(&mut cursor)
    }
}

/// Write a variable-length integer.
pub fn write_varint<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    match value {
        0..=0xfc => writer.write_all(&[value as u8]),
        0xfd..=0xffff => {
            writer.write_all(&[0xfd])?;
            writer.write_all(&(value as u16).to_le_bytes())
        }
        0x10000..=0xffffffff => {
            writer.write_all(&[0xfe])?;
            writer.write_all(&(value as u32).to_le_bytes())
        }
        _ => {
            writer.write_all(&[0xff])?;
            writer.write_all(&value.to_le_bytes())
        }
    }
}

/// Read a variable-length integer.
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let mut first = [0u8; 1];
    reader.read_exact(&mut first)?;
    match first[0] {
        0..=0xfc => Ok(first[0] as u64),
        0xfd => {
            let mut bytes = [0u8; 2];
            reader.read_exact(&mut bytes)?;
            Ok(u16::from_le_bytes(bytes) as u64)
        }
        0xfe => {
            let mut bytes = [0u8; 4];
            reader.read_exact(&mut bytes)?;
            Ok(u32::from_le_bytes(bytes) as u64)
        }
        0xff => {
            let mut bytes = [0u8; 8];
            reader.read_exact(&mut bytes)?;
            Ok(u64::from_le_bytes(bytes))
        }
    }
}

/// Write a byte slice with a varint length prefix.
pub fn write_var_bytes<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    write_varint(writer, data.len() as u64)?;
    writer.write_all(data)
}

/// Read a length-prefixed byte vector. The length is capped so a hostile
/// peer cannot make us allocate unbounded memory.
pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_varint(reader)? as usize;
    if len > MAX_VAR_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("var bytes length {} exceeds limit", len),
        ));
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok(data)
}

/// Upper bound on a single length-prefixed field.
pub const MAX_VAR_BYTES: usize = 8 * 1024 * 1024;

/// Write a length-prefixed UTF-8 string.
pub fn write_var_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    write_var_bytes(writer, value.as_bytes())
}

/// Read a length-prefixed UTF-8 string.
pub fn read_var_string<R: Read + ?Sized>(reader: &mut R) -> io::Result<String> {
    let bytes = read_var_bytes(reader)?;
    String::from_utf8(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 string"))
}

pub fn write_u16<W: Write>(writer: &mut W, value: u16) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub fn read_u16<R: Read + ?Sized>(reader: &mut R) -> io::Result<u16> {
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_i64<W: Write>(writer: &mut W, value: i64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub fn read_i64<R: Read + ?Sized>(reader: &mut R) -> io::Result<i64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

pub fn write_hash<W: Write>(writer: &mut W, hash: &Uint256) -> io::Result<()> {
    writer.write_all(hash.as_bytes())
}

pub fn read_hash<R: Read + ?Sized>(reader: &mut R) -> io::Result<Uint256> {
    let mut bytes = [0u8; 32];
    reader.read_exact(&mut bytes)?;
    Ok(Uint256::new(bytes))
}

pub fn write_program_hash<W: Write>(writer: &mut W, hash: &Uint168) -> io::Result<()> {
    writer.write_all(hash.as_bytes())
}

pub fn read_program_hash<R: Read + ?Sized>(reader: &mut R) -> io::Result<Uint168> {
    let mut bytes = [0u8; 21];
    reader.read_exact(&mut bytes)?;
    Ok(Uint168::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, 0xffffffff, 0x100000000] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            let decoded = read_varint(&mut Cursor::new(buf)).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_varint_widths() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0xfc).unwrap();
        assert_eq!(buf.len(), 1);

        buf.clear();
        write_varint(&mut buf, 0xfd).unwrap();
        assert_eq!(buf.len(), 3);

        buf.clear();
        write_varint(&mut buf, 0x10000).unwrap();
        assert_eq!(buf.len(), 5);

        buf.clear();
        write_varint(&mut buf, u64::MAX).unwrap();
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn test_var_bytes_round_trip() {
        let data = b"spv wallet";
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, data).unwrap();
        let decoded = read_var_bytes(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_var_bytes_length_limit() {
        let mut buf = Vec::new();
        write_varint(&mut buf, (MAX_VAR_BYTES + 1) as u64).unwrap();
        assert!(read_var_bytes(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, &[1, 2, 3, 4]).unwrap();
        buf.truncate(3);
        assert!(read_var_bytes(&mut Cursor::new(buf)).is_err());
    }
}
