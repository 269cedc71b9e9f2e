//! Transactions: outpoints, inputs, outputs and signature programs.
//!
//! The unsigned serialization (everything except the programs) is what gets
//! hashed and signed; the full serialization adds the signature programs.

use std::io::{self, Read, Write};

use crate::core::hash::{sha256d, Uint168, Uint256};
use crate::core::serialize::{
    read_u16, read_u32, read_u64, read_var_bytes, read_varint, write_u16, write_u32, write_u64,
    write_var_bytes, write_varint, Serializable,
};

/// Transaction type tags.
pub mod tx_type {
    pub const COIN_BASE: u8 = 0x00;
    pub const REGISTER_ASSET: u8 = 0x01;
    pub const TRANSFER_ASSET: u8 = 0x02;
    pub const RECORD: u8 = 0x03;
}

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OutPoint {
    pub tx_id: Uint256,
    pub index: u16,
}

impl OutPoint {
    pub fn new(tx_id: Uint256, index: u16) -> Self {
        Self { tx_id, index }
    }

    /// 34-byte key used by stores and the Bloom filter.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(34);
        key.extend_from_slice(self.tx_id.as_bytes());
        key.extend_from_slice(&self.index.to_le_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> io::Result<Self> {
        if key.len() != 34 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad outpoint key length",
            ));
        }
        let mut tx_id = [0u8; 32];
        tx_id.copy_from_slice(&key[..32]);
        Ok(Self {
            tx_id: Uint256::new(tx_id),
            index: u16::from_le_bytes([key[32], key[33]]),
        })
    }
}

impl Serializable for OutPoint {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.tx_id.as_bytes())?;
        write_u16(writer, self.index)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut tx_id = [0u8; 32];
        reader.read_exact(&mut tx_id)?;
        let index = read_u16(reader)?;
        Ok(Self {
            tx_id: Uint256::new(tx_id),
            index,
        })
    }
}

/// Transaction input: the outpoint being spent plus a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxInput {
    pub previous: OutPoint,
    pub sequence: u32,
}

impl Serializable for TxInput {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.previous.serialize(writer)?;
        write_u32(writer, self.sequence)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let previous = OutPoint::deserialize(reader)?;
        let sequence = read_u32(reader)?;
        Ok(Self { previous, sequence })
    }
}

/// Transaction output: value locked to a program hash, optionally
/// unspendable until `output_lock` height.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxOutput {
    pub value: u64,
    pub output_lock: u32,
    pub program_hash: Uint168,
}

impl Serializable for TxOutput {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_u64(writer, self.value)?;
        write_u32(writer, self.output_lock)?;
        writer.write_all(self.program_hash.as_bytes())
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let value = read_u64(reader)?;
        let output_lock = read_u32(reader)?;
        let mut hash = [0u8; 21];
        reader.read_exact(&mut hash)?;
        Ok(Self {
            value,
            output_lock,
            program_hash: Uint168::new(hash),
        })
    }
}

/// Free-form attribute attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attribute {
    pub usage: u8,
    pub data: Vec<u8>,
}

impl Serializable for Attribute {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[self.usage])?;
        write_var_bytes(writer, &self.data)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut usage = [0u8; 1];
        reader.read_exact(&mut usage)?;
        let data = read_var_bytes(reader)?;
        Ok(Self {
            usage: usage[0],
            data,
        })
    }
}

/// Signature program: the redeem script (`code`) and the collected
/// signatures (`parameter`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Program {
    pub parameter: Vec<u8>,
    pub code: Vec<u8>,
}

impl Serializable for Program {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_var_bytes(writer, &self.parameter)?;
        write_var_bytes(writer, &self.code)
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let parameter = read_var_bytes(reader)?;
        let code = read_var_bytes(reader)?;
        Ok(Self { parameter, code })
    }
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub tx_type: u8,
    pub payload_version: u8,
    pub attributes: Vec<Attribute>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    pub programs: Vec<Program>,
}

impl Transaction {
    /// Transaction hash: double SHA-256 of the unsigned serialization.
    pub fn hash(&self) -> Uint256 {
        Uint256::new(sha256d(&self.serialize_unsigned_bytes()))
    }

    /// Serialize everything except the signature programs.
    pub fn serialize_unsigned<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[self.tx_type, self.payload_version])?;
        write_varint(writer, self.attributes.len() as u64)?;
        for attribute in &self.attributes {
            attribute.serialize(writer)?;
        }
        write_varint(writer, self.inputs.len() as u64)?;
        for input in &self.inputs {
            input.serialize(writer)?;
        }
        write_varint(writer, self.outputs.len() as u64)?;
        for output in &self.outputs {
            output.serialize(writer)?;
        }
        write_u32(writer, self.lock_time)
    }

    pub fn serialize_unsigned_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_unsigned(&mut buf).expect("serialize to vec");
        buf
    }

    pub fn deserialize_unsigned<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head)?;
        let attribute_count = read_varint(reader)?;
        let mut attributes = Vec::with_capacity(attribute_count as usize);
        for _ in 0..attribute_count {
            attributes.push(Attribute::deserialize(reader)?);
        }
        let input_count = read_varint(reader)?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            inputs.push(TxInput::deserialize(reader)?);
        }
        let output_count = read_varint(reader)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            outputs.push(TxOutput::deserialize(reader)?);
        }
        let lock_time = read_u32(reader)?;
        Ok(Self {
            tx_type: head[0],
            payload_version: head[1],
            attributes,
            inputs,
            outputs,
            lock_time,
            programs: Vec::new(),
        })
    }

    /// Sum of all output values.
    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

impl Serializable for Transaction {
    fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.serialize_unsigned(writer)?;
        write_varint(writer, self.programs.len() as u64)?;
        for program in &self.programs {
            program.serialize(writer)?;
        }
        Ok(())
    }

    fn deserialize<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut tx = Self::deserialize_unsigned(reader)?;
        let program_count = read_varint(reader)?;
        let mut programs = Vec::with_capacity(program_count as usize);
        for _ in 0..program_count {
            programs.push(Program::deserialize(reader)?);
        }
        tx.programs = programs;
        Ok(tx)
    }
}

/// Builder for assembling transactions input by input.
pub struct TransactionBuilder {
    tx: Transaction,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            tx: Transaction {
                tx_type: tx_type::TRANSFER_ASSET,
                ..Default::default()
            },
        }
    }

    pub fn add_input(mut self, previous: OutPoint) -> Self {
        self.tx.inputs.push(TxInput {
            previous,
            sequence: 0,
        });
        self
    }

    pub fn add_output(mut self, program_hash: Uint168, value: u64, output_lock: u32) -> Self {
        self.tx.outputs.push(TxOutput {
            value,
            output_lock,
            program_hash,
        });
        self
    }

    pub fn lock_time(mut self, lock_time: u32) -> Self {
        self.tx.lock_time = lock_time;
        self
    }

    pub fn build(self) -> Transaction {
        self.tx
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::PREFIX_STANDARD;

    fn sample_tx() -> Transaction {
        let recipient = Uint168::from_code(&[0x21, 0xAC], PREFIX_STANDARD);
        TransactionBuilder::new()
            .add_input(OutPoint::new(Uint256::digest(b"funding"), 1))
            .add_output(recipient, 1000, 0)
            .add_output(recipient, 25, 400)
            .build()
    }

    #[test]
    fn test_round_trip() {
        let mut tx = sample_tx();
        tx.programs.push(Program {
            parameter: vec![0x40; 65],
            code: vec![0x21, 0xAC],
        });
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn test_hash_excludes_programs() {
        let unsigned = sample_tx();
        let mut signed = unsigned.clone();
        signed.programs.push(Program {
            parameter: vec![1, 2, 3],
            code: vec![4, 5, 6],
        });
        assert_eq!(unsigned.hash(), signed.hash());
    }

    #[test]
    fn test_hash_stable_across_round_trip() {
        let tx = sample_tx();
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(tx.hash(), decoded.hash());
    }

    #[test]
    fn test_outpoint_key_round_trip() {
        let outpoint = OutPoint::new(Uint256::digest(b"tx"), 7);
        let key = outpoint.to_key();
        assert_eq!(key.len(), 34);
        assert_eq!(OutPoint::from_key(&key).unwrap(), outpoint);
    }

    #[test]
    fn test_total_output() {
        assert_eq!(sample_tx().total_output(), 1025);
    }
}
