//! Ledger store: addresses, UTXOs, STXOs, stored transactions and chain
//! metadata in a single SQLite file.
//!
//! Writes hold the connection lock exclusively; every compound mutation
//! (spend, apply, rollback, reset) runs inside one SQL transaction.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::core::hash::{Uint168, Uint256};
use crate::core::transaction::{OutPoint, Transaction};
use crate::error::{Error, Result};

/// Address type tags stored in the `Addrs` table.
pub mod addr_type {
    pub const STANDARD: u8 = 1;
    pub const MULTISIG: u8 = 2;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Addrs(
    ProgramHash BLOB NOT NULL PRIMARY KEY,
    Script BLOB NOT NULL,
    Type INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS UTXOs(
    OutPoint BLOB NOT NULL PRIMARY KEY,
    Value INTEGER NOT NULL,
    LockTime INTEGER NOT NULL,
    Address BLOB NOT NULL,
    Height INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS STXOs(
    OutPoint BLOB NOT NULL PRIMARY KEY,
    Value INTEGER NOT NULL,
    LockTime INTEGER NOT NULL,
    Address BLOB NOT NULL,
    Height INTEGER NOT NULL,
    SpendHash BLOB NOT NULL,
    SpendHeight INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS TXNs(
    Hash BLOB NOT NULL PRIMARY KEY,
    Height INTEGER NOT NULL,
    RawData BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS Info(
    Key TEXT NOT NULL PRIMARY KEY,
    Value BLOB NOT NULL
);
";

/// A watched address: program hash, redeem script and type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub program_hash: Uint168,
    pub script: Vec<u8>,
    pub addr_type: u8,
}

/// An unspent output owned by a watched address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub lock_time: u32,
    pub address: Uint168,
    pub height: u32,
}

impl Utxo {
    /// Spendable once the active tip has reached the lock height.
    pub fn is_mature(&self, chain_height: u32) -> bool {
        chain_height >= self.lock_time
    }
}

/// A spent output, retained so a rollback can resurrect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stxo {
    pub utxo: Utxo,
    pub spend_hash: Uint256,
    pub spend_height: u32,
}

/// A stored transaction. Height 0 means unconfirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTx {
    pub tx_id: Uint256,
    pub height: u32,
    pub data: Transaction,
}

impl StoreTx {
    pub fn new(tx: Transaction, height: u32) -> Self {
        Self {
            tx_id: tx.hash(),
            height,
            data: tx,
        }
    }
}

/// SQLite-backed ledger.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_conn(Connection::open(path)?)
    }

    /// In-memory ledger for tests.
    pub fn memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- addresses ---

    pub fn add_address(&self, addr: &Addr) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO Addrs(ProgramHash, Script, Type) VALUES(?1, ?2, ?3)",
            params![
                addr.program_hash.as_bytes().as_slice(),
                addr.script,
                addr.addr_type
            ],
        )?;
        Ok(())
    }

    pub fn get_address(&self, program_hash: &Uint168) -> Result<Addr> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT Script, Type FROM Addrs WHERE ProgramHash=?1",
                params![program_hash.as_bytes().as_slice()],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, u8>(1)?)),
            )
            .optional()?;
        match row {
            Some((script, addr_type)) => Ok(Addr {
                program_hash: *program_hash,
                script,
                addr_type,
            }),
            None => Err(Error::NotFound(format!("address {}", program_hash))),
        }
    }

    pub fn get_addresses(&self) -> Result<Vec<Addr>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT ProgramHash, Script, Type FROM Addrs")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, u8>(2)?,
            ))
        })?;
        let mut addrs = Vec::new();
        for row in rows {
            let (hash, script, addr_type) = row?;
            addrs.push(Addr {
                program_hash: Uint168::from_slice(&hash)?,
                script,
                addr_type,
            });
        }
        Ok(addrs)
    }

    /// Delete an address together with its UTXOs and STXOs.
    pub fn delete_address(&self, program_hash: &Uint168) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let hash = program_hash.as_bytes().as_slice();
        tx.execute("DELETE FROM UTXOs WHERE Address=?1", params![hash])?;
        tx.execute("DELETE FROM STXOs WHERE Address=?1", params![hash])?;
        tx.execute("DELETE FROM Addrs WHERE ProgramHash=?1", params![hash])?;
        tx.commit()?;
        Ok(())
    }

    // --- UTXOs / STXOs ---

    pub fn add_utxo(&self, utxo: &Utxo) -> Result<()> {
        insert_utxo(&self.lock(), utxo)
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Utxo> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT Value, LockTime, Address, Height FROM UTXOs WHERE OutPoint=?1",
                params![outpoint.to_key()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((value, lock_time, address, height)) => Ok(Utxo {
                outpoint: *outpoint,
                value: value as u64,
                lock_time,
                address: Uint168::from_slice(&address)?,
                height,
            }),
            None => Err(Error::NotFound(format!(
                "utxo {}:{}",
                outpoint.tx_id, outpoint.index
            ))),
        }
    }

    /// UTXOs of one address, or the whole wallet when `address` is `None`.
    pub fn get_utxos(&self, address: Option<&Uint168>) -> Result<Vec<Utxo>> {
        let conn = self.lock();
        let mut sql = "SELECT OutPoint, Value, LockTime, Address, Height FROM UTXOs".to_string();
        if address.is_some() {
            sql.push_str(" WHERE Address=?1");
        }
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, u32>(4)?,
            ))
        };
        let rows = match address {
            Some(hash) => stmt.query_map(params![hash.as_bytes().as_slice()], map_row)?,
            None => stmt.query_map([], map_row)?,
        };
        let mut utxos = Vec::new();
        for row in rows {
            let (key, value, lock_time, address, height) = row?;
            utxos.push(Utxo {
                outpoint: OutPoint::from_key(&key)
                    .map_err(|e| Error::Codec(e.to_string()))?,
                value: value as u64,
                lock_time,
                address: Uint168::from_slice(&address)?,
                height,
            });
        }
        Ok(utxos)
    }

    pub fn get_stxos(&self, address: Option<&Uint168>) -> Result<Vec<Stxo>> {
        let conn = self.lock();
        let mut sql = "SELECT OutPoint, Value, LockTime, Address, Height, SpendHash, SpendHeight \
                       FROM STXOs"
            .to_string();
        if address.is_some() {
            sql.push_str(" WHERE Address=?1");
        }
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, Vec<u8>>(5)?,
                row.get::<_, u32>(6)?,
            ))
        };
        let rows = match address {
            Some(hash) => stmt.query_map(params![hash.as_bytes().as_slice()], map_row)?,
            None => stmt.query_map([], map_row)?,
        };
        let mut stxos = Vec::new();
        for row in rows {
            let (key, value, lock_time, address, height, spend_hash, spend_height) = row?;
            stxos.push(Stxo {
                utxo: Utxo {
                    outpoint: OutPoint::from_key(&key)
                        .map_err(|e| Error::Codec(e.to_string()))?,
                    value: value as u64,
                    lock_time,
                    address: Uint168::from_slice(&address)?,
                    height,
                },
                spend_hash: Uint256::from_slice(&spend_hash)?,
                spend_height,
            });
        }
        Ok(stxos)
    }

    /// STXOs consumed by one spending transaction.
    pub fn get_stxos_spent_by(&self, spend_hash: &Uint256) -> Result<Vec<Stxo>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT OutPoint, Value, LockTime, Address, Height, SpendHash, SpendHeight \
             FROM STXOs WHERE SpendHash=?1",
        )?;
        let rows = stmt.query_map(params![spend_hash.as_bytes().as_slice()], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, u32>(6)?,
            ))
        })?;
        let mut stxos = Vec::new();
        for row in rows {
            let (key, value, lock_time, address, height, spend_height) = row?;
            stxos.push(Stxo {
                utxo: Utxo {
                    outpoint: OutPoint::from_key(&key)
                        .map_err(|e| Error::Codec(e.to_string()))?,
                    value: value as u64,
                    lock_time,
                    address: Uint168::from_slice(&address)?,
                    height,
                },
                spend_hash: *spend_hash,
                spend_height,
            });
        }
        Ok(stxos)
    }

    // --- stored transactions ---

    pub fn put_tx(&self, store_tx: &StoreTx) -> Result<()> {
        insert_tx(&self.lock(), store_tx)
    }

    pub fn get_tx(&self, tx_id: &Uint256) -> Result<StoreTx> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT Height, RawData FROM TXNs WHERE Hash=?1",
                params![tx_id.as_bytes().as_slice()],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        match row {
            Some((height, raw)) => {
                let data = Transaction::deserialize_unsigned(&mut raw.as_slice())
                    .map_err(|e| Error::Codec(format!("corrupt stored tx: {}", e)))?;
                Ok(StoreTx {
                    tx_id: *tx_id,
                    height,
                    data,
                })
            }
            None => Err(Error::NotFound(format!("transaction {}", tx_id))),
        }
    }

    pub fn get_txs_at(&self, height: u32) -> Result<Vec<StoreTx>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT Hash, Height, RawData FROM TXNs WHERE Height=?1")?;
        let rows = stmt.query_map(params![height], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        let mut txs = Vec::new();
        for row in rows {
            let (hash, height, raw) = row?;
            let data = Transaction::deserialize_unsigned(&mut raw.as_slice())
                .map_err(|e| Error::Codec(format!("corrupt stored tx: {}", e)))?;
            txs.push(StoreTx {
                tx_id: Uint256::from_slice(&hash)?,
                height,
                data,
            });
        }
        Ok(txs)
    }

    // --- chain metadata ---

    pub fn chain_height(&self) -> u32 {
        let conn = self.lock();
        conn.query_row(
            "SELECT Value FROM Info WHERE Key='ChainHeight'",
            [],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .ok()
        .flatten()
        .and_then(|bytes| bytes.try_into().ok().map(u32::from_be_bytes))
        .unwrap_or(0)
    }

    pub fn set_chain_height(&self, height: u32) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO Info(Key, Value) VALUES('ChainHeight', ?1)",
            params![height.to_be_bytes().as_slice()],
        )?;
        Ok(())
    }

    // --- block application and rollback ---

    /// Apply one transaction confirmed at `height`. Spends tracked UTXOs
    /// referenced by its inputs and creates UTXOs for outputs paying watched
    /// addresses. Returns whether the transaction touched the wallet.
    pub fn apply_tx(&self, tx: &Transaction, height: u32) -> Result<bool> {
        let tx_id = tx.hash();
        let mut conn = self.lock();
        let sql_tx = conn.transaction()?;
        let mut relevant = false;

        for input in &tx.inputs {
            if let Some(utxo) = select_utxo(&sql_tx, &input.previous)? {
                sql_tx.execute(
                    "DELETE FROM UTXOs WHERE OutPoint=?1",
                    params![input.previous.to_key()],
                )?;
                sql_tx.execute(
                    "INSERT OR REPLACE INTO STXOs(OutPoint, Value, LockTime, Address, Height, \
                     SpendHash, SpendHeight) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        utxo.outpoint.to_key(),
                        utxo.value as i64,
                        utxo.lock_time,
                        utxo.address.as_bytes().as_slice(),
                        utxo.height,
                        tx_id.as_bytes().as_slice(),
                        height
                    ],
                )?;
                relevant = true;
            }
        }

        for (index, output) in tx.outputs.iter().enumerate() {
            let watched: Option<Vec<u8>> = sql_tx
                .query_row(
                    "SELECT ProgramHash FROM Addrs WHERE ProgramHash=?1",
                    params![output.program_hash.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            if watched.is_some() {
                let utxo = Utxo {
                    outpoint: OutPoint::new(tx_id, index as u16),
                    value: output.value,
                    lock_time: output.output_lock,
                    address: output.program_hash,
                    height,
                };
                insert_utxo(&sql_tx, &utxo)?;
                relevant = true;
            }
        }

        if relevant {
            insert_tx(
                &sql_tx,
                &StoreTx {
                    tx_id,
                    height,
                    data: tx.clone(),
                },
            )?;
        }
        sql_tx.commit()?;
        Ok(relevant)
    }

    /// Revert one block: drop UTXOs created at `height`, resurrect STXOs
    /// spent at `height` and delete transactions stored at `height`.
    pub fn rollback(&self, height: u32) -> Result<()> {
        let mut conn = self.lock();
        let sql_tx = conn.transaction()?;
        sql_tx.execute("DELETE FROM UTXOs WHERE Height=?1", params![height])?;
        sql_tx.execute(
            "INSERT OR REPLACE INTO UTXOs(OutPoint, Value, LockTime, Address, Height) \
             SELECT OutPoint, Value, LockTime, Address, Height FROM STXOs WHERE SpendHeight=?1",
            params![height],
        )?;
        sql_tx.execute("DELETE FROM STXOs WHERE SpendHeight=?1", params![height])?;
        sql_tx.execute("DELETE FROM TXNs WHERE Height=?1", params![height])?;
        sql_tx.commit()?;
        Ok(())
    }

    /// Drop and recreate every table.
    pub fn reset(&self) -> Result<()> {
        let mut conn = self.lock();
        let sql_tx = conn.transaction()?;
        sql_tx.execute_batch(
            "DROP TABLE IF EXISTS Addrs;
             DROP TABLE IF EXISTS UTXOs;
             DROP TABLE IF EXISTS STXOs;
             DROP TABLE IF EXISTS TXNs;
             DROP TABLE IF EXISTS Info;",
        )?;
        sql_tx.execute_batch(SCHEMA)?;
        sql_tx.commit()?;
        Ok(())
    }
}

fn insert_utxo(conn: &Connection, utxo: &Utxo) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO UTXOs(OutPoint, Value, LockTime, Address, Height) \
         VALUES(?1, ?2, ?3, ?4, ?5)",
        params![
            utxo.outpoint.to_key(),
            utxo.value as i64,
            utxo.lock_time,
            utxo.address.as_bytes().as_slice(),
            utxo.height
        ],
    )?;
    Ok(())
}

fn insert_tx(conn: &Connection, store_tx: &StoreTx) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO TXNs(Hash, Height, RawData) VALUES(?1, ?2, ?3)",
        params![
            store_tx.tx_id.as_bytes().as_slice(),
            store_tx.height,
            store_tx.data.serialize_unsigned_bytes()
        ],
    )?;
    Ok(())
}

fn select_utxo(conn: &Connection, outpoint: &OutPoint) -> Result<Option<Utxo>> {
    let row = conn
        .query_row(
            "SELECT Value, LockTime, Address, Height FROM UTXOs WHERE OutPoint=?1",
            params![outpoint.to_key()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((value, lock_time, address, height)) => Ok(Some(Utxo {
            outpoint: *outpoint,
            value: value as u64,
            lock_time,
            address: Uint168::from_slice(&address)?,
            height,
        })),
        None => Ok(None),
    }
}
