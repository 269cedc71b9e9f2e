//! Wallet: accounts, coin selection, transaction building and signing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::hash::Uint168;
use crate::core::serialize::Serializable;
use crate::core::transaction::{Program, Transaction, TransactionBuilder};
use crate::error::{Error, Result};
use crate::storage::ledger::{addr_type, Addr};
use crate::storage::{ChainStore, Utxo};
use crate::wallet::keys::{
    code_pubkeys, code_to_program_hash, multisig_code, sign_status, verify, KeyPair,
    OP_CHECKMULTISIG, OP_CHECKSIG, SIGNATURE_SLOT,
};

/// A payment target: address and amount.
#[derive(Debug, Clone)]
pub struct Output {
    pub address: Uint168,
    pub amount: u64,
}

pub struct Wallet {
    store: Arc<ChainStore>,
    master: KeyPair,
}

impl Wallet {
    /// Open a wallet over the given store and register the master account.
    pub fn new(store: Arc<ChainStore>, master: KeyPair) -> Result<Self> {
        let wallet = Self { store, master };
        let code = wallet.master.standard_code();
        wallet.store.ledger().add_address(&Addr {
            program_hash: wallet.master.program_hash(),
            script: code,
            addr_type: addr_type::STANDARD,
        })?;
        Ok(wallet)
    }

    pub fn master_key(&self) -> &KeyPair {
        &self.master
    }

    /// Program hash of the master account.
    pub fn main_account(&self) -> Uint168 {
        self.master.program_hash()
    }

    /// Derive a child account and start watching it.
    pub fn derive_account(&self, index: u32) -> Result<(Uint168, KeyPair)> {
        let child = self.master.derive_child(index);
        let hash = child.program_hash();
        self.store.ledger().add_address(&Addr {
            program_hash: hash,
            script: child.standard_code(),
            addr_type: addr_type::STANDARD,
        })?;
        Ok((hash, child))
    }

    /// Register an m-of-n account by its public keys.
    pub fn register_multisig(&self, m: usize, public_keys: &[[u8; 33]]) -> Result<Uint168> {
        let code = multisig_code(m, public_keys)?;
        let hash = code_to_program_hash(&code)?;
        self.store.ledger().add_address(&Addr {
            program_hash: hash,
            script: code,
            addr_type: addr_type::MULTISIG,
        })?;
        Ok(hash)
    }

    /// Total value tracked for one address, or the whole wallet.
    pub fn balance(&self, address: Option<&Uint168>) -> Result<u64> {
        Ok(self
            .store
            .ledger()
            .get_utxos(address)?
            .iter()
            .map(|u| u.value)
            .sum())
    }

    /// Build an unsigned payment.
    pub fn create_transaction(
        &self,
        from: Option<Uint168>,
        to: Uint168,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction> {
        self.build(from, fee, None, &[Output { address: to, amount }])
    }

    /// Build a payment whose outputs stay locked until `lock_height`.
    pub fn create_locked_transaction(
        &self,
        from: Option<Uint168>,
        to: Uint168,
        amount: u64,
        fee: u64,
        lock_height: u32,
    ) -> Result<Transaction> {
        self.build(
            from,
            fee,
            Some(lock_height),
            &[Output { address: to, amount }],
        )
    }

    /// Build a payment with one output per entry.
    pub fn create_multi_output_transaction(
        &self,
        from: Option<Uint168>,
        fee: u64,
        outputs: &[Output],
        lock_height: Option<u32>,
    ) -> Result<Transaction> {
        self.build(from, fee, lock_height, outputs)
    }

    fn build(
        &self,
        from: Option<Uint168>,
        fee: u64,
        lock_height: Option<u32>,
        outputs: &[Output],
    ) -> Result<Transaction> {
        if outputs.is_empty() {
            return Err(Error::Config("transaction has no outputs".to_string()));
        }
        let amount: u64 = outputs.iter().map(|o| o.amount).sum();
        let target = amount + fee;

        let sources: Vec<Uint168> = match from {
            Some(address) => vec![address],
            None => self
                .store
                .ledger()
                .get_addresses()?
                .into_iter()
                .map(|a| a.program_hash)
                .collect(),
        };
        let change_address = sources.first().copied().unwrap_or(self.main_account());

        let (selected, total) = self.select_coins(&sources, target)?;

        let mut builder = TransactionBuilder::new();
        for utxo in &selected {
            builder = builder.add_input(utxo.outpoint);
        }
        for output in outputs {
            builder = builder.add_output(output.address, output.amount, lock_height.unwrap_or(0));
        }
        let change = total - target;
        if change > 0 {
            builder = builder.add_output(change_address, change, 0);
        }
        let mut tx = builder.build();

        // One signature program per distinct input owner.
        let mut seen = HashSet::new();
        for utxo in &selected {
            if seen.insert(utxo.address) {
                let addr = self.store.ledger().get_address(&utxo.address)?;
                tx.programs.push(Program {
                    parameter: Vec::new(),
                    code: addr.script,
                });
            }
        }
        Ok(tx)
    }

    /// Smallest-first coin selection over mature UTXOs of `sources`.
    fn select_coins(&self, sources: &[Uint168], target: u64) -> Result<(Vec<Utxo>, u64)> {
        let height = self.store.chain_height();
        let mut utxos = Vec::new();
        for source in sources {
            utxos.extend(
                self.store
                    .ledger()
                    .get_utxos(Some(source))?
                    .into_iter()
                    .filter(|u| u.is_mature(height)),
            );
        }
        // Value ascending; outpoint breaks ties so selection is
        // deterministic for a given UTXO set.
        utxos.sort_by(|a, b| {
            a.value
                .cmp(&b.value)
                .then_with(|| a.outpoint.to_key().cmp(&b.outpoint.to_key()))
        });

        let available: u64 = utxos.iter().map(|u| u.value).sum();
        if available < target {
            return Err(Error::InsufficientFunds {
                have: available,
                need: target,
            });
        }

        let mut selected = Vec::new();
        let mut total = 0u64;
        for utxo in utxos {
            total += utxo.value;
            selected.push(utxo);
            if total >= target {
                break;
            }
        }
        Ok((selected, total))
    }

    /// Add this wallet's signatures where the master key can sign.
    pub fn sign(&self, tx: &mut Transaction) -> Result<()> {
        sign_with(tx, &self.master)
    }

    /// Overall signature status: the least-signed program governs.
    pub fn transaction_status(tx: &Transaction) -> Result<(usize, usize)> {
        transaction_sign_status(tx)
    }
}

/// Sign every program of `tx` the key is entitled to sign.
pub fn sign_with(tx: &mut Transaction, key: &KeyPair) -> Result<()> {
    let data = tx.serialize_unsigned_bytes();
    let signature = key.sign(&data);
    let public_key = key.public_key_bytes();
    let mut signed_any = false;

    for program in &mut tx.programs {
        match program.code.last() {
            Some(&OP_CHECKSIG) => {
                if code_pubkeys(&program.code).first() != Some(&public_key) {
                    continue;
                }
                if !program.parameter.is_empty() {
                    return Err(Error::AlreadyExists("input already signed".to_string()));
                }
                program.parameter.push(SIGNATURE_SLOT as u8 - 1);
                program.parameter.extend_from_slice(&signature);
                signed_any = true;
            }
            Some(&OP_CHECKMULTISIG) => {
                if !code_pubkeys(&program.code).contains(&public_key) {
                    continue;
                }
                let (have, need) = sign_status(program)?;
                if have >= need {
                    return Err(Error::AlreadyExists(
                        "transaction is fully signed".to_string(),
                    ));
                }
                for slot in program.parameter.chunks(SIGNATURE_SLOT) {
                    if slot.len() == SIGNATURE_SLOT && verify(&public_key, &data, &slot[1..]) {
                        return Err(Error::AlreadyExists(
                            "this key already signed".to_string(),
                        ));
                    }
                }
                program.parameter.push(SIGNATURE_SLOT as u8 - 1);
                program.parameter.extend_from_slice(&signature);
                signed_any = true;
            }
            _ => continue,
        }
    }

    if signed_any {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

/// Signature status across all programs: the first incomplete program's
/// counts, or the first program's when everything is signed.
pub fn transaction_sign_status(tx: &Transaction) -> Result<(usize, usize)> {
    let mut first = None;
    for program in &tx.programs {
        let status = sign_status(program)?;
        if first.is_none() {
            first = Some(status);
        }
        if status.0 < status.1 {
            return Ok(status);
        }
    }
    first.ok_or_else(|| Error::Config("transaction has no programs".to_string()))
}

/// Whether every program carries enough signatures.
pub fn is_ready_to_send(tx: &Transaction) -> bool {
    matches!(transaction_sign_status(tx), Ok((have, need)) if have >= need)
}

/// Write a transaction as ASCII hex. The file name reflects its signature
/// status: `to_be_signed_<have>_of_<need>.txn` or `ready_to_send.txn`.
pub fn save_to_file<P: AsRef<Path>>(tx: &Transaction, dir: P) -> Result<PathBuf> {
    let (have, need) = transaction_sign_status(tx)?;
    let name = if have >= need {
        "ready_to_send.txn".to_string()
    } else {
        format!("to_be_signed_{}_of_{}.txn", have, need)
    };
    let path = dir.as_ref().join(name);
    std::fs::write(&path, hex::encode(tx.to_bytes()))?;
    log::info!(
        "[{}/{}] transaction written to {}",
        have,
        need,
        path.display()
    );
    Ok(path)
}

/// Read a transaction from an ASCII hex file.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Transaction> {
    let content = std::fs::read_to_string(path)?;
    let raw = hex::decode(content.trim())
        .map_err(|e| Error::Codec(format!("invalid transaction hex: {}", e)))?;
    Transaction::from_bytes(&raw).map_err(|e| Error::Codec(format!("invalid transaction: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::{Uint256, PREFIX_STANDARD};
    use crate::core::transaction::OutPoint;

    fn wallet() -> (Wallet, Arc<ChainStore>) {
        let store = Arc::new(ChainStore::memory().unwrap());
        let wallet = Wallet::new(store.clone(), KeyPair::generate()).unwrap();
        (wallet, store)
    }

    fn fund(store: &ChainStore, address: Uint168, values: &[u64]) {
        for (i, &value) in values.iter().enumerate() {
            store
                .ledger()
                .add_utxo(&Utxo {
                    outpoint: OutPoint::new(Uint256::digest(&(i as u32).to_le_bytes()), i as u16),
                    value,
                    lock_time: 0,
                    address,
                    height: 1,
                })
                .unwrap();
        }
    }

    fn other_address() -> Uint168 {
        Uint168::from_code(&[0x21, 0xAC], PREFIX_STANDARD)
    }

    #[test]
    fn test_create_transaction_with_change() {
        let (wallet, store) = wallet();
        let main = wallet.main_account();
        fund(&store, main, &[5, 20, 3]);

        let tx = wallet
            .create_transaction(None, other_address(), 6, 1)
            .unwrap();

        // Smallest-first: 3 + 5 = 8 >= 7
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, 6);
        assert_eq!(tx.outputs[0].program_hash, other_address());
        assert_eq!(tx.outputs[1].value, 1);
        assert_eq!(tx.outputs[1].program_hash, main);
        assert_eq!(tx.programs.len(), 1);
    }

    #[test]
    fn test_change_omitted_when_exact() {
        let (wallet, store) = wallet();
        fund(&store, wallet.main_account(), &[4, 3]);

        let tx = wallet
            .create_transaction(None, other_address(), 5, 2)
            .unwrap();
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.total_output(), 5);
    }

    #[test]
    fn test_insufficient_funds() {
        let (wallet, store) = wallet();
        let dir = tempfile::tempdir().unwrap();
        fund(&store, wallet.main_account(), &[5]);

        let err = wallet
            .create_transaction(None, other_address(), 4, 2)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds { have: 5, need: 6 }
        ));
        // Nothing was written
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_immature_utxos_are_skipped() {
        let (wallet, store) = wallet();
        let main = wallet.main_account();
        store.ledger().set_chain_height(10).unwrap();
        store
            .ledger()
            .add_utxo(&Utxo {
                outpoint: OutPoint::new(Uint256::digest(b"locked"), 0),
                value: 50,
                lock_time: 100,
                address: main,
                height: 1,
            })
            .unwrap();
        fund(&store, main, &[5]);

        let err = wallet
            .create_transaction(None, other_address(), 10, 1)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { have: 5, .. }));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let (wallet, store) = wallet();
        fund(&store, wallet.main_account(), &[9, 2, 7, 2, 1]);

        let a = wallet
            .create_transaction(None, other_address(), 4, 0)
            .unwrap();
        let b = wallet
            .create_transaction(None, other_address(), 4, 0)
            .unwrap();
        assert_eq!(a.inputs, b.inputs);
        // 1 + 2 + 2 = 5 >= 4 picked smallest-first
        assert_eq!(a.inputs.len(), 3);
    }

    #[test]
    fn test_locked_transaction_sets_output_lock() {
        let (wallet, store) = wallet();
        fund(&store, wallet.main_account(), &[10]);

        let tx = wallet
            .create_locked_transaction(None, other_address(), 5, 1, 400)
            .unwrap();
        assert_eq!(tx.outputs[0].output_lock, 400);
        // Change stays spendable
        assert_eq!(tx.outputs[1].output_lock, 0);
    }

    #[test]
    fn test_multi_output_translates_entries() {
        let (wallet, store) = wallet();
        fund(&store, wallet.main_account(), &[50]);

        let outputs = vec![
            Output {
                address: other_address(),
                amount: 10,
            },
            Output {
                address: other_address(),
                amount: 15,
            },
        ];
        let tx = wallet
            .create_multi_output_transaction(None, 1, &outputs, None)
            .unwrap();
        assert_eq!(tx.outputs.len(), 3);
        assert_eq!(tx.outputs[0].value, 10);
        assert_eq!(tx.outputs[1].value, 15);
        assert_eq!(tx.outputs[2].value, 24);
    }

    #[test]
    fn test_sign_standard_transaction() {
        let (wallet, store) = wallet();
        fund(&store, wallet.main_account(), &[10]);

        let mut tx = wallet
            .create_transaction(None, other_address(), 5, 1)
            .unwrap();
        wallet.sign(&mut tx).unwrap();

        assert!(is_ready_to_send(&tx));
        assert_eq!(Wallet::transaction_status(&tx).unwrap(), (1, 1));
        // Signing twice is refused
        assert!(matches!(
            wallet.sign(&mut tx),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_partial_multisig_signing_flow() {
        let dir = tempfile::tempdir().unwrap();
        let (wallet, store) = wallet();
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let pubkeys: Vec<[u8; 33]> = keys.iter().map(|k| k.public_key_bytes()).collect();

        let shared = wallet.register_multisig(2, &pubkeys).unwrap();
        fund(&store, shared, &[100]);

        let tx = wallet
            .create_transaction(Some(shared), other_address(), 30, 1)
            .unwrap();
        assert_eq!(Wallet::transaction_status(&tx).unwrap(), (0, 2));

        // First signer
        let mut tx = tx;
        sign_with(&mut tx, &keys[0]).unwrap();
        let path = save_to_file(&tx, dir.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "to_be_signed_1_of_2.txn"
        );

        // Second signer picks the file up
        let mut tx = load_from_file(&path).unwrap();
        assert_eq!(Wallet::transaction_status(&tx).unwrap(), (1, 2));
        sign_with(&mut tx, &keys[1]).unwrap();
        let path = save_to_file(&tx, dir.path()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "ready_to_send.txn"
        );
        assert_eq!(Wallet::transaction_status(&tx).unwrap(), (2, 2));
        assert!(is_ready_to_send(&tx));
    }

    #[test]
    fn test_duplicate_multisig_signer_rejected() {
        let (wallet, store) = wallet();
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let pubkeys: Vec<[u8; 33]> = keys.iter().map(|k| k.public_key_bytes()).collect();
        let shared = wallet.register_multisig(2, &pubkeys).unwrap();
        fund(&store, shared, &[100]);

        let mut tx = wallet
            .create_transaction(Some(shared), other_address(), 30, 1)
            .unwrap();
        sign_with(&mut tx, &keys[0]).unwrap();
        assert!(matches!(
            sign_with(&mut tx, &keys[0]),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_unrelated_key_cannot_sign() {
        let (wallet, store) = wallet();
        fund(&store, wallet.main_account(), &[10]);

        let mut tx = wallet
            .create_transaction(None, other_address(), 5, 1)
            .unwrap();
        let stranger = KeyPair::generate();
        assert!(matches!(
            sign_with(&mut tx, &stranger),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_file_round_trip_preserves_signatures() {
        let dir = tempfile::tempdir().unwrap();
        let (wallet, store) = wallet();
        fund(&store, wallet.main_account(), &[10]);

        let mut tx = wallet
            .create_transaction(None, other_address(), 5, 1)
            .unwrap();
        wallet.sign(&mut tx).unwrap();
        let path = save_to_file(&tx, dir.path()).unwrap();
        let loaded = load_from_file(&path).unwrap();
        assert_eq!(tx, loaded);
        assert_eq!(tx.hash(), loaded.hash());
    }
}
