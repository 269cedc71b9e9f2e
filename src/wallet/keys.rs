//! Keys, redeem scripts and signature arithmetic.
//!
//! A standard account's redeem script is `PUSH(pubkey) CHECKSIG`; an m-of-n
//! account's is `PUSH(m) PUSH(pk1)…PUSH(pkn) PUSH(n) CHECKMULTISIG` with the
//! public keys sorted. Signatures are 64-byte compact ECDSA, stored in a
//! program parameter as `0x40 ‖ signature` slots.

use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::core::hash::{sha256, Uint168, PREFIX_MULTISIG, PREFIX_STANDARD};
use crate::core::transaction::Program;
use crate::error::{Error, Result};

pub const OP_CHECKSIG: u8 = 0xAC;
pub const OP_CHECKMULTISIG: u8 = 0xAE;
const OP_PUSH_BASE: u8 = 0x50;
const PUBKEY_LEN: u8 = 33;

/// One signature slot in a program parameter: length byte plus signature.
pub const SIGNATURE_SLOT: usize = 65;

/// An ECDSA key pair on secp256k1.
#[derive(Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn from_private_key_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key).map_err(|_| Error::InvalidSignature)?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(|_| Error::InvalidSignature)?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed 33-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    /// Deterministically derive a child key from this one.
    pub fn derive_child(&self, index: u32) -> KeyPair {
        let mut counter = 0u32;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(self.secret_key.secret_bytes());
            hasher.update(index.to_le_bytes());
            hasher.update(counter.to_le_bytes());
            if let Ok(secret_key) = SecretKey::from_slice(&hasher.finalize()) {
                return KeyPair::from_secret_key(secret_key);
            }
            counter += 1;
        }
    }

    /// Sign a message (hashed with SHA-256 first). Returns the compact
    /// 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        let secp = Secp256k1::new();
        let message = Message::from_digest(sha256(data));
        secp.sign_ecdsa(&message, &self.secret_key)
            .serialize_compact()
    }

    /// The redeem script of this key's standard account.
    pub fn standard_code(&self) -> Vec<u8> {
        standard_code(&self.public_key_bytes())
    }

    /// Program hash of this key's standard account.
    pub fn program_hash(&self) -> Uint168 {
        Uint168::from_code(&self.standard_code(), PREFIX_STANDARD)
    }
}

/// Verify a compact signature over `data` against a 33-byte public key.
pub fn verify(public_key: &[u8; 33], data: &[u8], signature: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(sha256(data));
    let public_key = match PublicKey::from_slice(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match secp256k1::ecdsa::Signature::from_compact(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    secp.verify_ecdsa(&message, &signature, &public_key).is_ok()
}

/// Redeem script for a single public key.
pub fn standard_code(public_key: &[u8; 33]) -> Vec<u8> {
    let mut code = Vec::with_capacity(35);
    code.push(PUBKEY_LEN);
    code.extend_from_slice(public_key);
    code.push(OP_CHECKSIG);
    code
}

/// Redeem script for an m-of-n account. Public keys are sorted so every
/// signer derives the same script and program hash.
pub fn multisig_code(m: usize, public_keys: &[[u8; 33]]) -> Result<Vec<u8>> {
    let n = public_keys.len();
    if m == 0 || m > n || n > 16 {
        return Err(Error::Config(format!("invalid multisig {}-of-{}", m, n)));
    }
    let mut sorted = public_keys.to_vec();
    sorted.sort_unstable();

    let mut code = Vec::with_capacity(3 + n * 34);
    code.push(OP_PUSH_BASE + m as u8);
    for public_key in &sorted {
        code.push(PUBKEY_LEN);
        code.extend_from_slice(public_key);
    }
    code.push(OP_PUSH_BASE + n as u8);
    code.push(OP_CHECKMULTISIG);
    Ok(code)
}

/// Program hash for a redeem script, picking the prefix from its last
/// opcode.
pub fn code_to_program_hash(code: &[u8]) -> Result<Uint168> {
    match code.last() {
        Some(&OP_CHECKSIG) => Ok(Uint168::from_code(code, PREFIX_STANDARD)),
        Some(&OP_CHECKMULTISIG) => Ok(Uint168::from_code(code, PREFIX_MULTISIG)),
        _ => Err(Error::Config("unsupported redeem script".to_string())),
    }
}

/// Public keys pushed in a redeem script.
pub fn code_pubkeys(code: &[u8]) -> Vec<[u8; 33]> {
    let mut keys = Vec::new();
    let body = match code.last() {
        Some(&OP_CHECKSIG) => &code[..code.len() - 1],
        // Skip PUSH(m) at the front and PUSH(n) at the back.
        Some(&OP_CHECKMULTISIG) if code.len() >= 2 => &code[1..code.len() - 2],
        _ => return keys,
    };
    let mut cursor = 0;
    while cursor + 1 + PUBKEY_LEN as usize <= body.len() {
        if body[cursor] != PUBKEY_LEN {
            break;
        }
        let mut key = [0u8; 33];
        key.copy_from_slice(&body[cursor + 1..cursor + 34]);
        keys.push(key);
        cursor += 34;
    }
    keys
}

/// How many signatures a program has and how many its redeem script needs.
pub fn sign_status(program: &Program) -> Result<(usize, usize)> {
    let have = program.parameter.len() / SIGNATURE_SLOT;
    match program.code.last() {
        Some(&OP_CHECKSIG) => Ok((have, 1)),
        Some(&OP_CHECKMULTISIG) => {
            let m = program
                .code
                .first()
                .map(|&op| op.wrapping_sub(OP_PUSH_BASE))
                .filter(|&m| (1..=16).contains(&m))
                .ok_or_else(|| Error::Config("malformed multisig script".to_string()))?;
            Ok((have, m as usize))
        }
        _ => Err(Error::Config("unsupported redeem script".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let key = KeyPair::generate();
        let signature = key.sign(b"payload");
        assert!(verify(&key.public_key_bytes(), b"payload", &signature));
        assert!(!verify(&key.public_key_bytes(), b"other", &signature));
    }

    #[test]
    fn test_private_key_hex_round_trip() {
        let key = KeyPair::generate();
        let restored = KeyPair::from_private_key_hex(&key.private_key_hex()).unwrap();
        assert_eq!(key.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_child_derivation_is_deterministic() {
        let master = KeyPair::generate();
        let a = master.derive_child(4);
        let b = master.derive_child(4);
        let c = master.derive_child(5);
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert_ne!(a.public_key_bytes(), c.public_key_bytes());
    }

    #[test]
    fn test_standard_code_shape() {
        let key = KeyPair::generate();
        let code = key.standard_code();
        assert_eq!(code.len(), 35);
        assert_eq!(code[0], 33);
        assert_eq!(*code.last().unwrap(), OP_CHECKSIG);
        assert_eq!(code_pubkeys(&code), vec![key.public_key_bytes()]);
    }

    #[test]
    fn test_multisig_code_is_signer_order_independent() {
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let mut pubkeys: Vec<[u8; 33]> = keys.iter().map(|k| k.public_key_bytes()).collect();
        let code_a = multisig_code(2, &pubkeys).unwrap();
        pubkeys.reverse();
        let code_b = multisig_code(2, &pubkeys).unwrap();
        assert_eq!(code_a, code_b);
        assert_eq!(
            code_to_program_hash(&code_a).unwrap(),
            code_to_program_hash(&code_b).unwrap()
        );
        assert_eq!(code_pubkeys(&code_a).len(), 3);
    }

    #[test]
    fn test_multisig_code_rejects_bad_threshold() {
        let keys: Vec<[u8; 33]> = (0..2).map(|_| KeyPair::generate().public_key_bytes()).collect();
        assert!(multisig_code(0, &keys).is_err());
        assert!(multisig_code(3, &keys).is_err());
    }

    #[test]
    fn test_sign_status() {
        let key = KeyPair::generate();
        let mut program = Program {
            parameter: Vec::new(),
            code: key.standard_code(),
        };
        assert_eq!(sign_status(&program).unwrap(), (0, 1));
        program.parameter = vec![0u8; SIGNATURE_SLOT];
        assert_eq!(sign_status(&program).unwrap(), (1, 1));

        let pubkeys: Vec<[u8; 33]> = (0..3).map(|_| KeyPair::generate().public_key_bytes()).collect();
        let mut program = Program {
            parameter: vec![0u8; SIGNATURE_SLOT],
            code: multisig_code(2, &pubkeys).unwrap(),
        };
        assert_eq!(sign_status(&program).unwrap(), (1, 2));
        program.parameter.extend_from_slice(&[0u8; SIGNATURE_SLOT]);
        assert_eq!(sign_status(&program).unwrap(), (2, 2));
    }

    #[test]
    fn test_program_hash_prefixes() {
        let key = KeyPair::generate();
        assert_eq!(key.program_hash().prefix(), PREFIX_STANDARD);

        let pubkeys: Vec<[u8; 33]> = (0..3).map(|_| KeyPair::generate().public_key_bytes()).collect();
        let code = multisig_code(2, &pubkeys).unwrap();
        assert_eq!(
            code_to_program_hash(&code).unwrap().prefix(),
            PREFIX_MULTISIG
        );
    }
}
