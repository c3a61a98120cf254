//! In-process signing of EIP-155 (replay-protected) legacy transactions.

use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("sign failed: {0}")]
    Sign(String),
    #[error("v overflow for chain id {0}")]
    ChainIdOverflow(u64),
}

/// Unsigned legacy transaction fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: u64,
    pub data: Vec<u8>,
}

/// A signed, RLP-encoded transaction ready for eth_sendRawTransaction.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Vec<u8>,
    pub hash: [u8; 32],
}

/// secp256k1 key that signs for a single sender address.
#[derive(Clone)]
pub struct TxSigner {
    key: SigningKey,
    address: [u8; 20],
}

impl std::fmt::Debug for TxSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxSigner")
            .field("address", &format!("0x{}", hex::encode(self.address)))
            .finish_non_exhaustive()
    }
}

impl TxSigner {
    pub fn from_bytes(secret: &[u8; 32]) -> Result<Self, SignerError> {
        let key = SigningKey::from_bytes(secret.into()).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let address = address_of(&key);
        Ok(Self { key, address })
    }

    /// Sender address: last 20 bytes of keccak256 of the uncompressed public key.
    pub fn address(&self) -> [u8; 20] {
        self.address
    }

    pub fn sign(&self, tx: &LegacyTx, chain_id: u64) -> Result<SignedTx, SignerError> {
        let unsigned = rlp_encode_unsigned_legacy(tx, chain_id);
        let (signature, recovery_id) = self
            .key
            .sign_digest_recoverable(Keccak256::new_with_prefix(unsigned))
            .map_err(|e| SignerError::Sign(e.to_string()))?;

        let v: u64 = chain_id
            .checked_mul(2)
            .and_then(|x| x.checked_add(35))
            .and_then(|x| x.checked_add(u64::from(recovery_id.to_byte())))
            .ok_or(SignerError::ChainIdOverflow(chain_id))?;

        let sig_bytes = signature.to_bytes();
        let (r, s) = sig_bytes.split_at(32);

        let mut signed = RlpStream::new();
        signed.begin_list(9);
        append_common(&mut signed, tx);
        signed.append(&v);
        signed.append(&trim_leading_zeros(r));
        signed.append(&trim_leading_zeros(s));
        let raw = signed.out().to_vec();
        let hash = Keccak256::digest(&raw).into();
        Ok(SignedTx { raw, hash })
    }
}

fn address_of(key: &SigningKey) -> [u8; 20] {
    let point = key.verifying_key().to_encoded_point(false);
    // skip the 0x04 uncompressed-point tag
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    out
}

fn append_common(s: &mut RlpStream, tx: &LegacyTx) {
    s.append(&tx.nonce);
    s.append(&tx.gas_price);
    s.append(&tx.gas_limit);
    let to_slice: &[u8] = &tx.to;
    s.append(&to_slice);
    s.append(&tx.value);
    let data_slice: &[u8] = &tx.data;
    s.append(&data_slice);
}

/// EIP-155 signing payload: [nonce, gas_price, gas_limit, to, value, data, chain_id, 0, 0].
fn rlp_encode_unsigned_legacy(tx: &LegacyTx, chain_id: u64) -> Vec<u8> {
    let mut s = RlpStream::new();
    s.begin_list(9);
    append_common(&mut s, tx);
    s.append(&chain_id);
    s.append(&0u8);
    s.append(&0u8);
    s.out().to_vec()
}

/// Trim leading zero bytes for RLP integer encoding. Zero becomes the empty slice (0x80).
fn trim_leading_zeros(b: &[u8]) -> &[u8] {
    let first = b.iter().position(|x| *x != 0).unwrap_or(b.len());
    &b[first..]
}
