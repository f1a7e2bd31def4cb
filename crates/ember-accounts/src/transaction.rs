//! Minimal transaction value type handed to signing wallets.
//!
//! Wire encoding belongs to the signing drivers and the transaction pool;
//! this type only carries the fields a signer needs to see.

use serde::{Deserialize, Serialize};

use crate::account::Address;

/// Secp256k1 signature values attached to a signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub v: u64,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// A transfer awaiting (or carrying) a signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas: u64,
    /// `None` creates a contract.
    pub to: Option<Address>,
    pub value: u128,
    pub data: Vec<u8>,
    pub signature: Option<Signature>,
}

impl Transaction {
    /// Copy of the transaction carrying the given signature.
    pub fn with_signature(&self, signature: Signature) -> Self {
        let mut tx = self.clone();
        tx.signature = Some(signature);
        tx
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_signature_leaves_original() {
        let tx = Transaction { nonce: 1, gas: 21_000, value: 5, ..Default::default() };
        let signed = tx.with_signature(Signature { v: 27, r: [1; 32], s: [2; 32] });

        assert!(!tx.is_signed());
        assert!(signed.is_signed());
        assert_eq!(signed.nonce, tx.nonce);
    }

    #[test]
    fn test_serde_round_trip() {
        let tx = Transaction {
            nonce: 9,
            gas_price: 1_000_000_000,
            gas: 21_000,
            to: Some(Address([0x42; 20])),
            value: 1_000,
            data: vec![0xde, 0xad],
            signature: None,
        };
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }
}
