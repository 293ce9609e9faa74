// Validator identity and its base58 string form.
//
// SAFETY INVARIANTS:
// 1. Encoding is canonical: equal keys always produce the same string
// 2. Decoding never panics; malformed input is a KeyDecode error

use crate::error::{CommitteeStateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A validator public key set: one payment key plus one mining key per
/// consensus scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitteePublicKey {
    pub incognito_pub_key: Vec<u8>,

    /// Scheme name -> key bytes
    pub mining_pub_key: BTreeMap<String, Vec<u8>>,
}

impl CommitteePublicKey {
    pub fn new(incognito_pub_key: Vec<u8>) -> Self {
        CommitteePublicKey {
            incognito_pub_key,
            mining_pub_key: BTreeMap::new(),
        }
    }

    pub fn with_mining_key(mut self, scheme: &str, key: Vec<u8>) -> Self {
        self.mining_pub_key.insert(scheme.to_string(), key);
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.incognito_pub_key.is_empty()
    }

    /// Base58 of the bincode encoding.
    pub fn to_base58(&self) -> Result<String> {
        let bytes =
            bincode::serialize(self).map_err(|e| CommitteeStateError::KeyDecode(e.to_string()))?;
        Ok(bs58::encode(bytes).into_string())
    }

    pub fn from_base58(encoded: &str) -> Result<Self> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| CommitteeStateError::KeyDecode(format!("{}: {}", encoded, e)))?;
        let key: CommitteePublicKey = bincode::deserialize(&bytes)
            .map_err(|e| CommitteeStateError::KeyDecode(format!("{}: {}", encoded, e)))?;
        if !key.is_valid() {
            return Err(CommitteeStateError::KeyDecode(format!(
                "{}: empty payment key",
                encoded
            )));
        }
        Ok(key)
    }
}

impl fmt::Display for CommitteePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.incognito_pub_key))
    }
}

pub fn keys_to_strings(keys: &[CommitteePublicKey]) -> Result<Vec<String>> {
    keys.iter().map(CommitteePublicKey::to_base58).collect()
}

pub fn strings_to_keys(keys: &[String]) -> Result<Vec<CommitteePublicKey>> {
    keys.iter().map(|k| CommitteePublicKey::from_base58(k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base58_round_trip_keeps_mining_keys() {
        let key = CommitteePublicKey::new(vec![1, 2, 3])
            .with_mining_key("bls", vec![9; 48])
            .with_mining_key("dsa", vec![7; 33]);
        let encoded = key.to_base58().unwrap();
        assert_eq!(CommitteePublicKey::from_base58(&encoded).unwrap(), key);
        assert_eq!(key.to_base58().unwrap(), encoded);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            CommitteePublicKey::from_base58("0OIl"),
            Err(CommitteeStateError::KeyDecode(_))
        ));
        let empty = CommitteePublicKey::default().to_base58().unwrap();
        assert!(CommitteePublicKey::from_base58(&empty).is_err());
    }

    #[test]
    fn test_display_is_hex_payment_key() {
        assert_eq!(CommitteePublicKey::new(vec![0xab, 0x01]).to_string(), "ab01");
    }
}
