//! Payload sealing for the shard-to-shard wire.
//!
//! Each internal lookup request/response travels as an
//! `Envelope { key_id, ciphertext }`. The hybrid scheme itself belongs to
//! the key fetcher collaborator; this module owns the envelope shape, the
//! trait seam, and the request padding that keeps bucket sizes from
//! leaking. [`LocalKeyFetcher`] is the local-deployment variant: a
//! deterministic keyed stream with an integrity check, good for dev/test
//! parity but not a substitute for a real key management service.

use sha2::{Digest, Sha256};
use silo_common::Error;
use std::sync::Arc;

/// The sealed wire shape: which key sealed it, and the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key_id: String,
    pub ciphertext: Vec<u8>,
}

/// Seals and opens payloads under one key pair.
pub trait PayloadSealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error>;
    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error>;
}

/// External collaborator providing key pairs identified by `key_id`.
/// Key rotation happens out of band.
pub trait KeyFetcherManager: Send + Sync {
    /// The key id new envelopes should be sealed under.
    fn current_key_id(&self) -> Result<String, Error>;

    /// The sealer for a key id, ours or a peer's.
    fn sealer(&self, key_id: &str) -> Result<Arc<dyn PayloadSealer>, Error>;
}

/// Seal `plaintext` under the manager's current key.
pub fn seal_with(manager: &dyn KeyFetcherManager, plaintext: &[u8]) -> Result<Envelope, Error> {
    let key_id = manager.current_key_id()?;
    let ciphertext = manager.sealer(&key_id)?.seal(plaintext)?;
    Ok(Envelope { key_id, ciphertext })
}

/// Open an envelope with the key named inside it.
pub fn open_with(manager: &dyn KeyFetcherManager, envelope: &Envelope) -> Result<Vec<u8>, Error> {
    manager.sealer(&envelope.key_id)?.open(&envelope.ciphertext)
}

// ---------------------------------------------------------------------------
// Request padding
// ---------------------------------------------------------------------------

/// Append `padding` empty keys so every bucket in a fan-out carries the
/// same key count on the wire.
pub fn pad_keys(keys: &mut Vec<String>, padding: usize) {
    keys.extend(std::iter::repeat(String::new()).take(padding));
}

/// Drop padding keys on the receiving side.
pub fn strip_padding(keys: Vec<String>) -> Vec<String> {
    keys.into_iter().filter(|k| !k.is_empty()).collect()
}

// ---------------------------------------------------------------------------
// Local key fetcher
// ---------------------------------------------------------------------------

/// Local-deployment key fetcher: one key id, secret derived from a seed
/// string shared by the fleet.
pub struct LocalKeyFetcher {
    key_id: String,
    sealer: Arc<dyn PayloadSealer>,
}

impl LocalKeyFetcher {
    pub fn new(key_id: impl Into<String>, secret_seed: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"silo-local-key:");
        hasher.update(secret_seed.as_bytes());
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&hasher.finalize());
        Self {
            key_id: key_id.into(),
            sealer: Arc::new(KeystreamSealer { secret }),
        }
    }
}

impl KeyFetcherManager for LocalKeyFetcher {
    fn current_key_id(&self) -> Result<String, Error> {
        Ok(self.key_id.clone())
    }

    fn sealer(&self, key_id: &str) -> Result<Arc<dyn PayloadSealer>, Error> {
        if key_id != self.key_id {
            return Err(Error::Internal(format!("unknown key id: {key_id}")));
        }
        Ok(self.sealer.clone())
    }
}

/// Keyed-stream sealer: `nonce || (crc32(pt) || pt) XOR stream(secret, nonce)`.
struct KeystreamSealer {
    secret: [u8; 32],
}

const NONCE_LEN: usize = 8;

impl KeystreamSealer {
    fn apply_stream(&self, nonce: &[u8], data: &mut [u8]) {
        let mut counter: u64 = 0;
        let mut offset = 0;
        while offset < data.len() {
            let mut hasher = Sha256::new();
            hasher.update(self.secret);
            hasher.update(nonce);
            hasher.update(counter.to_le_bytes());
            let block = hasher.finalize();
            for (byte, key_byte) in data[offset..].iter_mut().zip(block.iter()) {
                *byte ^= key_byte;
            }
            offset += block.len();
            counter += 1;
        }
    }
}

impl PayloadSealer for KeystreamSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let mut body = Vec::with_capacity(4 + plaintext.len());
        body.extend_from_slice(&crc32fast::hash(plaintext).to_le_bytes());
        body.extend_from_slice(plaintext);
        self.apply_stream(&nonce, &mut body);

        let mut out = Vec::with_capacity(NONCE_LEN + body.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.len() < NONCE_LEN + 4 {
            return Err(Error::Internal("sealed payload too short".into()));
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        let mut body = body.to_vec();
        self.apply_stream(nonce, &mut body);

        let (crc_bytes, plaintext) = body.split_at(4);
        let expected = u32::from_le_bytes(crc_bytes.try_into().expect("4-byte crc"));
        if crc32fast::hash(plaintext) != expected {
            return Err(Error::Internal("payload integrity check failed".into()));
        }
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let fetcher = LocalKeyFetcher::new("key-1", "fleet-seed");
        let envelope = seal_with(&fetcher, b"hello shards").unwrap();
        assert_eq!(envelope.key_id, "key-1");
        assert_ne!(envelope.ciphertext, b"hello shards");

        let opened = open_with(&fetcher, &envelope).unwrap();
        assert_eq!(opened, b"hello shards");
    }

    #[test]
    fn test_seal_is_randomized() {
        let fetcher = LocalKeyFetcher::new("key-1", "fleet-seed");
        let a = seal_with(&fetcher, b"payload").unwrap();
        let b = seal_with(&fetcher, b"payload").unwrap();
        assert_ne!(a.ciphertext, b.ciphertext, "nonce must differ per seal");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let fetcher = LocalKeyFetcher::new("key-1", "fleet-seed");
        let mut envelope = seal_with(&fetcher, b"payload").unwrap();
        let last = envelope.ciphertext.len() - 1;
        envelope.ciphertext[last] ^= 0x01;
        assert!(open_with(&fetcher, &envelope).is_err());
    }

    #[test]
    fn test_unknown_key_id() {
        let fetcher = LocalKeyFetcher::new("key-1", "fleet-seed");
        let envelope = Envelope {
            key_id: "key-2".into(),
            ciphertext: vec![0; 16],
        };
        assert!(open_with(&fetcher, &envelope).is_err());
    }

    #[test]
    fn test_different_seeds_cannot_open() {
        let a = LocalKeyFetcher::new("key-1", "seed-a");
        let b = LocalKeyFetcher::new("key-1", "seed-b");
        let envelope = seal_with(&a, b"payload").unwrap();
        assert!(open_with(&b, &envelope).is_err());
    }

    #[test]
    fn test_padding_round_trip() {
        let mut keys = vec!["a".to_string(), "b".to_string()];
        pad_keys(&mut keys, 3);
        assert_eq!(keys.len(), 5);
        assert_eq!(strip_padding(keys), vec!["a".to_string(), "b".to_string()]);
    }
}
