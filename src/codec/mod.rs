//! Threshold share codec
//!
//! Encodes a payload into N shares with reconstruction threshold K. Any K
//! shares reconstruct the payload exactly; K-1 or fewer reveal nothing about
//! it. Decoding verifies the payload fingerprint before returning.

pub mod shamir;

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Largest N the GF(2^8) field supports (x = 1..=255)
pub const MAX_SHARES: usize = 255;

/// Size of fingerprint salt and digest in bytes
pub const FINGERPRINT_SIZE: usize = 32;

/// One share of a payload
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    /// Share index within the set (0..N)
    pub index: u8,
    /// Share bytes, same length as the payload
    pub data: Vec<u8>,
}

impl Share {
    pub fn new(index: u8, data: Vec<u8>) -> Self {
        Share { index, data }
    }

    /// BLAKE3 checksum of the share bytes
    pub fn checksum(&self) -> [u8; 32] {
        share_checksum(&self.data)
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print share bytes
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .finish()
    }
}

/// BLAKE3 checksum of raw share bytes
pub fn share_checksum(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Keyed integrity hash of the original payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Random per-set key
    pub salt: [u8; FINGERPRINT_SIZE],
    /// BLAKE3 keyed hash of the payload under `salt`
    pub digest: [u8; FINGERPRINT_SIZE],
}

impl Fingerprint {
    /// Fingerprint a payload under a fresh random salt
    pub fn compute(payload: &[u8]) -> Self {
        let mut salt = [0u8; FINGERPRINT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(salt, payload)
    }

    pub fn with_salt(salt: [u8; FINGERPRINT_SIZE], payload: &[u8]) -> Self {
        let digest = *blake3::keyed_hash(&salt, payload).as_bytes();
        Fingerprint { salt, digest }
    }

    /// Constant-time check that `payload` matches this fingerprint
    pub fn verify(&self, payload: &[u8]) -> bool {
        blake3::keyed_hash(&self.salt, payload) == blake3::Hash::from(self.digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

/// Output of encoding: the shares and the payload fingerprint
#[derive(Debug)]
pub struct EncodedSet {
    pub shares: Vec<Share>,
    pub fingerprint: Fingerprint,
}

/// K-of-N threshold codec
#[derive(Debug, Clone, Copy)]
pub struct ShareCodec {
    threshold: usize, // K
    total: usize,     // N
}

impl ShareCodec {
    /// Create a codec with threshold K and N total shares
    ///
    /// # Errors
    /// Returns error unless `2 <= K <= N <= 255`. K = 1 is rejected because a
    /// single fragment would expose the payload to whichever domain holds it.
    pub fn new(threshold: usize, total: usize) -> Result<Self> {
        if threshold < 2 {
            return Err(Error::InvalidParameters(format!(
                "threshold (K={}) must be at least 2",
                threshold
            )));
        }
        if total < threshold {
            return Err(Error::InvalidParameters(format!(
                "threshold (K={}) must not exceed total shares (N={})",
                threshold, total
            )));
        }
        if total > MAX_SHARES {
            return Err(Error::InvalidParameters(format!(
                "total shares (N={}) exceeds field limit of {}",
                total, MAX_SHARES
            )));
        }

        Ok(ShareCodec { threshold, total })
    }

    /// Encode payload into N shares plus a fingerprint
    pub fn encode(&self, payload: &[u8]) -> Result<EncodedSet> {
        let fingerprint = Fingerprint::compute(payload);
        let raw = shamir::split(payload, self.total, self.threshold, &mut rand::thread_rng());
        let shares = raw
            .into_iter()
            .enumerate()
            .map(|(i, data)| Share::new(i as u8, data))
            .collect();

        Ok(EncodedSet {
            shares,
            fingerprint,
        })
    }

    /// Decode from at least K shares and verify against `fingerprint`
    ///
    /// # Errors
    /// - `InsufficientShares` if fewer than K distinct indices are given
    /// - `CorruptShares` on conflicting duplicates, ragged lengths, an
    ///   out-of-range index, or a fingerprint mismatch
    pub fn decode(&self, shares: &[Share], fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let mut distinct: BTreeMap<u8, &Share> = BTreeMap::new();
        for share in shares {
            if share.index as usize >= self.total {
                return Err(Error::CorruptShares(format!(
                    "share index {} out of range for N={}",
                    share.index, self.total
                )));
            }
            match distinct.get(&share.index) {
                Some(existing) if existing.data != share.data => {
                    return Err(Error::CorruptShares(format!(
                        "conflicting copies of share {}",
                        share.index
                    )));
                }
                Some(_) => {}
                None => {
                    distinct.insert(share.index, share);
                }
            }
        }

        if distinct.len() < self.threshold {
            return Err(Error::InsufficientShares {
                available: distinct.len(),
                required: self.threshold,
            });
        }

        let chosen: Vec<&Share> = distinct.values().take(self.threshold).copied().collect();
        let len = chosen[0].data.len();
        if chosen.iter().any(|s| s.data.len() != len) {
            return Err(Error::CorruptShares("share lengths differ".to_string()));
        }

        let points: Vec<(u8, &[u8])> = chosen
            .iter()
            .map(|s| (shamir::x_coordinate(s.index), s.data.as_slice()))
            .collect();
        let mut payload = shamir::combine(&points);

        if !fingerprint.verify(&payload) {
            payload.zeroize();
            return Err(Error::CorruptShares(
                "reconstructed payload does not match fingerprint".to_string(),
            ));
        }

        Ok(payload)
    }

    /// Get K (threshold)
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Get N (total shares)
    pub fn total_shares(&self) -> usize {
        self.total
    }
}
