//! Probe side of the per-block Bloom filter carried by beats.
//!
//! The node builds the filter over every address and storage slot a block touched.
//! Only membership tests are needed here, a false positive costs a re-fetch.

use crate::utils::blake2b_256;

/// Filter hash functions draw 4 byte words from one 32 byte digest.
const MAX_K: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bloom {
	k: u32,
	bits: Vec<u8>,
}

impl Bloom {
	pub fn new(k: u32, bits: Vec<u8>) -> Self {
		Self { k, bits }
	}

	pub fn k(&self) -> u32 {
		self.k
	}

	pub fn bits(&self) -> &[u8] {
		&self.bits
	}

	pub fn contains(&self, token: &str) -> bool {
		test(token, self.k, &self.bits)
	}
}

/// Bytes a tie token contributes to the filter.
///
/// Hex tokens (addresses, slots) are probed by their decoded bytes, anything else by its UTF-8 form.
fn token_bytes(token: &str) -> Vec<u8> {
	token
		.strip_prefix("0x")
		.and_then(|hex| hex::decode(hex.to_ascii_lowercase()).ok())
		.unwrap_or_else(|| token.as_bytes().to_vec())
}

/// Tests whether `token` may be a member of the filter described by `k` and `bits`.
///
/// Filters this side cannot evaluate answer `true`, so an entry tied to the token is evicted.
pub fn test(token: &str, k: u32, bits: &[u8]) -> bool {
	if k == 0 || k > MAX_K || bits.is_empty() {
		return true;
	}
	let hash = blake2b_256(&token_bytes(token));
	let bits_len = bits.len() as u64 * 8;

	(0..k as usize).all(|i| {
		let word = u32::from_be_bytes([
			hash[i * 4],
			hash[i * 4 + 1],
			hash[i * 4 + 2],
			hash[i * 4 + 3],
		]);
		let position = (word as u64 % bits_len) as usize;
		bits[position / 8] & (1 << (position % 8)) != 0
	})
}

#[cfg(test)]
pub(crate) fn build(k: u32, bytes: usize, tokens: &[&str]) -> Bloom {
	let mut bits = vec![0u8; bytes];
	let bits_len = bytes as u64 * 8;
	for token in tokens {
		let hash = blake2b_256(&token_bytes(token));
		for i in 0..k as usize {
			let word = u32::from_be_bytes([
				hash[i * 4],
				hash[i * 4 + 1],
				hash[i * 4 + 2],
				hash[i * 4 + 3],
			]);
			let position = (word as u64 % bits_len) as usize;
			bits[position / 8] |= 1 << (position % 8);
		}
	}
	Bloom::new(k, bits)
}
