use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Deterministically pseudonymizes a UID by HMAC-SHA256-hashing it with a
/// per-session key and reformatting the digest as a UID under the `2.25`
/// (UUID-derived) root reserved by DICOM PS3.5 Annex B.2.
///
/// The same `(session_key, uid)` pair always produces the same output within
/// one process lifetime. The result never exceeds the 64-character limit on
/// the UI value representation.
pub fn hash_uid(session_key: &[u8], uid: &str) -> String {
	let mut mac =
		HmacSha256::new_from_slice(session_key).expect("HMAC accepts a key of any length");
	mac.update(uid.as_bytes());
	let digest = mac.finalize().into_bytes();

	let hi = u64::from_be_bytes(digest[0..8].try_into().expect("8 bytes"));
	let lo = u64::from_be_bytes(digest[8..16].try_into().expect("8 bytes"));

	// "2.25." is the DICOM root reserved for UUID-derived UIDs; `hi` supplies
	// the leading (non-zero-padded) digits so the numeric component never
	// starts with a leading zero, and `lo` is zero-padded to add entropy
	// without introducing a second dot-separated component.
	let uid = format!("2.25.{hi}{lo:020}");
	debug_assert!(uid.len() <= 64, "generated UID exceeds UI VR length limit");
	uid
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn same_key_and_input_hash_to_the_same_uid() {
		let key = b"session-key";
		let a = hash_uid(key, "1.2.840.113619.2.1");
		let b = hash_uid(key, "1.2.840.113619.2.1");
		assert_eq!(a, b);
	}

	#[test]
	fn distinct_inputs_hash_to_distinct_uids() {
		let key = b"session-key";
		let a = hash_uid(key, "1.2.840.113619.2.1");
		let b = hash_uid(key, "1.2.840.113619.2.2");
		assert_ne!(a, b);
	}

	#[test]
	fn distinct_keys_hash_the_same_input_differently() {
		let a = hash_uid(b"key-a", "1.2.3.4");
		let b = hash_uid(b"key-b", "1.2.3.4");
		assert_ne!(a, b);
	}

	#[test]
	fn output_is_a_well_formed_uid_within_length_limit() {
		let uid = hash_uid(b"key", "1.2.3.4.5.6.7.8.9.10");
		assert!(uid.starts_with("2.25."));
		assert!(uid.len() <= 64);
		assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
	}

	#[test]
	fn applying_twice_with_the_same_key_is_idempotent_on_the_final_uid() {
		let key = b"session-key";
		let once = hash_uid(key, "1.2.3");
		// Re-hashing the already-hashed UID is NOT the same operation as the
		// editor pipeline's "apply twice" law, which re-runs the
		// editor over the *same original dataset* both times. This test
		// documents the hash function itself is a pure, stateless mapping.
		let twice = hash_uid(key, "1.2.3");
		assert_eq!(once, twice);
	}
}
