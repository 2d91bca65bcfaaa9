//! SHA-256 signing-certificate fingerprints in `AA:BB:...:ZZ` form.

use sha2::{Digest, Sha256};

use crate::error::FingerprintError;

/// Length of a decoded fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Decode a colon-separated hex fingerprint into exactly 32 bytes.
///
/// Each pair must be two hex digits (either case). Anything else, or a
/// byte count other than 32, is an error.
pub fn parse_fingerprint(value: &str) -> Result<Fingerprint, FingerprintError> {
    let mut bytes = Vec::with_capacity(FINGERPRINT_LEN);
    for pair in value.split(':') {
        if pair.len() != 2 {
            return Err(FingerprintError::InvalidByte(pair.to_string()));
        }
        let decoded =
            hex::decode(pair).map_err(|_| FingerprintError::InvalidByte(pair.to_string()))?;
        bytes.extend_from_slice(&decoded);
    }
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| FingerprintError::WrongLength(len))
}

/// Encode a fingerprint as uppercase colon-separated hex.
pub fn format_fingerprint(fingerprint: &Fingerprint) -> String {
    fingerprint
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// SHA-256 of a DER-encoded signing certificate.
pub fn fingerprint_of(certificate: &[u8]) -> Fingerprint {
    Sha256::digest(certificate).into()
}
