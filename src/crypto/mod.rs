//! Cryptographic Operations Module
//!
//! This module handles the cryptographic operations of the oracle:
//! - Loading the oracle secret and deriving its Ed25519 and secp256k1 keys
//! - Signing attestations over the canonical transfer payload
//! - Verifying attestations from other validators (address recovery for
//!   secp256k1, public key verification for Ed25519)
//! - Signing EVM transaction hashes for finalize transactions
//!
//! ## Security Requirements
//!
//! **CRITICAL**: Private keys must never be exposed or logged.

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use ethereum_types::Address;
use k256::ecdsa::{
    RecoveryId, Signature as EcdsaSignature, SigningKey as EcdsaSigningKey,
    VerifyingKey as EcdsaVerifyingKey,
};
use sha3::{Digest, Keccak256};
use tracing::info;

use crate::config::{Config, SignatureScheme, ValidatorConfig};
use crate::error::{OracleError, OracleResult};
use crate::types::parse_address;

// ============================================================================
// HASHING HELPERS
// ============================================================================

/// keccak256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest signed by secp256k1 validators:
/// keccak256("\x19Ethereum Signed Message:\n32" || keccak256(payload))
pub fn eth_signed_message_hash(payload: &[u8]) -> [u8; 32] {
    let message_hash = keccak256(payload);
    let prefix = b"\x19Ethereum Signed Message:\n32";
    let mut prefixed_message = Vec::with_capacity(prefix.len() + 32);
    prefixed_message.extend_from_slice(prefix);
    prefixed_message.extend_from_slice(&message_hash);
    keccak256(&prefixed_message)
}

/// Ethereum address of a secp256k1 public key:
/// keccak256(uncompressed_public_key[1..])[12..32]
pub fn ethereum_address_of(verifying_key: &EcdsaVerifyingKey) -> Address {
    let public_key_point = verifying_key.to_encoded_point(false);
    // Uncompressed format: 0x04 || x (32 bytes) || y (32 bytes)
    let hash = keccak256(&public_key_point.as_bytes()[1..]);
    Address::from_slice(&hash[12..32])
}

fn decode_hex(value: &str) -> Result<Vec<u8>, String> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value)).map_err(|e| e.to_string())
}

// ============================================================================
// VALIDATOR KEYS
// ============================================================================

/// Verification material of one configured validator.
#[derive(Debug, Clone)]
pub enum ValidatorKey {
    /// EVM address recovered from `r || s || v` signatures
    Secp256k1(Address),
    Ed25519(VerifyingKey),
}

impl ValidatorKey {
    /// Parses the key of a validator entry.
    pub fn from_config(validator: &ValidatorConfig) -> OracleResult<Self> {
        match validator.scheme {
            SignatureScheme::Secp256k1 => parse_address(&validator.public_key)
                .map(ValidatorKey::Secp256k1)
                .map_err(|e| {
                    OracleError::Crypto(format!("validator {}: {}", validator.id, e))
                }),
            SignatureScheme::Ed25519 => {
                let bytes = general_purpose::STANDARD
                    .decode(&validator.public_key)
                    .map_err(|e| {
                        OracleError::Crypto(format!("validator {}: {}", validator.id, e))
                    })?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
                    OracleError::Crypto(format!(
                        "validator {}: ed25519 public key must be 32 bytes",
                        validator.id
                    ))
                })?;
                VerifyingKey::from_bytes(&bytes)
                    .map(ValidatorKey::Ed25519)
                    .map_err(|e| {
                        OracleError::Crypto(format!("validator {}: {}", validator.id, e))
                    })
            }
        }
    }

    /// Verifies a hex encoded signature over `payload`.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Signature was produced by this validator
    /// * `Err(String)` - Reason the signature was refused
    pub fn verify(&self, payload: &[u8], signature_hex: &str) -> Result<(), String> {
        let signature_bytes = decode_hex(signature_hex)?;
        match self {
            ValidatorKey::Secp256k1(expected) => {
                let recovered = recover_signer(payload, &signature_bytes)?;
                if recovered != *expected {
                    return Err(format!(
                        "recovered signer 0x{} does not match 0x{}",
                        hex::encode(recovered.as_bytes()),
                        hex::encode(expected.as_bytes())
                    ));
                }
                Ok(())
            }
            ValidatorKey::Ed25519(verifying_key) => {
                let signature_bytes: [u8; 64] = signature_bytes
                    .try_into()
                    .map_err(|_| "ed25519 signature must be 64 bytes".to_string())?;
                let signature = Signature::from_bytes(&signature_bytes);
                verifying_key
                    .verify_strict(&keccak256(payload), &signature)
                    .map_err(|e| e.to_string())
            }
        }
    }
}

/// Recovers the EVM address that produced a 65-byte `r || s || v` signature
/// over the eth-signed-message digest of `payload`.
pub fn recover_signer(payload: &[u8], signature: &[u8]) -> Result<Address, String> {
    if signature.len() != 65 {
        return Err(format!(
            "secp256k1 signature must be 65 bytes, got {}",
            signature.len()
        ));
    }
    let v = signature[64];
    let recovery_byte = match v {
        27 | 28 => v - 27,
        0 | 1 => v,
        other => return Err(format!("invalid recovery byte {}", other)),
    };
    let recovery_id =
        RecoveryId::try_from(recovery_byte).map_err(|e| format!("invalid recovery id: {}", e))?;
    let signature =
        EcdsaSignature::from_slice(&signature[..64]).map_err(|e| format!("malformed signature: {}", e))?;
    let digest = eth_signed_message_hash(payload);
    let recovered = EcdsaVerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|e| format!("recovery failed: {}", e))?;
    Ok(ethereum_address_of(&recovered))
}

// ============================================================================
// CRYPTOGRAPHIC SERVICE IMPLEMENTATION
// ============================================================================

/// Cryptographic service holding the oracle's own keys.
///
/// Both keys are derived from the same 32-byte secret: the Ed25519 signing
/// key uses it as seed, the secp256k1 key uses it as scalar.
pub struct CryptoService {
    signing_key: SigningKey,
    ecdsa_signing_key: EcdsaSigningKey,
}

impl CryptoService {
    /// Creates the crypto service from the secret held in the environment
    /// variable named by `oracle.private_key_env`.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let private_key_b64 = config.oracle.get_private_key()?;
        let private_key_bytes = general_purpose::STANDARD.decode(private_key_b64.trim())?;

        if private_key_bytes.len() != 32 {
            return Err(anyhow::anyhow!(
                "Invalid private key length: expected 32 bytes, got {}",
                private_key_bytes.len()
            ));
        }

        let secret_key_bytes: [u8; 32] = private_key_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Failed to convert private key to array"))?;

        let service = Self::from_secret_bytes(&secret_key_bytes)?;
        info!(
            address = %format!("0x{}", hex::encode(service.ethereum_address().as_bytes())),
            "Crypto service initialized with key from environment variable"
        );
        Ok(service)
    }

    /// Builds the service from raw secret bytes.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> OracleResult<Self> {
        let signing_key = SigningKey::from_bytes(secret);
        let ecdsa_signing_key = EcdsaSigningKey::from_bytes(&(*secret).into())
            .map_err(|e| OracleError::Crypto(format!("Failed to create ECDSA signing key: {}", e)))?;
        Ok(Self {
            signing_key,
            ecdsa_signing_key,
        })
    }

    /// Returns the Ed25519 public key as a base64 string.
    pub fn get_public_key(&self) -> String {
        general_purpose::STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// EVM address of the secp256k1 key (also the relayer's sender address).
    pub fn ethereum_address(&self) -> Address {
        ethereum_address_of(self.ecdsa_signing_key.verifying_key())
    }

    /// Whether the configured validator entry describes this key.
    pub fn matches_validator(&self, validator: &ValidatorConfig) -> OracleResult<bool> {
        Ok(match ValidatorKey::from_config(validator)? {
            ValidatorKey::Secp256k1(address) => address == self.ethereum_address(),
            ValidatorKey::Ed25519(key) => key == self.signing_key.verifying_key(),
        })
    }

    /// Signs a canonical payload with the requested scheme.
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - 0x-prefixed hex signature (65 bytes for secp256k1, 64 for ed25519)
    pub fn sign_payload(&self, scheme: SignatureScheme, payload: &[u8]) -> OracleResult<String> {
        let bytes = match scheme {
            SignatureScheme::Secp256k1 => {
                let digest = eth_signed_message_hash(payload);
                let (r, s, recovery_id) = self.sign_prehash(&digest)?;
                let mut signature = Vec::with_capacity(65);
                signature.extend_from_slice(&r);
                signature.extend_from_slice(&s);
                // Ethereum format (27 or 28)
                signature.push(recovery_id + 27);
                signature
            }
            SignatureScheme::Ed25519 => self
                .signing_key
                .sign(&keccak256(payload))
                .to_bytes()
                .to_vec(),
        };
        Ok(format!("0x{}", hex::encode(bytes)))
    }

    /// Signs a raw EVM transaction hash with the ECDSA key.
    ///
    /// This does NOT apply the Ethereum signed message prefix.
    ///
    /// # Returns
    ///
    /// * `Ok((r, s, recovery_id))` - r and s are 32-byte big-endian, recovery_id is 0 or 1
    pub fn sign_transaction_hash(&self, tx_hash: &[u8; 32]) -> OracleResult<([u8; 32], [u8; 32], u8)> {
        self.sign_prehash(tx_hash)
    }

    fn sign_prehash(&self, digest: &[u8; 32]) -> OracleResult<([u8; 32], [u8; 32], u8)> {
        let (signature, recovery_id) = self
            .ecdsa_signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|e| OracleError::Crypto(format!("Failed to sign hash: {}", e)))?;

        let sig_bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&sig_bytes[..32]);
        s.copy_from_slice(&sig_bytes[32..64]);
        Ok((r, s, recovery_id.to_byte()))
    }
}
