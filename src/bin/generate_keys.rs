//! Oracle Key Generation Utility
//!
//! Generates a new 32-byte oracle secret and prints the identities derived
//! from it.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin generate_keys
//! ```
//!
//! ## Output
//!
//! - Secret (base64) - export as `ORACLE_PRIVATE_KEY`
//! - Ed25519 public key (base64) - `public_key` of an ed25519 validator entry
//! - EVM address - `public_key` of a secp256k1 validator entry, and the
//!   sender of finalize transactions (fund it on every destination chain)

use base64::{engine::general_purpose, Engine as _};
use bridge_oracle::crypto::CryptoService;
use bridge_oracle::types::hex_address;
use rand::RngCore;

fn main() -> anyhow::Result<()> {
    let mut secret = [0u8; 32];
    // Rejects the rare secret that is not a valid secp256k1 scalar
    let crypto = loop {
        rand::rngs::OsRng.fill_bytes(&mut secret);
        if let Ok(crypto) = CryptoService::from_secret_bytes(&secret) {
            break crypto;
        }
    };

    println!("Generated Oracle Key:");
    println!("Secret (base64): {}", general_purpose::STANDARD.encode(secret));
    println!("Ed25519 Public Key (base64): {}", crypto.get_public_key());
    println!("EVM Address: {}", hex_address(&crypto.ethereum_address()));
    println!();
    println!("export ORACLE_PRIVATE_KEY=<secret> before starting the oracle.");
    Ok(())
}
