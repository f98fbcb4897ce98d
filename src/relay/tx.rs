//! Finalize transaction encoding.
//!
//! ABI encoding of the bridge contract calls and RLP encoding of legacy
//! EIP-155 transactions.

use ethereum_types::{Address, H256, U256};

use crate::crypto::keccak256;
use crate::types::TransferIntent;

/// `finalizeTransfer(address token, address recipient, uint256 amount, bytes32 messageId, bytes signatures)`
pub const FINALIZE_SIGNATURE: &str = "finalizeTransfer(address,address,uint256,bytes32,bytes)";

/// `isMessageFinalized(bytes32 messageId) returns (bool)`
pub const IS_FINALIZED_SIGNATURE: &str = "isMessageFinalized(bytes32)";

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn address_word(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn u256_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

// ============================================================================
// ABI ENCODING
// ============================================================================

/// Calldata of the finalize call for `intent` carrying the concatenated
/// `signatures`.
pub fn encode_finalize_transfer(intent: &TransferIntent, signatures: &[u8]) -> Vec<u8> {
    // Head: token, recipient, amount, messageId, offset of `signatures`
    // Tail: length, data right-padded to a 32-byte boundary
    let mut data = Vec::with_capacity(4 + 32 * 7 + signatures.len());
    data.extend_from_slice(&selector(FINALIZE_SIGNATURE));
    data.extend_from_slice(&address_word(&intent.token));
    data.extend_from_slice(&address_word(&intent.recipient));
    data.extend_from_slice(&u256_word(intent.amount));
    data.extend_from_slice(intent.message_id.as_bytes());
    data.extend_from_slice(&u256_word(U256::from(5 * 32)));

    data.extend_from_slice(&u256_word(U256::from(signatures.len())));
    data.extend_from_slice(signatures);
    let padding = (32 - (signatures.len() % 32)) % 32;
    data.extend(std::iter::repeat(0u8).take(padding));
    data
}

/// Calldata of `isMessageFinalized(messageId)`.
pub fn encode_is_message_finalized(message_id: &H256) -> Vec<u8> {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&selector(IS_FINALIZED_SIGNATURE));
    data.extend_from_slice(message_id.as_bytes());
    data
}

/// Decodes an ABI `bool` return value.
pub fn decode_bool(output: &[u8]) -> bool {
    output.len() >= 32 && output[31] == 1 && output[..31].iter().all(|b| *b == 0)
}

// ============================================================================
// RLP ENCODING HELPERS (for legacy EVM transactions)
// ============================================================================

/// Big-endian bytes with no leading zeros (RLP integer format).
fn rlp_encode_u64(val: u64) -> Vec<u8> {
    trim_leading_zeros(&val.to_be_bytes())
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// RLP-encode a single byte-string item.
fn rlp_encode_item(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        vec![data[0]]
    } else if data.len() <= 55 {
        let mut out = vec![0x80 + data.len() as u8];
        out.extend_from_slice(data);
        out
    } else {
        let len_bytes = rlp_encode_u64(data.len() as u64);
        let mut out = vec![0xb7 + len_bytes.len() as u8];
        out.extend_from_slice(&len_bytes);
        out.extend_from_slice(data);
        out
    }
}

/// RLP-encode a list of items (each item is raw bytes, not yet RLP-encoded).
fn rlp_encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.iter().flat_map(|item| rlp_encode_item(item)).collect();

    if payload.len() <= 55 {
        let mut out = vec![0xc0 + payload.len() as u8];
        out.extend(payload);
        out
    } else {
        let len_bytes = rlp_encode_u64(payload.len() as u64);
        let mut out = vec![0xf7 + len_bytes.len() as u8];
        out.extend_from_slice(&len_bytes);
        out.extend(payload);
        out
    }
}

// ============================================================================
// LEGACY TRANSACTION
// ============================================================================

/// Legacy (type 0) transaction with EIP-155 replay protection. Value is always 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: Address,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn base_items(&self) -> Vec<Vec<u8>> {
        vec![
            rlp_encode_u64(self.nonce),
            rlp_encode_u64(self.gas_price),
            rlp_encode_u64(self.gas_limit),
            self.to.as_bytes().to_vec(),
            vec![], // value = 0
            self.data.clone(),
        ]
    }

    /// Hash signed by the sender:
    /// keccak256(rlp([nonce, gasPrice, gasLimit, to, value, data, chainId, 0, 0]))
    pub fn signing_hash(&self) -> [u8; 32] {
        let mut items = self.base_items();
        items.push(rlp_encode_u64(self.chain_id));
        items.push(vec![]);
        items.push(vec![]);
        keccak256(&rlp_encode_list(&items))
    }

    /// Raw signed transaction: rlp([nonce, gasPrice, gasLimit, to, value, data, v, r, s])
    /// with v = recovery_id + chainId * 2 + 35.
    pub fn encode_signed(&self, r: &[u8; 32], s: &[u8; 32], recovery_id: u8) -> Vec<u8> {
        let v = recovery_id as u64 + self.chain_id * 2 + 35;
        let mut items = self.base_items();
        items.push(rlp_encode_u64(v));
        items.push(trim_leading_zeros(r));
        items.push(trim_leading_zeros(s));
        rlp_encode_list(&items)
    }
}

/// Hash under which a raw signed transaction is known to the chain.
pub fn raw_transaction_hash(raw_tx: &[u8]) -> H256 {
    H256::from(keccak256(raw_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainSide;

    #[test]
    fn rlp_short_and_long_items() {
        assert_eq!(rlp_encode_item(&[]), vec![0x80]);
        assert_eq!(rlp_encode_item(&[0x7f]), vec![0x7f]);
        assert_eq!(rlp_encode_item(&[0x80]), vec![0x81, 0x80]);
        let long = vec![0xaa; 56];
        let encoded = rlp_encode_item(&long);
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(encoded.len(), 58);
    }

    #[test]
    fn finalize_calldata_layout() {
        let intent = TransferIntent {
            bridge_id: "b".to_string(),
            source_chain: ChainSide::Home,
            source_chain_id: 1,
            tx_hash: H256::zero(),
            log_index: 0,
            block_number: 1,
            token: Address::repeat_byte(0x01),
            sender: Address::repeat_byte(0x02),
            recipient: Address::repeat_byte(0x03),
            amount: U256::from(7u64),
            message_id: H256::repeat_byte(0x04),
        };
        let signatures = vec![0xee; 65];
        let data = encode_finalize_transfer(&intent, &signatures);

        assert_eq!(&data[..4], &selector(FINALIZE_SIGNATURE));
        // 4 + 5 head words + length word + 3 data words (65 bytes padded to 96)
        assert_eq!(data.len(), 4 + 32 * 5 + 32 + 96);
        assert_eq!(data[4 + 32 * 3 - 1], 7);
        assert_eq!(data[4 + 32 * 5 - 1], 160);
        assert_eq!(data[4 + 32 * 6 - 1], 65);
    }

    #[test]
    fn decodes_abi_bool() {
        let mut word = [0u8; 32];
        assert!(!decode_bool(&word));
        word[31] = 1;
        assert!(decode_bool(&word));
        assert!(!decode_bool(&[]));
    }
}
