//! Wallet address validation and normalization
//!
//! Miners send their payout address in many shapes: fully prefixed, without
//! the `karlsen:` prefix, or with trailing garbage appended by the mining
//! software. Normalization accepts a valid bech32 address as is, otherwise
//! coerces the input into `<prefix>:<payload>` of the network's exact length.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Bech32 character set, index is the 5-bit value
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Number of 5-bit groups in the checksum
const CHECKSUM_GROUPS: usize = 8;

/// Fixed payload length (version byte + 32-byte key + checksum) in characters
const PAYLOAD_LEN: usize = 61;

static MAINNET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^karlsen:[a-z0-9]+$").expect("valid mainnet address pattern"));
static TESTNET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^karlsentest:[a-z0-9]+$").expect("valid testnet address pattern"));

/// Network profile an address is validated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Karlsen mainnet, `karlsen:` addresses
    Mainnet,
    /// Karlsen testnet, `karlsentest:` addresses
    Testnet,
}

impl Network {
    /// Select the network from the `testnet_mining` flag
    pub fn from_testnet_flag(testnet_mining: bool) -> Self {
        if testnet_mining {
            Self::Testnet
        } else {
            Self::Mainnet
        }
    }

    /// Human readable part of the address, without the colon
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Mainnet => "karlsen",
            Self::Testnet => "karlsentest",
        }
    }

    /// Exact length of a normalized address on this network
    pub fn address_len(&self) -> usize {
        self.prefix().len() + 1 + PAYLOAD_LEN
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            Self::Mainnet => &MAINNET_PATTERN,
            Self::Testnet => &TESTNET_PATTERN,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mainnet => f.write_str("mainnet"),
            Self::Testnet => f.write_str("testnet"),
        }
    }
}

/// Normalize a miner-supplied wallet address for `network`
pub fn normalize(raw: &str, network: Network) -> Result<String> {
    debug!("normalizing {} wallet address: {}", network, raw);

    if decode_address(raw, network.prefix()).is_some() {
        return Ok(raw.to_string());
    }

    let colon_prefix = format!("{}:", network.prefix());
    let prefixed = if raw.starts_with(&colon_prefix) {
        raw.to_string()
    } else {
        format!("{}{}", colon_prefix, raw)
    };

    if !network.pattern().is_match(&prefixed) {
        return Err(Error::invalid_wallet(
            raw,
            "unable to coerce wallet to valid karlsen address",
        ));
    }

    let expected_len = network.address_len();
    if prefixed.len() < expected_len {
        return Err(Error::invalid_wallet(
            raw,
            format!("address must be at least {} characters", expected_len),
        ));
    }

    // The pattern guarantees ASCII, so byte slicing stays on a char boundary.
    Ok(prefixed[..expected_len].to_string())
}

/// Decode a bech32 address, returning its version byte and payload
pub fn decode_address(address: &str, prefix: &str) -> Option<(u8, Vec<u8>)> {
    let (address_prefix, data) = address.split_once(':')?;
    if address_prefix != prefix || data.len() <= CHECKSUM_GROUPS {
        return None;
    }

    let five_bit = data
        .bytes()
        .map(|c| CHARSET.iter().position(|&x| x == c).map(|p| p as u8))
        .collect::<Option<Vec<u8>>>()?;

    let (payload, checksum_groups) = five_bit.split_at(five_bit.len() - CHECKSUM_GROUPS);
    let expected = checksum_groups
        .iter()
        .fold(0u64, |acc, &group| (acc << 5) | group as u64);
    if checksum(payload, prefix) != expected {
        return None;
    }

    let bytes = conv5to8(payload);
    let (&version, key) = bytes.split_first()?;
    let expected_len = match version {
        0 | 8 => 32,
        1 => 33,
        _ => return None,
    };

    (key.len() == expected_len).then(|| (version, key.to_vec()))
}

fn polymod(values: impl Iterator<Item = u8>) -> u64 {
    let mut c = 1u64;
    for d in values {
        let c0 = c >> 35;
        c = ((c & 0x07_ffff_ffff) << 5) ^ d as u64;
        if c0 & 0x01 != 0 {
            c ^= 0x98_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e_4f43_e470;
        }
    }
    c ^ 1
}

fn checksum(payload: &[u8], prefix: &str) -> u64 {
    polymod(
        prefix
            .bytes()
            .map(|b| b & 0x1f)
            .chain([0])
            .chain(payload.iter().copied())
            .chain([0u8; CHECKSUM_GROUPS]),
    )
}

fn conv5to8(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() * 5 / 8);
    let mut buffer = 0u32;
    let mut bits = 0u32;
    for &group in payload {
        buffer = (buffer << 5) | group as u32;
        bits += 5;
        while bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
        buffer &= (1 << bits) - 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn conv8to5(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buffer = 0u32;
        let mut bits = 0u32;
        for &byte in payload {
            buffer = (buffer << 8) | byte as u32;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(((buffer >> bits) & 0x1f) as u8);
            }
            buffer &= (1 << bits) - 1;
        }
        if bits > 0 {
            out.push(((buffer << (5 - bits)) & 0x1f) as u8);
        }
        out
    }

    fn encode_address(prefix: &str, version: u8, key: &[u8]) -> String {
        let mut bytes = vec![version];
        bytes.extend_from_slice(key);
        let payload = conv8to5(&bytes);
        let sum = checksum(&payload, prefix);
        let data: String = payload
            .iter()
            .copied()
            .chain((0..CHECKSUM_GROUPS).map(|i| ((sum >> (5 * (7 - i))) & 0x1f) as u8))
            .map(|group| CHARSET[group as usize] as char)
            .collect();
        format!("{}:{}", prefix, data)
    }

    #[test]
    fn test_network_lengths() {
        assert_eq!(Network::Mainnet.address_len(), 69);
        assert_eq!(Network::Testnet.address_len(), 73);
        assert_eq!(Network::from_testnet_flag(true), Network::Testnet);
    }

    #[test]
    fn test_decode_roundtrip_schnorr() {
        let address = encode_address("karlsen", 0, &[7u8; 32]);
        assert_eq!(address.len(), Network::Mainnet.address_len());
        assert_eq!(decode_address(&address, "karlsen"), Some((0, vec![7u8; 32])));
        assert_eq!(decode_address(&address, "karlsentest"), None);
    }

    #[test]
    fn test_decode_rejects_corrupted_checksum() {
        let address = encode_address("karlsen", 0, &[1u8; 32]);
        let mut corrupted = address.into_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == b'q' { b'p' } else { b'q' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        assert_eq!(decode_address(&corrupted, "karlsen"), None);
    }

    #[test]
    fn test_valid_ecdsa_address_is_not_truncated() {
        let address = encode_address("karlsen", 1, &[9u8; 33]);
        assert!(address.len() > Network::Mainnet.address_len());
        assert_eq!(normalize(&address, Network::Mainnet).unwrap(), address);
    }

    #[test]
    fn test_missing_prefix_is_prepended() {
        let address = encode_address("karlsen", 0, &[3u8; 32]);
        let bare = address.trim_start_matches("karlsen:");
        assert_eq!(normalize(bare, Network::Mainnet).unwrap(), address);
    }

    #[test]
    fn test_trailing_garbage_is_truncated() {
        let payload = "q".repeat(PAYLOAD_LEN);
        let raw = format!("karlsen:{}extra", payload);
        assert_eq!(
            normalize(&raw, Network::Mainnet).unwrap(),
            format!("karlsen:{}", payload)
        );
    }

    #[test]
    fn test_testnet_profile() {
        let payload = "a".repeat(PAYLOAD_LEN);
        assert_eq!(
            normalize(&payload, Network::Testnet).unwrap(),
            format!("karlsentest:{}", payload)
        );
        let mainnet = encode_address("karlsen", 0, &[5u8; 32]);
        assert_matches!(
            normalize(&mainnet, Network::Testnet),
            Err(Error::InvalidWallet { .. })
        );
    }

    #[test]
    fn test_rejects_invalid_characters() {
        assert_matches!(
            normalize("Karlsen:QQQ", Network::Mainnet),
            Err(Error::InvalidWallet { .. })
        );
        assert_matches!(normalize("", Network::Mainnet), Err(Error::InvalidWallet { .. }));
        assert_matches!(
            normalize("karlsen:abc def", Network::Mainnet),
            Err(Error::InvalidWallet { .. })
        );
    }

    #[test]
    fn test_short_address_fails_instead_of_panicking() {
        assert_matches!(
            normalize("addr123", Network::Mainnet),
            Err(Error::InvalidWallet { .. })
        );
        assert_matches!(
            normalize("karlsen:qqqq", Network::Mainnet),
            Err(Error::InvalidWallet { .. })
        );
    }

    proptest! {
        #[test]
        fn prop_valid_addresses_are_identity(key in proptest::array::uniform32(any::<u8>())) {
            let address = encode_address("karlsen", 0, &key);
            prop_assert_eq!(normalize(&address, Network::Mainnet).unwrap(), address);
        }

        #[test]
        fn prop_unprefixed_addresses_gain_prefix(
            payload in "[a-z0-9]{61,80}"
        ) {
            let normalized = normalize(&payload, Network::Mainnet).unwrap();
            prop_assert_eq!(normalized.len(), Network::Mainnet.address_len());
            prop_assert_eq!(normalized, format!("karlsen:{}", &payload[..PAYLOAD_LEN]));
        }

        #[test]
        fn prop_short_inputs_fail(payload in "[a-z0-9]{0,60}", testnet in any::<bool>()) {
            let network = Network::from_testnet_flag(testnet);
            let rejected = matches!(
                normalize(&payload, network),
                Err(Error::InvalidWallet { .. })
            );
            prop_assert!(rejected, "short payload {:?} was accepted", payload);
        }
    }
}
