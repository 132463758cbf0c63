// Copyright 2025 - See NOTICE file for copyright holders.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Joint authorization of channel states.
//!
//! Both participants sign the EIP-712 hash of a `ChannelUpdate` and either
//! signature may sit in either slot. Everything that is not a well-formed,
//! low-`s` secp256k1 signature from the expected pair is simply invalid.

use alloc::borrow::Cow;
use alloc::string::String;
use alloy_primitives::{keccak256, B256, U256};
use alloy_sol_macro::sol;
use alloy_sol_types::{Eip712Domain, SolStruct};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::scalar::IsHigh;

use crate::channel::StateUpdate;

pub type EthAddress = alloy_primitives::Address;

pub const DOMAIN_NAME: &str = "PaymentChannel";
pub const DOMAIN_VERSION: &str = "1";

/// `r || s || v`
pub const SIGNATURE_LEN: usize = 65;

sol! {
    struct ChannelUpdate {
        string channelId;
        uint256 balanceA;
        uint256 balanceB;
        uint256 nonce;
    }
}

// domain returns the EIP-712 domain that every channel state is signed under.
pub fn domain(chain_id: u64) -> Eip712Domain {
    Eip712Domain::new(
        Some(Cow::Borrowed(DOMAIN_NAME)),
        Some(Cow::Borrowed(DOMAIN_VERSION)),
        Some(U256::from(chain_id)),
        None,
        None,
    )
}

// state_digest returns the hash both participants sign for the given update.
pub fn state_digest(domain: &Eip712Domain, channel_id: &str, update: &StateUpdate) -> B256 {
    let message = ChannelUpdate {
        channelId: String::from(channel_id),
        balanceA: U256::from(update.balance_a),
        balanceB: U256::from(update.balance_b),
        nonce: U256::from(update.nonce),
    };
    message.eip712_signing_hash(domain)
}

// address_of derives the Ethereum-style address of a public key.
pub fn address_of(key: &VerifyingKey) -> EthAddress {
    let point = key.to_encoded_point(false);
    // Skip the SEC1 tag byte.
    let hash = keccak256(&point.as_bytes()[1..]);
    EthAddress::from_slice(&hash[12..])
}

/// Recovers the address that produced `signature` over `digest`.
///
/// Returns `None` for anything that is not exactly 65 bytes, carries a
/// recovery byte outside `{0, 1, 27, 28}`, has an out-of-range `r` or `s`,
/// or uses the high-`s` form of an otherwise valid signature.
pub fn recover_signer(digest: &B256, signature: &[u8]) -> Option<EthAddress> {
    if signature.len() != SIGNATURE_LEN {
        return None;
    }
    let sig = Signature::from_slice(&signature[..64]).ok()?;
    if bool::from(sig.s().is_high()) {
        return None;
    }
    let v = match signature[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        _ => return None,
    };
    let recovery_id = RecoveryId::from_byte(v)?;
    let key = VerifyingKey::recover_from_prehash(digest.as_slice(), &sig, recovery_id).ok()?;
    Some(address_of(&key))
}

// verify_joint_signature accepts iff the two recovered signers are exactly
// the expected pair, in either order.
pub fn verify_joint_signature(
    digest: &B256,
    sig1: &[u8],
    sig2: &[u8],
    expected: (EthAddress, EthAddress),
) -> bool {
    let (a, b) = expected;
    match (recover_signer(digest, sig1), recover_signer(digest, sig2)) {
        (Some(first), Some(second)) => {
            (first == a && second == b) || (first == b && second == a)
        }
        _ => false,
    }
}
