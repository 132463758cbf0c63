// Copyright 2024 - See NOTICE file for copyright holders.
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
#![cfg(test)]
pub mod ethsig {
    use alloy_primitives::B256;
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::ecdsa::{RecoveryId, Signature as k256Signature, SigningKey, VerifyingKey};
    use k256::Scalar;
    use sha3::{Digest, Keccak256};

    use crate::auth::EthAddress;

    pub type Signature = [u8; 65];

    pub struct EthSigner {
        skey: SigningKey,
        pubkey: VerifyingKey,
        addr: [u8; 20],
    }

    // Derived independently of the contract code so the two can be checked
    // against each other.
    fn address_bytes(key: &VerifyingKey) -> [u8; 20] {
        let pk_bytes = key.to_encoded_point(false);
        // The first byte is the SEC1 tag, not part of the key.
        let hash: [u8; 32] = Keccak256::digest(&pk_bytes.as_bytes()[1..]).into();
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&hash[32 - 20..]);
        addr
    }

    impl EthSigner {
        pub fn init_from_key(skey: SigningKey) -> Self {
            let pubkey = *skey.verifying_key();
            let addr = address_bytes(&pubkey);
            Self { skey, pubkey, addr }
        }

        /// A deterministic signer; distinct seeds give distinct keys.
        pub fn from_seed(seed: u8) -> Self {
            let mut secret = [0u8; 32];
            secret[0] = 0x5e;
            secret[31] = seed;
            Self::init_from_key(SigningKey::from_slice(&secret).unwrap())
        }

        /// A signer from a hex-encoded 32-byte secret key.
        pub fn from_hex(secret: &str) -> Self {
            let secret = hex::decode(secret).unwrap();
            Self::init_from_key(SigningKey::from_slice(&secret).unwrap())
        }

        pub fn random() -> Self {
            Self::init_from_key(SigningKey::random(&mut rand::thread_rng()))
        }

        pub fn address(&self) -> EthAddress {
            EthAddress::from(self.addr)
        }

        pub fn address_bytes(&self) -> [u8; 20] {
            self.addr
        }

        /// Signs an already domain-separated digest as `r || s || v`, `v = 27 + recovery id`.
        pub fn sign_digest(&self, digest: &B256) -> Signature {
            let sig: k256Signature = self.skey.sign_prehash(digest.as_slice()).unwrap();
            // k256 only ever produces low-s signatures.
            let mut sig_bytes = [0u8; 65];
            sig_bytes[..64].copy_from_slice(&sig.to_bytes());

            // sign_prehash does not return v, so find the recovery id that
            // gives back our key.
            let rec_id = self.compute_recovery_id(digest.as_slice(), &sig);
            sig_bytes[64] = rec_id + 27;
            sig_bytes
        }

        fn compute_recovery_id(&self, hash: &[u8], sig: &k256Signature) -> u8 {
            let rec_id_0 =
                VerifyingKey::recover_from_prehash(hash, sig, RecoveryId::new(false, false));
            let rec_id_1 =
                VerifyingKey::recover_from_prehash(hash, sig, RecoveryId::new(true, false));

            match (rec_id_0, rec_id_1) {
                (Ok(pubkey_0), _) if pubkey_0 == self.pubkey => 0,
                (_, Ok(pubkey_1)) if pubkey_1 == self.pubkey => 1,
                _ => panic!("Failed to recover public key"),
            }
        }

        /// The malleated twin of a signature: same `r`, `s` replaced by `n - s`
        /// and the recovery parity flipped. Mathematically valid, but non-canonical.
        pub fn high_s_twin(sig: &Signature) -> Signature {
            let parsed = k256Signature::from_slice(&sig[..64]).unwrap();
            let r: Scalar = *parsed.r().as_ref();
            let s: Scalar = *parsed.s().as_ref();
            let twin = k256Signature::from_scalars(r.to_bytes(), (-s).to_bytes()).unwrap();

            let mut out = [0u8; 65];
            out[..64].copy_from_slice(&twin.to_bytes());
            out[64] = if sig[64] == 27 { 28 } else { 27 };
            out
        }
    }

    #[test]
    fn address_matches_contract_derivation() {
        for _ in 0..4 {
            let signer = EthSigner::random();
            assert_eq!(crate::auth::address_of(&signer.pubkey), signer.address());
        }
    }

    #[test]
    fn signatures_recover_to_signer() {
        let signer = EthSigner::random();
        let digest = B256::repeat_byte(0x42);
        let sig = signer.sign_digest(&digest);
        assert!(sig[64] == 27 || sig[64] == 28);
        assert_eq!(
            crate::auth::recover_signer(&digest, &sig),
            Some(signer.address())
        );
    }

    #[test]
    fn known_key_has_known_address() {
        let signer = EthSigner::from_hex(
            "0000000000000000000000000000000000000000000000000000000000000001",
        );
        assert_eq!(
            hex::encode(signer.address_bytes()),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }
}
