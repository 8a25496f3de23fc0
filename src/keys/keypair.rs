use bitcoin::key::{TapTweak, UntweakedKeypair};
use bitcoin::secp256k1::{self, All, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::{Address, Network, PublicKey};

use crate::{ContractError, ContractResult};

/// The signature scheme a key is meant to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Ecdsa,
    Taproot,
}

/// A derived key: derivation path, private scalar and both public encodings.
///
/// The private scalar never leaves the pair; it is only exercised through the
/// scoped signing methods. The Schnorr public form is fixed at derivation
/// time: either the raw internal key (what tapscript leaves embed) or the
/// tweaked taproot output key (what addresses and keyspends use).
#[derive(Clone)]
pub struct KeyPair {
    path: String,
    network: Network,
    form: KeyType,
    secret: SecretKey,
    public: secp256k1::PublicKey,
    schnorr_public: XOnlyPublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("path", &self.path)
            .field("public", &self.public)
            .finish()
    }
}

impl KeyPair {
    pub(crate) fn new(
        secp: &Secp256k1<All>,
        network: Network,
        path: &str,
        secret: SecretKey,
        use_raw_schnorr: bool,
    ) -> Self {
        let keypair = UntweakedKeypair::from_secret_key(secp, &secret);
        let raw = keypair.x_only_public_key().0;
        let schnorr_public = if use_raw_schnorr {
            raw
        } else {
            keypair.tap_tweak(secp, None).to_inner().x_only_public_key().0
        };

        // BIP86 keys drive taproot spends, every other purpose signs ECDSA
        let form = match path.split('/').nth(1) {
            Some(purpose) if purpose.trim_end_matches(['\'', 'h']) == "86" => KeyType::Taproot,
            _ => KeyType::Ecdsa,
        };

        Self {
            path: path.to_string(),
            network,
            form,
            secret,
            public: secret.public_key(secp),
            schnorr_public,
        }
    }

    /// A throwaway pair outside any derivation tree, e.g. for escrow factors.
    #[cfg(feature = "rand")]
    pub fn random(secp: &Secp256k1<All>, network: Network) -> Self {
        let secret = SecretKey::new(&mut rand::thread_rng());
        Self::new(secp, network, "", secret, false)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn key_type(&self) -> KeyType {
        self.form
    }

    /// Compressed ECDSA public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.public)
    }

    /// Schnorr public key in the form selected at derivation.
    pub fn schnorr_public_key(&self) -> XOnlyPublicKey {
        self.schnorr_public
    }

    /// Raw internal x-only key, regardless of the selected Schnorr form.
    pub fn internal_key(&self, secp: &Secp256k1<All>) -> XOnlyPublicKey {
        UntweakedKeypair::from_secret_key(secp, &self.secret)
            .x_only_public_key()
            .0
    }

    pub fn p2tr_address(&self, secp: &Secp256k1<All>) -> Address {
        Address::p2tr(secp, self.internal_key(secp), None, self.network)
    }

    pub fn p2wpkh_address(&self) -> ContractResult<Address> {
        Address::p2wpkh(&self.public_key(), self.network)
            .map_err(|e| ContractError::TermWrongValue(e.to_string()))
    }

    pub fn p2pkh_address(&self) -> Address {
        Address::p2pkh(&self.public_key(), self.network)
    }

    pub fn p2shwpkh_address(&self) -> ContractResult<Address> {
        Address::p2shwpkh(&self.public_key(), self.network)
            .map_err(|e| ContractError::TermWrongValue(e.to_string()))
    }

    /// Schnorr signature with the raw internal key, for tapscript leaves.
    pub fn sign_tapscript(
        &self,
        secp: &Secp256k1<All>,
        sighash: [u8; 32],
    ) -> secp256k1::schnorr::Signature {
        let keypair = UntweakedKeypair::from_secret_key(secp, &self.secret);
        secp.sign_schnorr_no_aux_rand(&Message::from_digest(sighash), &keypair)
    }

    /// Schnorr signature with the tweaked output key, for taproot keyspends.
    pub fn sign_keyspend(
        &self,
        secp: &Secp256k1<All>,
        sighash: [u8; 32],
    ) -> secp256k1::schnorr::Signature {
        let keypair = UntweakedKeypair::from_secret_key(secp, &self.secret)
            .tap_tweak(secp, None)
            .to_inner();
        secp.sign_schnorr_no_aux_rand(&Message::from_digest(sighash), &keypair)
    }

    /// ECDSA signature over a segwit v0 sighash.
    pub fn sign_ecdsa(
        &self,
        secp: &Secp256k1<All>,
        sighash: [u8; 32],
    ) -> secp256k1::ecdsa::Signature {
        secp.sign_ecdsa(&Message::from_digest(sighash), &self.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(path: &str) -> KeyPair {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        KeyPair::new(&secp, Network::Testnet, path, secret, false)
    }

    #[test]
    fn test_should_infer_key_type_from_purpose() {
        assert_eq!(pair("m/86'/1'/0'/0/0").key_type(), KeyType::Taproot);
        assert_eq!(pair("m/84'/1'/0'/0/0").key_type(), KeyType::Ecdsa);
        assert_eq!(pair("m/44'/1'/0'/0/0").key_type(), KeyType::Ecdsa);
    }

    #[test]
    fn test_schnorr_form_selection() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let raw = KeyPair::new(&secp, Network::Testnet, "m/86'/1'/0'/0/0", secret, true);
        let tweaked = KeyPair::new(&secp, Network::Testnet, "m/86'/1'/0'/0/0", secret, false);

        assert_eq!(raw.schnorr_public_key(), raw.internal_key(&secp));
        assert_ne!(tweaked.schnorr_public_key(), tweaked.internal_key(&secp));
        // same key, same address, whatever public form was selected
        assert_eq!(
            raw.p2tr_address(&secp).to_string(),
            tweaked.p2tr_address(&secp).to_string()
        );
    }
}
