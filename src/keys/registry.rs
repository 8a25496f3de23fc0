use std::collections::HashMap;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{All, Secp256k1, XOnlyPublicKey};
use bitcoin::Network;
use parking_lot::RwLock;

use super::profile::parse_child_number;
use super::{DerivationProfile, KeyPair, KeyType};
use crate::{ContractError, ContractResult};

/// Process-lifetime key store: a BIP32 master seed, named derivation
/// profiles and an explicit (address, profile) → keypair lookup cache.
///
/// Profiles are registered during setup and read-only afterwards. The cache
/// supports concurrent readers; inserts are idempotent per key, so
/// last-writer-wins between racing `add_key_to_cache` calls is acceptable.
pub struct KeyRegistry {
    network: Network,
    secp: Secp256k1<All>,
    master: Xpriv,
    profiles: HashMap<String, DerivationProfile>,
    cache: RwLock<HashMap<(String, String), KeyPair>>,
}

impl KeyRegistry {
    /// Seed a registry. `seed_hex` must be hex of a length BIP32 accepts
    /// (16 to 64 bytes).
    pub fn new(network: Network, seed_hex: &str) -> ContractResult<Self> {
        let seed = hex::decode(seed_hex)
            .map_err(|e| ContractError::InvalidSeed(format!("not a hex string: {e}")))?;
        if !(16..=64).contains(&seed.len()) {
            return Err(ContractError::InvalidSeed(format!(
                "seed must be 16..=64 bytes, got {}",
                seed.len()
            )));
        }
        let master = Xpriv::new_master(network, &seed)
            .map_err(|e| ContractError::InvalidSeed(e.to_string()))?;

        Ok(Self {
            network,
            secp: Secp256k1::new(),
            master,
            profiles: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub(crate) fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Register a named derivation profile from its JSON filter.
    pub fn add_key_type(&mut self, name: &str, filter: &str) -> ContractResult<()> {
        if self.profiles.contains_key(name) {
            return Err(ContractError::DuplicateProfile(name.to_string()));
        }
        let profile = DerivationProfile::from_filter(filter)?;
        self.profiles.insert(name.to_string(), profile);
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Option<&DerivationProfile> {
        self.profiles.get(name)
    }

    /// Derive the key at `path` (`m/<idx>['][/<idx>[']]*`).
    ///
    /// `use_raw_schnorr` selects the pair's Schnorr public form: the raw
    /// internal key (`true`, tapscript use) or the tweaked taproot output
    /// key (`false`, addresses and keyspends). Mixing forms across callers
    /// of the same key is a correctness hazard; profiles document which
    /// form their consumers expect.
    pub fn derive(&self, path: &str, use_raw_schnorr: bool) -> ContractResult<KeyPair> {
        let components = parse_path(path)?;
        let derived = self
            .master
            .derive_priv(&self.secp, &DerivationPath::from(components))
            .map_err(|e| ContractError::WrongDerivationPath(e.to_string()))?;

        Ok(KeyPair::new(
            &self.secp,
            self.network,
            path,
            derived.private_key,
            use_raw_schnorr,
        ))
    }

    /// Insert `keypair` into the lookup cache under every address kind it
    /// supports, for each cache-enabled profile of its key type. No-op when
    /// no profile matches.
    pub fn add_key_to_cache(&self, keypair: &KeyPair) -> ContractResult<()> {
        let mut entries = Vec::new();
        for (name, profile) in &self.profiles {
            if !profile.look_cache || profile.key_type != keypair.key_type() {
                continue;
            }
            match profile.key_type {
                KeyType::Taproot => {
                    entries.push((keypair.p2tr_address(&self.secp).to_string(), name.clone()));
                }
                KeyType::Ecdsa => {
                    entries.push((keypair.p2wpkh_address()?.to_string(), name.clone()));
                    entries.push((keypair.p2pkh_address().to_string(), name.clone()));
                    entries.push((keypair.p2shwpkh_address()?.to_string(), name.clone()));
                }
            }
        }

        let mut cache = self.cache.write();
        for (address, name) in entries {
            cache.insert((address, name), keypair.clone());
        }
        Ok(())
    }

    /// Exact-match cache read. Never derives or scans; populating the cache
    /// is the caller's responsibility via [`Self::add_key_to_cache`].
    pub fn lookup(&self, address: &str, profile: &str) -> ContractResult<KeyPair> {
        self.cache
            .read()
            .get(&(address.to_string(), profile.to_string()))
            .cloned()
            .ok_or_else(|| {
                ContractError::KeyNotFound(format!("{address} under profile {profile}"))
            })
    }

    /// Cache read by Schnorr public key, for signers identified by a script
    /// key rather than an address.
    pub fn lookup_schnorr(
        &self,
        pubkey: &XOnlyPublicKey,
        profile: &str,
    ) -> ContractResult<KeyPair> {
        self.cache
            .read()
            .iter()
            .find(|((_, name), keypair)| {
                name == profile
                    && (keypair.schnorr_public_key() == *pubkey
                        || keypair.internal_key(&self.secp) == *pubkey)
            })
            .map(|(_, keypair)| keypair.clone())
            .ok_or_else(|| {
                ContractError::KeyNotFound(format!("schnorr key under profile {profile}"))
            })
    }
}

fn parse_path(path: &str) -> ContractResult<Vec<ChildNumber>> {
    let mut parts = path.split('/');
    if !matches!(parts.next(), Some("m" | "M")) {
        return Err(ContractError::WrongDerivationPath(format!(
            "path must start with m/: {path}"
        )));
    }

    let components = parts
        .map(|c| parse_child_number(c).map_err(ContractError::WrongDerivationPath))
        .collect::<ContractResult<Vec<_>>>()?;
    if components.is_empty() {
        return Err(ContractError::WrongDerivationPath("empty path".to_string()));
    }
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "b37f263befa23efb352f0ba45a5e452363963fabc64c946a75df155244630ebaa1ac8056b873e79232486d5dd36809f8925c9c5ac8322f5380940badc64cc6fe";
    const TAPROOT_FILTER: &str = r#"{"look_cache":true, "key_type":"TAPROOT", "accounts":["0'"], "change":["0"], "index_range":"0-300"}"#;
    const ECDSA_FILTER: &str = r#"{"look_cache":true, "key_type":"ECDSA", "accounts":["0'"], "change":["0","1"], "index_range":"0-100"}"#;

    fn registry() -> KeyRegistry {
        KeyRegistry::new(Network::Testnet, SEED).unwrap()
    }

    #[test]
    fn test_should_reject_invalid_seeds() {
        assert!(matches!(
            KeyRegistry::new(Network::Testnet, "zz"),
            Err(ContractError::InvalidSeed(_))
        ));
        assert!(matches!(
            KeyRegistry::new(Network::Testnet, "abc"),
            Err(ContractError::InvalidSeed(_))
        ));
        // valid hex, too short to seed BIP32
        assert!(matches!(
            KeyRegistry::new(Network::Testnet, "00112233"),
            Err(ContractError::InvalidSeed(_))
        ));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let registry = registry();
        let a = registry.derive("m/86'/1'/0'/0/300", false).unwrap();
        let b = registry.derive("m/86'/1'/0'/0/300", false).unwrap();
        let c = registry.derive("m/86'/1'/0'/0/301", false).unwrap();

        assert_eq!(a.schnorr_public_key(), b.schnorr_public_key());
        assert_eq!(
            a.p2tr_address(registry.secp()).to_string(),
            b.p2tr_address(registry.secp()).to_string()
        );
        assert_ne!(a.schnorr_public_key(), c.schnorr_public_key());
    }

    #[test]
    fn test_should_reject_wrong_derivation_paths() {
        let registry = registry();
        for path in ["m/a'/b'/z'/0/300", "", "m", "86'/1'", "m/86'/x"] {
            assert!(
                matches!(
                    registry.derive(path, false),
                    Err(ContractError::WrongDerivationPath(_))
                ),
                "path {path:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_cache_roundtrip_through_matching_profile() {
        let mut registry = registry();
        registry.add_key_type("market", TAPROOT_FILTER).unwrap();

        let keypair = registry.derive("m/86'/1'/0'/0/300", false).unwrap();
        let address = keypair.p2tr_address(registry.secp()).to_string();

        registry.add_key_to_cache(&keypair).unwrap();

        let found = registry.lookup(&address, "market").unwrap();
        assert_eq!(found.schnorr_public_key(), keypair.schnorr_public_key());

        // profile mismatch and unknown address both miss
        assert!(matches!(
            registry.lookup(&address, "other"),
            Err(ContractError::KeyNotFound(_))
        ));
        assert!(matches!(
            registry.lookup("tb1qax89amll2uas5k92tmuc8rdccmqddqw94vrr86", "market"),
            Err(ContractError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_cache_skips_profiles_of_other_key_types() {
        let mut registry = registry();
        registry.add_key_type("funds", ECDSA_FILTER).unwrap();

        // a taproot key does not land in an ECDSA profile's cache
        let keypair = registry.derive("m/86'/1'/0'/0/1", false).unwrap();
        registry.add_key_to_cache(&keypair).unwrap();
        let address = keypair.p2tr_address(registry.secp()).to_string();
        assert!(matches!(
            registry.lookup(&address, "funds"),
            Err(ContractError::KeyNotFound(_))
        ));

        // an ECDSA key lands under all three of its address kinds
        let keypair = registry.derive("m/84'/1'/0'/0/1", false).unwrap();
        registry.add_key_to_cache(&keypair).unwrap();
        for address in [
            keypair.p2wpkh_address().unwrap().to_string(),
            keypair.p2pkh_address().to_string(),
            keypair.p2shwpkh_address().unwrap().to_string(),
        ] {
            let found = registry.lookup(&address, "funds").unwrap();
            assert_eq!(found.public_key(), keypair.public_key());
        }
    }

    #[test]
    fn test_should_reject_duplicate_profiles() {
        let mut registry = registry();
        registry.add_key_type("market", TAPROOT_FILTER).unwrap();
        assert!(matches!(
            registry.add_key_type("market", TAPROOT_FILTER),
            Err(ContractError::DuplicateProfile(_))
        ));
    }

    #[test]
    fn test_lookup_by_schnorr_key() {
        let mut registry = registry();
        registry.add_key_type("market", TAPROOT_FILTER).unwrap();

        let keypair = registry.derive("m/86'/1'/0'/0/7", true).unwrap();
        registry.add_key_to_cache(&keypair).unwrap();

        let found = registry
            .lookup_schnorr(&keypair.schnorr_public_key(), "market")
            .unwrap();
        assert_eq!(found.public_key(), keypair.public_key());
    }

    #[test]
    fn test_seed_from_mnemonic() {
        use bip39::Mnemonic;

        let mnemonic = Mnemonic::parse(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        let seed = hex::encode(mnemonic.to_seed(""));
        let registry = KeyRegistry::new(Network::Bitcoin, &seed).unwrap();
        // BIP86 test vector: first receive address of the reference mnemonic
        let keypair = registry.derive("m/86'/0'/0'/0/0", false).unwrap();
        assert_eq!(
            keypair.p2tr_address(registry.secp()).to_string(),
            "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr"
        );
    }
}
