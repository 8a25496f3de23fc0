use bitcoin::secp256k1::{All, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::taproot::{ControlBlock, LeafVersion, TaprootBuilder};
use bitcoin::{Address, Network, ScriptBuf};

use crate::{ContractError, ContractResult};

/// x coordinate of the point obtained by hashing the standard generator,
/// i.e. a key nobody knows the discrete log of.
const NUMS_X: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a,
    0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80,
    0x3a, 0xc0,
];

/// A taproot script-path commitment: the resulting address together with
/// everything a later witness needs to reveal one of its leaves.
#[derive(Debug, Clone)]
pub struct TaprootPayload {
    pub address: Address,
    pub control_block: ControlBlock,
    pub script: ScriptBuf,
    pub internal_key: XOnlyPublicKey,
}

impl TaprootPayload {
    /// Commit `scripts` (leaf per entry, first one revealed by
    /// `control_block`) under `internal_key` and get the P2TR address.
    pub fn build(
        secp: &Secp256k1<All>,
        internal_key: XOnlyPublicKey,
        scripts: &[ScriptBuf],
        network: Network,
    ) -> ContractResult<Self> {
        let mut builder = TaprootBuilder::new();
        let depth = if scripts.len() > 1 { 1 } else { 0 };
        for script in scripts {
            builder = builder
                .add_leaf(depth, script.clone())
                .map_err(|_| ContractError::TaprootCompute)?;
        }
        let spend_info = builder
            .finalize(secp, internal_key)
            .map_err(|_| ContractError::TaprootCompute)?;

        let address = Address::p2tr_tweaked(spend_info.output_key(), network);

        Ok(Self {
            control_block: spend_info
                .control_block(&(scripts[0].clone(), LeafVersion::TapScript))
                .ok_or(ContractError::TaprootCompute)?,
            script: scripts[0].clone(),
            internal_key,
            address,
        })
    }
}

/// Derive a provably unspendable internal key by tweaking the NUMS point
/// with a fresh key factor, so neither party holds a keyspend path.
pub fn unspendable_internal_key(
    secp: &Secp256k1<All>,
    factor: &SecretKey,
) -> ContractResult<XOnlyPublicKey> {
    let nums = XOnlyPublicKey::from_slice(&NUMS_X)?;
    let base = nums.public_key(Parity::Even);
    let tweaked = base.combine(&PublicKey::from_secret_key(secp, factor))?;
    Ok(tweaked.x_only_public_key().0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspendable_keys_differ_per_factor() {
        let secp = Secp256k1::new();
        let f1 = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let f2 = SecretKey::from_slice(&[0x22; 32]).unwrap();

        let k1 = unspendable_internal_key(&secp, &f1).unwrap();
        let k2 = unspendable_internal_key(&secp, &f2).unwrap();
        assert_ne!(k1, k2);
        // deterministic per factor
        assert_eq!(k1, unspendable_internal_key(&secp, &f1).unwrap());
    }
}
