use std::str::FromStr;

use bitcoin::{Address, AddressType, Network};

use crate::{ContractError, ContractResult};

/// Script kind of a decoded address.
///
/// A P2WPKH nested in P2SH cannot be told apart from any other P2SH spend by
/// its address string, so both share the `P2sh` tag (and its dust row).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    P2pkh,
    P2sh,
    P2wpkh,
    P2tr,
}

impl AddressKind {
    /// Minimum economically spendable output amount for this script kind.
    pub fn dust_limit(&self) -> u64 {
        match self {
            AddressKind::P2tr => 330,
            AddressKind::P2wpkh => 294,
            AddressKind::P2sh => 540,
            AddressKind::P2pkh => 546,
        }
    }

    /// Virtual size a keyspend/witness input of this kind adds to a transaction.
    pub fn input_vsize(&self) -> u64 {
        match self {
            AddressKind::P2tr => 58,
            AddressKind::P2wpkh => 68,
            AddressKind::P2sh => 91,
            AddressKind::P2pkh => 148,
        }
    }

    /// Virtual size an output of this kind adds to a transaction.
    pub fn output_vsize(&self) -> u64 {
        match self {
            AddressKind::P2tr => 43,
            AddressKind::P2wpkh => 31,
            AddressKind::P2sh => 32,
            AddressKind::P2pkh => 34,
        }
    }
}

/// Decode an address string for the given network and resolve its script kind.
pub fn decode(addr: &str, network: Network) -> ContractResult<(Address, AddressKind)> {
    let address = Address::from_str(addr)
        .map_err(|e| ContractError::Parse(format!("address {addr}: {e}")))?
        .require_network(network)
        .map_err(|_| ContractError::Parse(format!("address {addr} does not fit {network}")))?;

    let kind = match address.address_type() {
        Some(AddressType::P2pkh) => AddressKind::P2pkh,
        Some(AddressType::P2sh) => AddressKind::P2sh,
        Some(AddressType::P2wpkh) => AddressKind::P2wpkh,
        Some(AddressType::P2tr) => AddressKind::P2tr,
        _ => {
            return Err(ContractError::TermWrongValue(format!(
                "unsupported address kind: {addr}"
            )))
        }
    };

    Ok((address, kind))
}

/// Enforce the dust policy for `amount` sent to `addr`.
///
/// Runs at the setter call that binds the amount to the address, never later.
pub fn check_dust(field: &'static str, amount: u64, kind: AddressKind) -> ContractResult<()> {
    let threshold = kind.dust_limit();
    if amount < threshold {
        return Err(ContractError::Dust {
            field,
            threshold,
            given: amount,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const P2TR: &str = "bcrt1pm7l3k3ahhfqpzv9nlcc390esx8afn4kgccmcrzzvr8cqdq63kxxqwqqp2f";
    const P2WPKH: &str = "bc1q9vza2e8x573nczrlzms0wvx3gsqjx7vavgkx0l";
    const P2PKH: &str = "1BitcoinEaterAddressDontSendf59kuE";
    const P2SH: &str = "3P14159f73E4gFr7JterCCQh9QjiTjiZrG";

    #[test]
    fn test_should_resolve_address_kinds() {
        assert_eq!(
            decode(P2TR, Network::Regtest).unwrap().1,
            AddressKind::P2tr
        );
        assert_eq!(
            decode(P2WPKH, Network::Bitcoin).unwrap().1,
            AddressKind::P2wpkh
        );
        assert_eq!(
            decode(P2PKH, Network::Bitcoin).unwrap().1,
            AddressKind::P2pkh
        );
        assert_eq!(decode(P2SH, Network::Bitcoin).unwrap().1, AddressKind::P2sh);
    }

    #[test]
    fn test_should_reject_address_on_wrong_network() {
        assert!(matches!(
            decode(P2WPKH, Network::Regtest),
            Err(ContractError::Parse(_))
        ));
    }

    #[test]
    fn test_should_enforce_dust_thresholds_at_the_boundary() {
        for (kind, limit) in [
            (AddressKind::P2tr, 330),
            (AddressKind::P2wpkh, 294),
            (AddressKind::P2sh, 540),
            (AddressKind::P2pkh, 546),
        ] {
            assert!(check_dust("amount", limit, kind).is_ok());
            let err = check_dust("amount", limit - 1, kind).unwrap_err();
            match err {
                ContractError::Dust {
                    threshold, given, ..
                } => {
                    assert_eq!(threshold, limit);
                    assert_eq!(given, limit - 1);
                }
                other => panic!("expected dust error, got {other}"),
            }
        }
    }
}
