use std::ops::RangeInclusive;

use bitcoin::bip32::ChildNumber;
use serde::Deserialize;

use super::KeyType;
use crate::{ContractError, ContractResult};

/// A named key-derivation scope: which subtree of the master key it covers
/// and whether its keys take part in reverse address lookup.
///
/// Profiles are parsed once from their JSON filter and never mutated. The
/// account/change/index bounds describe the finite search space a scanning
/// lookup would have to cover; the cache-only lookup implemented today uses
/// them for matching alone.
#[derive(Debug, Clone)]
pub struct DerivationProfile {
    pub key_type: KeyType,
    pub accounts: Vec<ChildNumber>,
    pub change: Vec<ChildNumber>,
    pub index_range: RangeInclusive<u32>,
    pub look_cache: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilter {
    look_cache: Option<bool>,
    key_type: Option<String>,
    accounts: Option<Vec<String>>,
    change: Option<Vec<String>>,
    index_range: Option<String>,
}

fn filter_err(detail: impl Into<String>) -> ContractError {
    ContractError::WrongKeyLookupFilter(detail.into())
}

/// Parse a single path component: a non-negative index with an optional
/// hardened marker (`'` or `h`).
pub(crate) fn parse_child_number(component: &str) -> Result<ChildNumber, String> {
    let (digits, hardened) = match component.strip_suffix(['\'', 'h']) {
        Some(digits) => (digits, true),
        None => (component, false),
    };
    let index: u32 = digits
        .parse()
        .map_err(|_| format!("non-numeric path component: {component}"))?;
    let child = if hardened {
        ChildNumber::from_hardened_idx(index)
    } else {
        ChildNumber::from_normal_idx(index)
    };
    child.map_err(|_| format!("path component out of range: {component}"))
}

impl DerivationProfile {
    /// Parse an `AddKeyType` filter document. Every field is required and
    /// unknown fields are rejected.
    pub fn from_filter(filter: &str) -> ContractResult<Self> {
        let raw: RawFilter = serde_json::from_str(filter).map_err(|e| filter_err(e.to_string()))?;

        let look_cache = raw.look_cache.ok_or_else(|| filter_err("look_cache is required"))?;
        let key_type = match raw
            .key_type
            .ok_or_else(|| filter_err("key_type is required"))?
            .as_str()
        {
            "ECDSA" => KeyType::Ecdsa,
            "TAPROOT" => KeyType::Taproot,
            other => return Err(filter_err(format!("unknown key_type: {other}"))),
        };

        let accounts = raw
            .accounts
            .ok_or_else(|| filter_err("accounts is required"))?
            .iter()
            .map(|c| parse_child_number(c).map_err(filter_err))
            .collect::<ContractResult<Vec<_>>>()?;
        let change = raw
            .change
            .ok_or_else(|| filter_err("change is required"))?
            .iter()
            .map(|c| parse_child_number(c).map_err(filter_err))
            .collect::<ContractResult<Vec<_>>>()?;

        let range_spec = raw
            .index_range
            .ok_or_else(|| filter_err("index_range is required"))?;
        let (lo, hi) = range_spec
            .split_once('-')
            .ok_or_else(|| filter_err(format!("index_range must be \"a-b\": {range_spec}")))?;
        let lo: u32 = lo
            .parse()
            .map_err(|_| filter_err(format!("bad index_range bound: {range_spec}")))?;
        let hi: u32 = hi
            .parse()
            .map_err(|_| filter_err(format!("bad index_range bound: {range_spec}")))?;
        if lo > hi {
            return Err(filter_err(format!("empty index_range: {range_spec}")));
        }

        Ok(Self {
            key_type,
            accounts,
            change,
            index_range: lo..=hi,
            look_cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILTER: &str = r#"{"look_cache":true, "key_type":"TAPROOT", "accounts":["0'"], "change":["0"], "index_range":"0-300"}"#;

    #[test]
    fn test_should_parse_a_complete_filter() {
        let profile = DerivationProfile::from_filter(FILTER).unwrap();
        assert!(profile.look_cache);
        assert_eq!(profile.key_type, KeyType::Taproot);
        assert_eq!(
            profile.accounts,
            vec![ChildNumber::from_hardened_idx(0).unwrap()]
        );
        assert_eq!(
            profile.change,
            vec![ChildNumber::from_normal_idx(0).unwrap()]
        );
        assert_eq!(profile.index_range, 0..=300);
    }

    #[test]
    fn test_should_reject_missing_key_type() {
        let err = DerivationProfile::from_filter(
            r#"{"look_cache":true, "accounts":["0'"], "change":["0"], "index_range":"0-300"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::WrongKeyLookupFilter(_)));
    }

    #[test]
    fn test_should_reject_malformed_filter_json() {
        // "key_type" present as a bare token, not a key-value pair
        let err = DerivationProfile::from_filter(
            r#"{"look_cache":true, "key_type", "accounts":["0'"], "change":["0"], "index_range":"0-300"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::WrongKeyLookupFilter(_)));
    }

    #[test]
    fn test_should_reject_unknown_fields_and_bad_ranges() {
        assert!(matches!(
            DerivationProfile::from_filter(
                r#"{"look_cache":true, "key_type":"ECDSA", "accounts":[], "change":[], "index_range":"0-10", "extra":1}"#,
            ),
            Err(ContractError::WrongKeyLookupFilter(_))
        ));
        assert!(matches!(
            DerivationProfile::from_filter(
                r#"{"look_cache":true, "key_type":"ECDSA", "accounts":[], "change":[], "index_range":"10-0"}"#,
            ),
            Err(ContractError::WrongKeyLookupFilter(_))
        ));
        assert!(matches!(
            DerivationProfile::from_filter(
                r#"{"look_cache":true, "key_type":"ECDSA", "accounts":["x"], "change":[], "index_range":"0-10"}"#,
            ),
            Err(ContractError::WrongKeyLookupFilter(_))
        ));
    }
}
