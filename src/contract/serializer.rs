//! Versioned JSON interchange shared by the builder family.
//!
//! Every contract travels as `{"contract_type": <tag>, "params": {...}}`.
//! Params structs keep their field order stable so a document re-emitted by
//! a counterpart is byte-for-byte identical within one protocol version.

use std::ops::RangeInclusive;

use bitcoin::{Network, Witness};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::address::AddressKind;
use crate::contract::builder::{Destination, DestinationRole, UtxoRef};
use crate::utils::parse_txid;
use crate::{ContractError, ContractResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractDocument<P> {
    pub contract_type: String,
    pub params: P,
}

/// Emit a contract document of `contract_type`.
pub fn serialize<P: Serialize>(contract_type: &str, params: &P) -> ContractResult<String> {
    Ok(serde_json::to_string(&ContractDocument {
        contract_type: contract_type.to_string(),
        params,
    })?)
}

/// Parse a contract document, checking its type tag.
pub fn deserialize<P: DeserializeOwned>(json: &str, contract_type: &str) -> ContractResult<P> {
    let doc: ContractDocument<serde_json::Value> = serde_json::from_str(json)?;
    if doc.contract_type != contract_type {
        return Err(ContractError::TermMismatch(format!(
            "contract_type is {} where {contract_type} was expected",
            doc.contract_type
        )));
    }
    Ok(serde_json::from_value(doc.params)?)
}

/// Reject serialization requests for protocol versions outside `supported`.
pub fn check_protocol_version(version: u32, supported: &RangeInclusive<u32>) -> ContractResult<()> {
    if !supported.contains(&version) {
        return Err(ContractError::ProtocolVersion(version));
    }
    Ok(())
}

fn kind_tag(kind: AddressKind) -> &'static str {
    match kind {
        AddressKind::P2wpkh | AddressKind::P2tr => "p2witness",
        AddressKind::P2pkh => "p2pkh",
        AddressKind::P2sh => "p2sh",
    }
}

fn check_kind_tag(tag: &str, kind: AddressKind, addr: &str) -> ContractResult<()> {
    let matches = match tag {
        "p2witness" => matches!(kind, AddressKind::P2wpkh | AddressKind::P2tr),
        "p2pkh" => kind == AddressKind::P2pkh,
        "p2sh" => kind == AddressKind::P2sh,
        _ => {
            return Err(ContractError::Parse(format!(
                "unknown destination type: {tag}"
            )))
        }
    };
    if !matches {
        return Err(ContractError::Parse(format!(
            "address {addr} does not decode as {tag}"
        )));
    }
    Ok(())
}

/// An output as it travels in a contract document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationJson {
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: u64,
    pub addr: String,
}

impl DestinationJson {
    pub fn of(destination: &Destination) -> Self {
        Self {
            kind: kind_tag(destination.kind).to_string(),
            amount: destination.amount,
            addr: destination.address.to_string(),
        }
    }

    /// Decode back into a dust-validated [`Destination`], checking the
    /// claimed type tag against the resolved script kind.
    pub fn to_destination(
        &self,
        role: DestinationRole,
        field: &'static str,
        network: Network,
    ) -> ContractResult<Destination> {
        let destination = Destination::new(role, field, self.amount, &self.addr, network)?;
        check_kind_tag(&self.kind, destination.kind, &self.addr)?;
        Ok(destination)
    }
}

/// A spent output as it travels in a contract document: the outpoint, the
/// destination it was locked to, and the witness once a signer filled it.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoJson {
    #[serde(rename = "type")]
    pub kind: String,
    pub txid: String,
    pub nout: u32,
    pub destination: DestinationJson,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<Vec<serde_with::hex::Hex>>")]
    pub witness: Option<Vec<Vec<u8>>>,
}

impl UtxoJson {
    pub fn of(utxo: &UtxoRef) -> Self {
        Self {
            kind: "utxo".to_string(),
            txid: utxo.txid.to_string(),
            nout: utxo.nout,
            destination: DestinationJson {
                kind: kind_tag(utxo.kind).to_string(),
                amount: utxo.amount,
                addr: utxo.address.to_string(),
            },
            witness: utxo
                .witness
                .as_ref()
                .map(|w| w.iter().map(|item| item.to_vec()).collect()),
        }
    }

    pub fn to_utxo(&self, field: &'static str, network: Network) -> ContractResult<UtxoRef> {
        if self.kind != "utxo" {
            return Err(ContractError::Parse(format!(
                "unknown utxo type: {}",
                self.kind
            )));
        }
        let mut utxo = UtxoRef::new(
            field,
            &self.txid,
            self.nout,
            self.destination.amount,
            &self.destination.addr,
            network,
        )?;
        check_kind_tag(&self.destination.kind, utxo.kind, &self.destination.addr)?;
        utxo.witness = self.witness.as_ref().map(|stack| {
            let items: Vec<&[u8]> = stack.iter().map(|item| item.as_slice()).collect();
            Witness::from_slice(&items)
        });
        Ok(utxo)
    }
}

/// A bare transfer term of the inscription/swap contracts: outpoint, amount,
/// source address and the signature of its signing stage.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferJson {
    pub txid: String,
    pub nout: u32,
    pub amount: u64,
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub sig: Option<Vec<u8>>,
}

impl TransferJson {
    pub fn of(utxo: &UtxoRef) -> Self {
        Self {
            txid: utxo.txid.to_string(),
            nout: utxo.nout,
            amount: utxo.amount,
            addr: utxo.address.to_string(),
            sig: utxo
                .witness
                .as_ref()
                .and_then(|w| w.nth(0))
                .map(|sig| sig.to_vec()),
        }
    }

    pub fn to_utxo(&self, field: &'static str, network: Network) -> ContractResult<UtxoRef> {
        let mut utxo = UtxoRef::new(field, &self.txid, self.nout, self.amount, &self.addr, network)?;
        if let Some(sig) = &self.sig {
            utxo.witness = Some(Witness::from_slice(&[sig.as_slice()]));
        }
        Ok(utxo)
    }
}

/// Parse a hex field into an x-only public key, naming the field on failure.
pub fn parse_xonly(
    field: &'static str,
    hex_pk: &str,
) -> ContractResult<bitcoin::secp256k1::XOnlyPublicKey> {
    let bytes = hex::decode(hex_pk)
        .map_err(|e| ContractError::TermWrongValue(format!("{field}: {e}")))?;
    bitcoin::secp256k1::XOnlyPublicKey::from_slice(&bytes)
        .map_err(|e| ContractError::TermWrongValue(format!("{field}: {e}")))
}

/// Parse a hex field into a 64-byte Schnorr signature.
pub fn parse_schnorr_sig(
    field: &'static str,
    bytes: &[u8],
) -> ContractResult<bitcoin::secp256k1::schnorr::Signature> {
    bitcoin::secp256k1::schnorr::Signature::from_slice(bytes)
        .map_err(|e| ContractError::TermWrongValue(format!("{field}: {e}")))
}

/// Validate a txid field without building a full reference.
pub fn check_txid(s: &str) -> ContractResult<()> {
    parse_txid(s).map(|_| ())
}
