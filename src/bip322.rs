//! Generic signed-message construction and verification (BIP322).
//!
//! A message is bound to an address by a pair of virtual transactions: a
//! "to-spend" transaction whose single output carries the address script and
//! whose input commits to the tagged message hash, and a "to-sign"
//! transaction spending it to `OP_RETURN`. The signature blob is the
//! consensus-encoded witness stack of the to-sign input.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::Builder as ScriptBuilder;
use bitcoin::secp256k1::{ecdsa, schnorr, Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, Network, OutPoint, ScriptBuf, Sequence, TapSighashType, Transaction,
    TxIn, TxOut, Txid, Witness,
};

use crate::address::{self, AddressKind};
use crate::keys::KeyRegistry;
use crate::utils::{bytes_to_push_bytes, h160sum, sha256sum};
use crate::{ContractError, ContractResult};

const MESSAGE_TAG: &[u8] = b"BIP0322-signed-message";

/// Stand-alone message-signature verifier bound to one network.
#[derive(Debug, Clone, Copy)]
pub struct Bip322 {
    network: Network,
}

impl Bip322 {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    /// Tagged hash of the message, per the signed-message scheme.
    pub fn message_hash(message: &[u8]) -> Vec<u8> {
        let tag = sha256sum(MESSAGE_TAG);
        let mut preimage = Vec::with_capacity(tag.len() * 2 + message.len());
        preimage.extend_from_slice(&tag);
        preimage.extend_from_slice(&tag);
        preimage.extend_from_slice(message);
        sha256sum(&preimage)
    }

    fn to_spend_tx(&self, message: &[u8], addr: &str) -> ContractResult<Transaction> {
        let (address, _) = address::decode(addr, self.network)?;
        let msg_hash = Self::message_hash(message);

        Ok(Transaction {
            version: Version(0),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::all_zeros(),
                    vout: 0xffffffff,
                },
                script_sig: ScriptBuilder::new()
                    .push_int(0)
                    .push_slice(bytes_to_push_bytes(&msg_hash)?.as_push_bytes())
                    .into_script(),
                sequence: Sequence::ZERO,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::ZERO,
                script_pubkey: address.script_pubkey(),
            }],
        })
    }

    fn to_sign_tx(&self, to_spend_txid: Txid) -> Transaction {
        Transaction {
            version: Version(0),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: to_spend_txid,
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ZERO,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuilder::new().push_opcode(OP_RETURN).into_script(),
            }],
        }
    }

    /// Sign `message` for `addr` with a key resolved through the registry.
    /// Returns the consensus-encoded witness stack.
    pub fn sign(
        &self,
        registry: &KeyRegistry,
        profile: &str,
        addr: &str,
        message: &[u8],
    ) -> ContractResult<Vec<u8>> {
        let (address, kind) = address::decode(addr, self.network)?;
        let keypair = registry.lookup(addr, profile)?;

        let to_spend = self.to_spend_tx(message, addr)?;
        let to_sign = self.to_sign_tx(to_spend.txid());
        let prevout = TxOut {
            value: Amount::ZERO,
            script_pubkey: address.script_pubkey(),
        };

        let witness = match kind {
            AddressKind::P2tr => {
                let mut cache = SighashCache::new(&to_sign);
                let sighash = cache.taproot_key_spend_signature_hash(
                    0,
                    &Prevouts::All(&[prevout]),
                    TapSighashType::Default,
                )?;
                let sig = keypair.sign_keyspend(registry.secp(), sighash.to_byte_array());
                Witness::from_slice(&[sig.serialize().as_slice()])
            }
            AddressKind::P2wpkh => {
                let mut cache = SighashCache::new(&to_sign);
                let sighash = cache.p2wpkh_signature_hash(
                    0,
                    &prevout.script_pubkey,
                    Amount::ZERO,
                    EcdsaSighashType::All,
                )?;
                let sig = keypair.sign_ecdsa(registry.secp(), sighash.to_byte_array());
                let sig = bitcoin::ecdsa::Signature::sighash_all(sig);
                Witness::p2wpkh(&sig, &keypair.public_key().inner)
            }
            _ => {
                return Err(ContractError::Parse(format!(
                    "unsupported address kind for message signing: {addr}"
                )))
            }
        };

        debug!("to_sign witness: {witness:?}");

        Ok(bitcoin::consensus::encode::serialize(&witness))
    }

    /// Check `sig` against `addr` and `message`.
    ///
    /// A cryptographically failing signature is a normal `false`; only a
    /// structurally malformed blob, address or unsupported address kind is
    /// an error.
    pub fn verify(&self, sig: &[u8], addr: &str, message: &[u8]) -> ContractResult<bool> {
        let (address, kind) = address::decode(addr, self.network)?;
        let witness: Witness = bitcoin::consensus::encode::deserialize(sig)
            .map_err(|e| ContractError::Parse(format!("witness stack: {e}")))?;

        let to_spend = self.to_spend_tx(message, addr)?;
        let to_sign = self.to_sign_tx(to_spend.txid());
        let prevout = TxOut {
            value: Amount::ZERO,
            script_pubkey: address.script_pubkey(),
        };

        let secp = Secp256k1::new();
        match kind {
            AddressKind::P2tr => {
                let sig_bytes = witness
                    .nth(0)
                    .ok_or_else(|| ContractError::Parse("empty witness stack".to_string()))?;
                let (sig_bytes, sighash_type) = match sig_bytes.len() {
                    64 => (sig_bytes, TapSighashType::Default),
                    65 if sig_bytes[64] == TapSighashType::All as u8 => {
                        (&sig_bytes[..64], TapSighashType::All)
                    }
                    _ => {
                        return Err(ContractError::Parse(
                            "unexpected taproot signature encoding".to_string(),
                        ))
                    }
                };
                let sig = schnorr::Signature::from_slice(sig_bytes)
                    .map_err(|e| ContractError::Parse(e.to_string()))?;

                let spk = prevout.script_pubkey.clone();
                let output_key = XOnlyPublicKey::from_slice(&spk.as_bytes()[2..34])
                    .map_err(|e| ContractError::Parse(e.to_string()))?;

                let mut cache = SighashCache::new(&to_sign);
                let sighash = cache.taproot_key_spend_signature_hash(
                    0,
                    &Prevouts::All(&[prevout]),
                    sighash_type,
                )?;
                Ok(secp
                    .verify_schnorr(
                        &sig,
                        &Message::from_digest(sighash.to_byte_array()),
                        &output_key,
                    )
                    .is_ok())
            }
            AddressKind::P2wpkh => {
                if witness.len() != 2 {
                    return Err(ContractError::Parse(
                        "p2wpkh witness must carry a signature and a key".to_string(),
                    ));
                }
                let sig_bytes = witness.nth(0).expect("len checked");
                let key_bytes = witness.nth(1).expect("len checked");

                let (sighash_type, der) = sig_bytes
                    .split_last()
                    .ok_or_else(|| ContractError::Parse("empty signature".to_string()))?;
                if *sighash_type != EcdsaSighashType::All as u8 {
                    return Err(ContractError::Parse(
                        "unexpected ecdsa sighash type".to_string(),
                    ));
                }
                let sig = ecdsa::Signature::from_der(der)
                    .map_err(|e| ContractError::Parse(e.to_string()))?;
                let pubkey = bitcoin::secp256k1::PublicKey::from_slice(key_bytes)
                    .map_err(|e| ContractError::Parse(e.to_string()))?;

                // the witness key must hash to the address program
                let program = &prevout.script_pubkey.as_bytes()[2..22];
                if h160sum(&pubkey.serialize()).as_slice() != program {
                    return Ok(false);
                }

                let mut cache = SighashCache::new(&to_sign);
                let sighash = cache.p2wpkh_signature_hash(
                    0,
                    &prevout.script_pubkey,
                    Amount::ZERO,
                    EcdsaSighashType::All,
                )?;
                Ok(secp
                    .verify_ecdsa(
                        &Message::from_digest(sighash.to_byte_array()),
                        &sig,
                        &pubkey,
                    )
                    .is_ok())
            }
            _ => Err(ContractError::Parse(format!(
                "unsupported address kind for message verification: {addr}"
            ))),
        }
    }
}
