use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_ENDIF, OP_IF};
use bitcoin::opcodes::{OP_0, OP_FALSE};
use bitcoin::script::Builder as ScriptBuilder;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::Version;
use bitcoin::{
    Network, ScriptBuf, Sequence, TapLeafHash, TapSighashType, Transaction, TxIn, TxOut, Witness,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::address::{self, AddressKind};
use crate::contract::builder::{ContractState, DestinationRole, Phase};
use crate::contract::serializer::{self, DestinationJson, TransferJson};
use crate::keys::KeyRegistry;
use crate::utils::fees::{estimate_vsize, fee_for_vsize, tapscript_spend_vin_vsize, TX_BASE_VSIZE};
use crate::utils::taproot::TaprootPayload;
use crate::utils::{bytes_to_push_bytes, CONTENT_TYPE_TAG, PROTOCOL_ID};
use crate::{ContractError, ContractResult};

/// Maximum bytes of a single data push inside the envelope.
const CHUNK_SIZE: usize = 520;

/// Serialization stage of an inscription contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InscribePhase {
    Terms,
    Signature,
}

/// Builder for the two-transaction commit/reveal inscription pattern.
///
/// The commit transaction funds a taproot output whose script tree embeds
/// the content envelope; the reveal transaction spends it through the script
/// path, exposing the content on chain and delivering the inscribed output
/// to its destination. Commit and reveal signing are separate stages so a
/// party may fund now and reveal later, or delegate each to different keys.
#[derive(Debug, Clone)]
pub struct CreateInscriptionBuilder {
    state: ContractState,
    content_type: Option<String>,
    content: Option<Vec<u8>>,
    inscribe_script_pk: Option<XOnlyPublicKey>,
    inscribe_int_pk: Option<XOnlyPublicKey>,
    inscribe_sig: Option<Vec<u8>>,
    change_addr: Option<String>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InscribeParams {
    protocol_version: u32,
    mining_fee_rate: u64,
    ord: DestinationJson,
    utxo: Vec<TransferJson>,
    content_type: String,
    #[serde_as(as = "serde_with::hex::Hex")]
    content: Vec<u8>,
    inscribe_script_pk: String,
    inscribe_int_pk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    inscribe_sig: Option<Vec<u8>>,
    market_fee: DestinationJson,
    author_fee: DestinationJson,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_addr: Option<String>,
}

impl CreateInscriptionBuilder {
    pub const TYPE: &'static str = "CreateInscription";
    pub const PROTOCOL_VERSION: u32 = 12;
    const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 8..=12;

    pub fn new(network: Network) -> Self {
        Self {
            state: ContractState::new(network),
            content_type: None,
            content: None,
            inscribe_script_pk: None,
            inscribe_int_pk: None,
            inscribe_sig: None,
            change_addr: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Destination of the inscribed output.
    pub fn ord_destination(&mut self, amount: u64, addr: &str) -> ContractResult<&mut Self> {
        self.state
            .set_destination(DestinationRole::Ordinal, "ord_destination", amount, addr)?;
        Ok(self)
    }

    /// Marketplace fee output; zero means none.
    pub fn market_fee(&mut self, amount: u64, addr: &str) -> ContractResult<&mut Self> {
        self.state
            .set_destination(DestinationRole::MarketFee, "market_fee", amount, addr)?;
        Ok(self)
    }

    /// Author royalty output; zero means none.
    pub fn author_fee(&mut self, amount: u64, addr: &str) -> ContractResult<&mut Self> {
        self.state
            .set_destination(DestinationRole::AuthorFee, "author_fee", amount, addr)?;
        Ok(self)
    }

    pub fn mining_fee_rate(&mut self, rate: u64) -> ContractResult<&mut Self> {
        self.state.set_mining_fee_rate(rate)?;
        Ok(self)
    }

    /// Attach the content envelope: MIME type and raw payload. Payload size
    /// is bounded by caller policy, not here.
    pub fn data(&mut self, content_type: &str, content: &[u8]) -> ContractResult<&mut Self> {
        self.state.require_phase("data", Phase::Draft)?;
        self.content_type = Some(content_type.to_string());
        self.content = Some(content.to_vec());
        Ok(self)
    }

    /// The key the envelope script checks at reveal time (raw form).
    pub fn inscribe_script_pub_key(&mut self, pk: XOnlyPublicKey) -> ContractResult<&mut Self> {
        self.state.require_phase("inscribe_script_pk", Phase::Draft)?;
        self.inscribe_script_pk = Some(pk);
        Ok(self)
    }

    /// Internal key of the commit output's taproot tree (raw form).
    pub fn inscribe_internal_pub_key(&mut self, pk: XOnlyPublicKey) -> ContractResult<&mut Self> {
        self.state.require_phase("inscribe_int_pk", Phase::Draft)?;
        self.inscribe_int_pk = Some(pk);
        Ok(self)
    }

    pub fn change_address(&mut self, addr: &str) -> ContractResult<&mut Self> {
        self.state.require_phase("change_addr", Phase::Draft)?;
        address::decode(addr, self.state.network())?;
        self.change_addr = Some(addr.to_string());
        Ok(self)
    }

    pub fn add_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
    ) -> ContractResult<&mut Self> {
        self.state.add_utxo("utxo", txid, nout, amount, addr)?;
        Ok(self)
    }

    fn ord(&self) -> ContractResult<&crate::contract::builder::Destination> {
        self.state
            .destination(DestinationRole::Ordinal)
            .ok_or(ContractError::TermMissing("ord_destination"))
    }

    fn fee_amount(&self, role: DestinationRole) -> u64 {
        self.state.destination(role).map(|d| d.amount).unwrap_or(0)
    }

    /// The reveal script: `<script_pk> CHECKSIG FALSE IF "ord" 01
    /// <content-type> 00 <content…> ENDIF`.
    fn inscription_script(&self) -> ContractResult<ScriptBuf> {
        let script_pk = self
            .inscribe_script_pk
            .ok_or(ContractError::TermMissing("inscribe_script_pk"))?;
        let content_type = self
            .content_type
            .as_ref()
            .ok_or(ContractError::TermMissing("content_type"))?;
        let content = self
            .content
            .as_ref()
            .ok_or(ContractError::TermMissing("content"))?;

        let mut builder = ScriptBuilder::new()
            .push_slice(bytes_to_push_bytes(&script_pk.serialize())?.as_push_bytes())
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_FALSE)
            .push_opcode(OP_IF)
            .push_slice(PROTOCOL_ID)
            .push_slice(CONTENT_TYPE_TAG)
            .push_slice(bytes_to_push_bytes(content_type.as_bytes())?.as_push_bytes())
            .push_opcode(OP_0);
        for chunk in content.chunks(CHUNK_SIZE) {
            builder = builder.push_slice(bytes_to_push_bytes(chunk)?.as_push_bytes());
        }
        Ok(builder.push_opcode(OP_ENDIF).into_script())
    }

    fn taproot_payload(&self, secp: &Secp256k1<bitcoin::secp256k1::All>) -> ContractResult<TaprootPayload> {
        let internal_key = self
            .inscribe_int_pk
            .ok_or(ContractError::TermMissing("inscribe_int_pk"))?;
        TaprootPayload::build(
            secp,
            internal_key,
            &[self.inscription_script()?],
            self.state.network(),
        )
    }

    /// Reveal-side mining fee at the agreed rate.
    fn reveal_fee(&self) -> ContractResult<u64> {
        let rate = self.state.mining_fee_rate()?;
        let script_len = self.inscription_script()?.len();
        let mut vsize = TX_BASE_VSIZE + tapscript_spend_vin_vsize(script_len);
        vsize += self.ord()?.kind.output_vsize();
        for role in [DestinationRole::MarketFee, DestinationRole::AuthorFee] {
            if let Some(d) = self.state.destination(role) {
                if d.amount > 0 {
                    vsize += d.kind.output_vsize();
                }
            }
        }
        Ok(fee_for_vsize(rate, vsize))
    }

    /// Value the commit transaction must lock into the envelope output.
    fn commit_output_amount(&self) -> ContractResult<u64> {
        Ok(self.ord()?.amount
            + self.fee_amount(DestinationRole::MarketFee)
            + self.fee_amount(DestinationRole::AuthorFee)
            + self.reveal_fee()?)
    }

    fn commit_fee(&self) -> ContractResult<u64> {
        let rate = self.state.mining_fee_rate()?;
        let input_kinds: Vec<AddressKind> = if self.state.utxos().is_empty() {
            vec![AddressKind::P2tr]
        } else {
            self.state.utxos().iter().map(|u| u.kind).collect()
        };
        let mut output_kinds = vec![AddressKind::P2tr];
        if let Some(addr) = &self.change_addr {
            let (_, kind) = address::decode(addr, self.state.network())?;
            output_kinds.push(kind);
        }
        Ok(fee_for_vsize(rate, estimate_vsize(input_kinds, output_kinds)))
    }

    /// Smallest input total able to fund the whole commit/reveal pair.
    pub fn min_funding_amount(&self) -> ContractResult<u64> {
        Ok(self.commit_output_amount()? + self.commit_fee()?)
    }

    fn make_commit_tx(&self) -> ContractResult<(Transaction, TaprootPayload)> {
        let secp = Secp256k1::new();
        let payload = self.taproot_payload(&secp)?;

        let commit_amount = self.commit_output_amount()?;
        let mut output = vec![TxOut {
            value: bitcoin::Amount::from_sat(commit_amount),
            script_pubkey: payload.address.script_pubkey(),
        }];

        let total_in = self.state.total_input();
        let required = commit_amount + self.commit_fee()?;
        if let Some(addr) = &self.change_addr {
            let (change_address, kind) = address::decode(addr, self.state.network())?;
            let leftover = total_in.saturating_sub(required);
            if leftover >= kind.dust_limit() {
                output.push(TxOut {
                    value: bitcoin::Amount::from_sat(leftover),
                    script_pubkey: change_address.script_pubkey(),
                });
            }
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self.state.utxos().iter().map(|u| u.tx_in()).collect(),
            output,
        };
        Ok((tx, payload))
    }

    fn make_reveal_tx(&self, commit: &Transaction) -> ContractResult<Transaction> {
        let mut output = vec![self.ord()?.tx_out()];
        for role in [DestinationRole::MarketFee, DestinationRole::AuthorFee] {
            if let Some(d) = self.state.destination(role) {
                if d.amount > 0 {
                    output.push(d.tx_out());
                }
            }
        }

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: bitcoin::OutPoint {
                    txid: commit.txid(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::from_consensus(0xffffffff),
                witness: Witness::new(),
            }],
            output,
        })
    }

    /// Check funding and promote a complete draft to `Funded`.
    fn check_funded(&mut self) -> ContractResult<()> {
        if self.state.phase() >= Phase::Funded {
            return Ok(());
        }
        if self.state.utxos().is_empty() {
            return Err(ContractError::TermMissing("utxo"));
        }
        let required = self.min_funding_amount()?;
        let total_in = self.state.total_input();
        if total_in < required {
            return Err(ContractError::InsufficientFunds(format!(
                "{total_in} sat of {required} sat required"
            )));
        }
        self.state.advance(Phase::Funded);
        Ok(())
    }

    /// Sign the commit transaction's inputs with keys resolved by address.
    pub fn sign_commit(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        self.check_funded()?;

        let (commit, _) = self.make_commit_tx()?;
        let prevouts: Vec<TxOut> = self.state.utxos().iter().map(|u| u.tx_out()).collect();
        let mut cache = SighashCache::new(&commit);

        let mut witnesses = Vec::with_capacity(self.state.utxos().len());
        for (index, utxo) in self.state.utxos().iter().enumerate() {
            if utxo.kind != AddressKind::P2tr {
                return Err(ContractError::TermWrongValue(format!(
                    "utxo {index}: only taproot inputs can fund an inscription"
                )));
            }
            let keypair = registry.lookup(&utxo.address.to_string(), profile)?;
            let sighash = cache.taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                TapSighashType::Default,
            )?;
            let sig = keypair.sign_keyspend(registry.secp(), sighash.to_byte_array());
            debug!("commit input {index} signature: {sig}");
            witnesses.push(Witness::from_slice(&[sig.serialize().as_slice()]));
        }

        for (utxo, witness) in self.state.utxos_mut().iter_mut().zip(witnesses) {
            utxo.witness = Some(witness);
        }
        self.state.advance(Phase::CommitSigned);
        Ok(())
    }

    /// Sign the reveal transaction through the envelope script path. The
    /// signer is resolved by the inscribe script key, so this stage may run
    /// under a different profile, or a different party, than the commit.
    pub fn sign_inscription(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        self.state.require_reached("sign_inscription", Phase::CommitSigned)?;

        let script_pk = self
            .inscribe_script_pk
            .ok_or(ContractError::TermMissing("inscribe_script_pk"))?;
        let keypair = registry.lookup_schnorr(&script_pk, profile)?;

        let (commit, _) = self.make_commit_tx()?;
        let reveal = self.make_reveal_tx(&commit)?;
        let script = self.inscription_script()?;

        let prevouts = [commit.output[0].clone()];
        let mut cache = SighashCache::new(&reveal);
        let sighash = cache.taproot_script_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            TapLeafHash::from_script(&script, LeafVersion::TapScript),
            TapSighashType::Default,
        )?;

        let sig = keypair.sign_tapscript(registry.secp(), sighash.to_byte_array());
        registry
            .secp()
            .verify_schnorr(&sig, &Message::from_digest(sighash.to_byte_array()), &script_pk)
            .map_err(|_| {
                ContractError::Signature("inscribe key does not match its script".to_string())
            })?;
        debug!("inscription signature: {sig}");

        self.inscribe_sig = Some(sig.serialize().to_vec());
        self.state.advance(Phase::InscriptionSigned);
        Ok(())
    }

    /// `<reveal txid>i0` once both stages are signed.
    pub fn inscription_id(&self) -> ContractResult<String> {
        self.state.require_reached("inscription_id", Phase::CommitSigned)?;
        let (commit, _) = self.make_commit_tx()?;
        let reveal = self.make_reveal_tx(&commit)?;
        Ok(format!("{}i0", reveal.txid()))
    }

    /// Fully signed commit and reveal transactions, consensus-encoded.
    pub fn raw_transactions(&self) -> ContractResult<Vec<String>> {
        self.state
            .require_reached("raw_transactions", Phase::InscriptionSigned)?;

        let (commit, payload) = self.make_commit_tx()?;
        let mut reveal = self.make_reveal_tx(&commit)?;

        let sig = self
            .inscribe_sig
            .as_ref()
            .ok_or(ContractError::TermMissing("inscribe_sig"))?;
        let mut witness = Witness::new();
        witness.push(sig.as_slice());
        witness.push(payload.script.as_bytes());
        witness.push(payload.control_block.serialize());
        reveal.input[0].witness = witness;

        Ok(vec![
            bitcoin::consensus::encode::serialize_hex(&commit),
            bitcoin::consensus::encode::serialize_hex(&reveal),
        ])
    }

    pub fn serialize(&self, version: u32, phase: InscribePhase) -> ContractResult<String> {
        serializer::check_protocol_version(version, &Self::SUPPORTED_VERSIONS)?;
        if phase == InscribePhase::Signature {
            self.state
                .require_reached("serialize", Phase::InscriptionSigned)?;
        }

        let ord = DestinationJson::of(self.ord()?);
        let market_fee = self
            .state
            .destination(DestinationRole::MarketFee)
            .map(DestinationJson::of)
            .ok_or(ContractError::TermMissing("market_fee"))?;
        let author_fee = self
            .state
            .destination(DestinationRole::AuthorFee)
            .map(DestinationJson::of)
            .ok_or(ContractError::TermMissing("author_fee"))?;

        let utxo = self
            .state
            .utxos()
            .iter()
            .map(|u| {
                let mut json = TransferJson::of(u);
                if phase == InscribePhase::Terms {
                    json.sig = None;
                }
                json
            })
            .collect();

        let params = InscribeParams {
            protocol_version: version,
            mining_fee_rate: self.state.mining_fee_rate()?,
            ord,
            utxo,
            content_type: self
                .content_type
                .clone()
                .ok_or(ContractError::TermMissing("content_type"))?,
            content: self
                .content
                .clone()
                .ok_or(ContractError::TermMissing("content"))?,
            inscribe_script_pk: self
                .inscribe_script_pk
                .ok_or(ContractError::TermMissing("inscribe_script_pk"))?
                .to_string(),
            inscribe_int_pk: self
                .inscribe_int_pk
                .ok_or(ContractError::TermMissing("inscribe_int_pk"))?
                .to_string(),
            inscribe_sig: match phase {
                InscribePhase::Terms => None,
                InscribePhase::Signature => self.inscribe_sig.clone(),
            },
            market_fee,
            author_fee,
            change_addr: self.change_addr.clone(),
        };
        serializer::serialize(Self::TYPE, &params)
    }

    /// Import a contract document, re-validating every term; a `Signature`
    /// stage document must verify against its reconstructed transactions.
    pub fn deserialize(
        network: Network,
        json: &str,
        phase: InscribePhase,
    ) -> ContractResult<Self> {
        let params: InscribeParams = serializer::deserialize(json, Self::TYPE)?;
        if !Self::SUPPORTED_VERSIONS.contains(&params.protocol_version) {
            return Err(ContractError::ProtocolVersion(params.protocol_version));
        }

        let mut builder = Self::new(network);
        builder.mining_fee_rate(params.mining_fee_rate)?;
        builder.ord_destination(params.ord.amount, &params.ord.addr)?;
        builder.market_fee(params.market_fee.amount, &params.market_fee.addr)?;
        builder.author_fee(params.author_fee.amount, &params.author_fee.addr)?;
        builder.data(&params.content_type, &params.content)?;
        builder.inscribe_script_pub_key(serializer::parse_xonly(
            "inscribe_script_pk",
            &params.inscribe_script_pk,
        )?)?;
        builder.inscribe_internal_pub_key(serializer::parse_xonly(
            "inscribe_int_pk",
            &params.inscribe_int_pk,
        )?)?;
        if let Some(addr) = &params.change_addr {
            builder.change_address(addr)?;
        }
        for (index, transfer) in params.utxo.iter().enumerate() {
            builder.add_utxo(
                &transfer.txid,
                transfer.nout,
                transfer.amount,
                &transfer.addr,
            )?;
            if let Some(sig) = &transfer.sig {
                let sig = serializer::parse_schnorr_sig("utxo sig", sig)?;
                builder.state.utxos_mut()[index].witness =
                    Some(Witness::from_slice(&[sig.serialize().as_slice()]));
            }
        }

        if phase == InscribePhase::Signature {
            let inscribe_sig = params
                .inscribe_sig
                .as_ref()
                .ok_or(ContractError::TermMissing("inscribe_sig"))?;
            serializer::parse_schnorr_sig("inscribe_sig", inscribe_sig)?;
            if builder.state.utxos().iter().any(|u| u.witness.is_none()) {
                return Err(ContractError::TermMissing("utxo sig"));
            }
            builder.inscribe_sig = params.inscribe_sig.clone();
            builder.check_funded()?;
            builder.state.advance(Phase::InscriptionSigned);
            builder.check_contract_sigs()?;
        }
        Ok(builder)
    }

    /// Verify all held signatures against the reconstructed transactions.
    fn check_contract_sigs(&self) -> ContractResult<()> {
        let secp = Secp256k1::new();
        let (commit, _) = self.make_commit_tx()?;
        let reveal = self.make_reveal_tx(&commit)?;

        let prevouts: Vec<TxOut> = self.state.utxos().iter().map(|u| u.tx_out()).collect();
        let mut cache = SighashCache::new(&commit);
        for (index, utxo) in self.state.utxos().iter().enumerate() {
            let witness = utxo
                .witness
                .as_ref()
                .ok_or(ContractError::TermMissing("utxo sig"))?;
            let sig_bytes = witness.nth(0).ok_or(ContractError::TermMissing("utxo sig"))?;
            let sig = serializer::parse_schnorr_sig("utxo sig", sig_bytes)?;
            let spk = utxo.address.script_pubkey();
            if !spk.is_p2tr() {
                return Err(ContractError::Signature(format!(
                    "utxo {index}: not a taproot prevout"
                )));
            }
            let output_key =
                bitcoin::secp256k1::XOnlyPublicKey::from_slice(&spk.as_bytes()[2..34])?;
            let sighash = cache.taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                TapSighashType::Default,
            )?;
            secp.verify_schnorr(
                &sig,
                &Message::from_digest(sighash.to_byte_array()),
                &output_key,
            )
            .map_err(|_| ContractError::Signature(format!("utxo {index} commit signature")))?;
        }

        if let Some(sig) = &self.inscribe_sig {
            let sig = serializer::parse_schnorr_sig("inscribe_sig", sig)?;
            let script = self.inscription_script()?;
            let script_pk = self
                .inscribe_script_pk
                .ok_or(ContractError::TermMissing("inscribe_script_pk"))?;
            let reveal_prevouts = [commit.output[0].clone()];
            let mut cache = SighashCache::new(&reveal);
            let sighash = cache.taproot_script_spend_signature_hash(
                0,
                &Prevouts::All(&reveal_prevouts),
                TapLeafHash::from_script(&script, LeafVersion::TapScript),
                TapSighashType::Default,
            )?;
            secp.verify_schnorr(
                &sig,
                &Message::from_digest(sighash.to_byte_array()),
                &script_pk,
            )
            .map_err(|_| ContractError::Signature("inscribe_sig".to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRegistry;

    const SEED: &str = "b37f263befa23efb352f0ba45a5e452363963fabc64c946a75df155244630ebaa1ac8056b873e79232486d5dd36809f8925c9c5ac8322f5380940badc64cc6fe";
    const FILTER: &str = r#"{"look_cache":true, "key_type":"TAPROOT", "accounts":["0'"], "change":["0","1"], "index_range":"0-300"}"#;
    const FUNDING_TXID: &str = "345567678879784635241fbc876df9c1345567678879784635241fbc876df9c1";
    const CONTENT: &[u8] = b"<!DOCTYPE html><html><head><title>Test</title></head><body><h1>Asset</h1></body></html>";

    fn registry() -> KeyRegistry {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut registry = KeyRegistry::new(Network::Regtest, SEED).unwrap();
        registry.add_key_type("market", FILTER).unwrap();
        registry
    }

    fn funded_builder(registry: &KeyRegistry) -> CreateInscriptionBuilder {
        let keypair = registry.derive("m/86'/1'/0'/0/300", true).unwrap();
        registry.add_key_to_cache(&keypair).unwrap();
        let addr = keypair.p2tr_address(registry.secp()).to_string();

        let mut builder = CreateInscriptionBuilder::new(Network::Regtest);
        builder.ord_destination(546, &addr).unwrap();
        builder.market_fee(1000, &addr).unwrap();
        builder.author_fee(0, &addr).unwrap();
        builder.mining_fee_rate(3000).unwrap();
        builder.data("text/html", CONTENT).unwrap();
        builder
            .inscribe_script_pub_key(keypair.schnorr_public_key())
            .unwrap();
        builder
            .inscribe_internal_pub_key(keypair.schnorr_public_key())
            .unwrap();
        builder.change_address(&addr).unwrap();
        builder.add_utxo(FUNDING_TXID, 0, 50_000, &addr).unwrap();
        builder
    }

    #[test]
    fn test_full_signing_sequence_reaches_inscription_signed() {
        let registry = registry();
        let mut builder = funded_builder(&registry);

        builder.sign_commit(&registry, "market").unwrap();
        assert_eq!(builder.phase(), Phase::CommitSigned);
        builder.sign_inscription(&registry, "market").unwrap();
        assert_eq!(builder.phase(), Phase::InscriptionSigned);

        let contract = builder
            .serialize(10, InscribePhase::Signature)
            .unwrap();
        assert!(contract.contains("\"contract_type\":\"CreateInscription\""));

        let txs = builder.raw_transactions().unwrap();
        assert_eq!(txs.len(), 2);
        assert!(builder.inscription_id().unwrap().ends_with("i0"));
    }

    #[test]
    fn test_missing_ord_destination_blocks_funding_and_serialize() {
        let registry = registry();
        let keypair = registry.derive("m/86'/1'/0'/0/300", true).unwrap();
        registry.add_key_to_cache(&keypair).unwrap();
        let addr = keypair.p2tr_address(registry.secp()).to_string();

        let mut builder = CreateInscriptionBuilder::new(Network::Regtest);
        builder.market_fee(1000, &addr).unwrap();
        builder.author_fee(0, &addr).unwrap();
        builder.mining_fee_rate(3000).unwrap();
        builder.data("text/plain", b"hi").unwrap();
        builder
            .inscribe_script_pub_key(keypair.schnorr_public_key())
            .unwrap();
        builder
            .inscribe_internal_pub_key(keypair.schnorr_public_key())
            .unwrap();
        builder.add_utxo(FUNDING_TXID, 0, 50_000, &addr).unwrap();

        assert!(matches!(
            builder.sign_commit(&registry, "market"),
            Err(ContractError::TermMissing("ord_destination"))
        ));
        assert_eq!(builder.phase(), Phase::Draft);
        assert!(builder.serialize(10, InscribePhase::Terms).is_err());
    }

    #[test]
    fn test_underfunded_commit_reports_required_amount() {
        let registry = registry();
        let keypair = registry.derive("m/86'/1'/0'/0/300", true).unwrap();
        registry.add_key_to_cache(&keypair).unwrap();
        let addr = keypair.p2tr_address(registry.secp()).to_string();

        let mut builder = CreateInscriptionBuilder::new(Network::Regtest);
        builder.ord_destination(546, &addr).unwrap();
        builder.market_fee(0, &addr).unwrap();
        builder.author_fee(0, &addr).unwrap();
        builder.mining_fee_rate(3000).unwrap();
        builder.data("text/plain", b"hi").unwrap();
        builder
            .inscribe_script_pub_key(keypair.schnorr_public_key())
            .unwrap();
        builder
            .inscribe_internal_pub_key(keypair.schnorr_public_key())
            .unwrap();
        builder.add_utxo(FUNDING_TXID, 0, 600, &addr).unwrap();

        assert!(matches!(
            builder.sign_commit(&registry, "market"),
            Err(ContractError::InsufficientFunds(_))
        ));
    }

    #[test]
    fn test_dust_is_rejected_at_the_setter() {
        let registry = registry();
        let keypair = registry.derive("m/86'/1'/0'/0/300", true).unwrap();
        let addr = keypair.p2tr_address(registry.secp()).to_string();

        let mut builder = CreateInscriptionBuilder::new(Network::Regtest);
        assert!(matches!(
            builder.ord_destination(329, &addr),
            Err(ContractError::Dust {
                threshold: 330,
                given: 329,
                ..
            })
        ));
        builder.ord_destination(330, &addr).unwrap();
    }

    #[test]
    fn test_setters_locked_after_commit_signing() {
        let registry = registry();
        let mut builder = funded_builder(&registry);
        builder.sign_commit(&registry, "market").unwrap();

        let addr = registry
            .derive("m/86'/1'/0'/0/1", false)
            .unwrap()
            .p2tr_address(registry.secp())
            .to_string();
        assert!(matches!(
            builder.ord_destination(546, &addr),
            Err(ContractError::InvalidPhase { .. })
        ));
        assert!(matches!(
            builder.mining_fee_rate(1000),
            Err(ContractError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_terms_document_roundtrip() {
        let registry = registry();
        let builder = funded_builder(&registry);

        let json = builder.serialize(10, InscribePhase::Terms).unwrap();
        let parsed =
            CreateInscriptionBuilder::deserialize(Network::Regtest, &json, InscribePhase::Terms)
                .unwrap();
        assert_eq!(parsed.serialize(10, InscribePhase::Terms).unwrap(), json);
    }

    #[test]
    fn test_signed_document_roundtrip_verifies() {
        let registry = registry();
        let mut builder = funded_builder(&registry);
        builder.sign_commit(&registry, "market").unwrap();
        builder.sign_inscription(&registry, "market").unwrap();

        let json = builder.serialize(12, InscribePhase::Signature).unwrap();
        let parsed = CreateInscriptionBuilder::deserialize(
            Network::Regtest,
            &json,
            InscribePhase::Signature,
        )
        .unwrap();
        assert_eq!(
            parsed.raw_transactions().unwrap(),
            builder.raw_transactions().unwrap()
        );
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let registry = registry();
        let builder = funded_builder(&registry);
        assert!(matches!(
            builder.serialize(7, InscribePhase::Terms),
            Err(ContractError::ProtocolVersion(7))
        ));
    }
}
