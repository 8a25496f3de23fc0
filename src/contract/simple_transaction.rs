use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Network, TapSighashType, Transaction, TxOut, Witness};
use serde::{Deserialize, Serialize};

use crate::address::{self, AddressKind};
use crate::contract::builder::{ContractState, DestinationRole, Phase};
use crate::contract::serializer::{self, DestinationJson, UtxoJson};
use crate::keys::KeyRegistry;
use crate::utils::fees::{estimate_vsize, fee_for_vsize};
use crate::{ContractError, ContractResult};

/// Serialization stage of a generic transaction contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Terms,
    Signature,
}

/// A template-free contract: arbitrary taproot inputs and outputs described
/// by a JSON document, signed input-by-input through the key registry.
///
/// Inputs may reference the outputs of another not-yet-broadcast
/// `SimpleTransaction`, which allows funding chains to be negotiated before
/// anything hits the network.
#[derive(Debug, Clone)]
pub struct SimpleTransaction {
    state: ContractState,
    change_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TxParams {
    protocol_version: u32,
    mining_fee_rate: u64,
    utxo: Vec<UtxoJson>,
    outputs: Vec<DestinationJson>,
}

impl SimpleTransaction {
    pub const TYPE: &'static str = "transaction";
    pub const PROTOCOL_VERSION: u32 = 2;
    const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 1..=2;

    pub fn new(network: Network) -> Self {
        Self {
            state: ContractState::new(network),
            change_addr: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn mining_fee_rate(&mut self, rate: u64) -> ContractResult<&mut Self> {
        self.state.set_mining_fee_rate(rate)?;
        Ok(self)
    }

    pub fn add_input(
        &mut self,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
    ) -> ContractResult<&mut Self> {
        self.state.add_utxo("utxo", txid, nout, amount, addr)?;
        Ok(self)
    }

    /// Chain onto output `nout` of another, not yet broadcast, transaction
    /// contract.
    pub fn add_input_from(
        &mut self,
        other: &SimpleTransaction,
        nout: u32,
    ) -> ContractResult<&mut Self> {
        let outputs = other.output_destinations();
        let destination = outputs.get(nout as usize).ok_or_else(|| {
            ContractError::TermWrongValue(format!("no output {nout} to chain onto"))
        })?;
        let txid = other.make_tx().txid().to_string();
        self.state.add_utxo(
            "utxo",
            &txid,
            nout,
            destination.amount,
            &destination.address.to_string(),
        )?;
        Ok(self)
    }

    pub fn add_output(&mut self, amount: u64, addr: &str) -> ContractResult<&mut Self> {
        self.state
            .push_destination(DestinationRole::CustomFee, "outputs", amount, addr)?;
        Ok(self)
    }

    /// Route the leftover above dust back to `addr`; anything below dust is
    /// left to the miners.
    pub fn add_change_output(&mut self, addr: &str) -> ContractResult<&mut Self> {
        self.state.require_phase("change", Phase::Draft)?;
        address::decode(addr, self.state.network())?;
        self.change_addr = Some(addr.to_string());
        Ok(self)
    }

    fn output_destinations(&self) -> Vec<crate::contract::builder::Destination> {
        self.state
            .destinations()
            .iter()
            .filter(|d| d.amount > 0)
            .cloned()
            .collect()
    }

    fn estimate_fee(&self, with_change: bool) -> ContractResult<u64> {
        let rate = self.state.mining_fee_rate()?;
        let input_kinds: Vec<AddressKind> = if self.state.utxos().is_empty() {
            vec![AddressKind::P2tr]
        } else {
            self.state.utxos().iter().map(|u| u.kind).collect()
        };
        let mut output_kinds: Vec<AddressKind> =
            self.output_destinations().iter().map(|d| d.kind).collect();
        if with_change {
            if let Some(addr) = &self.change_addr {
                let (_, kind) = address::decode(addr, self.state.network())?;
                output_kinds.push(kind);
            }
        }
        Ok(fee_for_vsize(rate, estimate_vsize(input_kinds, output_kinds)))
    }

    /// Smallest input total that funds the current outputs plus mining fee.
    pub fn min_funding_amount(&self) -> ContractResult<u64> {
        Ok(self.state.total_destination() + self.estimate_fee(self.change_addr.is_some())?)
    }

    /// Balance inputs against outputs plus fee, materializing the change
    /// output; promotes the contract to `Funded`.
    fn check_funded(&mut self) -> ContractResult<()> {
        if self.state.phase() >= Phase::Funded {
            return Ok(());
        }
        if self.state.utxos().is_empty() {
            return Err(ContractError::TermMissing("utxo"));
        }

        let fee = self.estimate_fee(self.change_addr.is_some())?;
        let required = self.state.total_destination() + fee;
        let total_in = self.state.total_input();
        if total_in < required {
            return Err(ContractError::InsufficientFunds(format!(
                "{total_in} sat of {required} sat required"
            )));
        }

        if let Some(addr) = self.change_addr.take() {
            let leftover = total_in - required;
            let (_, kind) = address::decode(&addr, self.state.network())?;
            if leftover >= kind.dust_limit() {
                self.state
                    .push_destination(DestinationRole::Change, "change", leftover, &addr)?;
            }
        }

        self.state.advance(Phase::Funded);
        Ok(())
    }

    /// Sign every input as a taproot keyspend with keys resolved through
    /// `registry` under `profile`.
    pub fn sign(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        self.check_funded()?;

        let tx = self.make_tx();
        let prevouts: Vec<TxOut> = self.state.utxos().iter().map(|u| u.tx_out()).collect();
        let mut cache = SighashCache::new(&tx);

        let mut witnesses = Vec::with_capacity(self.state.utxos().len());
        for (index, utxo) in self.state.utxos().iter().enumerate() {
            if utxo.kind != AddressKind::P2tr {
                return Err(ContractError::TermWrongValue(format!(
                    "utxo {index}: only taproot inputs can be signed"
                )));
            }
            let keypair = registry.lookup(&utxo.address.to_string(), profile)?;
            let sighash = cache.taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                TapSighashType::Default,
            )?;
            let sig = keypair.sign_keyspend(registry.secp(), sighash.to_byte_array());
            debug!("input {index} keyspend signature: {sig}");
            witnesses.push(Witness::from_slice(&[sig.serialize().as_slice()]));
        }

        for (utxo, witness) in self.state.utxos_mut().iter_mut().zip(witnesses) {
            utxo.witness = Some(witness);
        }
        self.state.advance(Phase::CommitSigned);
        Ok(())
    }

    /// Re-verify every taproot keyspend witness against the transaction.
    pub fn check_sig(&self) -> ContractResult<()> {
        let secp = Secp256k1::new();
        let tx = self.make_tx();
        let prevouts: Vec<TxOut> = self.state.utxos().iter().map(|u| u.tx_out()).collect();
        let mut cache = SighashCache::new(&tx);

        for (index, utxo) in self.state.utxos().iter().enumerate() {
            let witness = utxo
                .witness
                .as_ref()
                .ok_or(ContractError::TermMissing("witness"))?;
            let sig_bytes = witness
                .nth(0)
                .ok_or(ContractError::TermMissing("witness"))?;
            if sig_bytes.len() != 64 {
                return Err(ContractError::Signature(format!(
                    "utxo {index}: unexpected witness size"
                )));
            }
            let sig = serializer::parse_schnorr_sig("witness", sig_bytes)?;

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
            .map_err(|_| ContractError::Signature(format!("utxo {index}: keyspend witness")))?;
        }
        Ok(())
    }

    pub fn make_tx(&self) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self.state.utxos().iter().map(|u| u.tx_in()).collect(),
            output: self
                .output_destinations()
                .iter()
                .map(|d| d.tx_out())
                .collect(),
        }
    }

    pub fn txid(&self) -> String {
        self.make_tx().txid().to_string()
    }

    pub fn raw_transaction(&self) -> ContractResult<String> {
        self.state.require_reached("raw_transaction", Phase::CommitSigned)?;
        Ok(bitcoin::consensus::encode::serialize_hex(&self.make_tx()))
    }

    pub fn serialize(&self, version: u32, phase: TxPhase) -> ContractResult<String> {
        serializer::check_protocol_version(version, &Self::SUPPORTED_VERSIONS)?;
        if phase == TxPhase::Signature {
            self.state.require_reached("serialize", Phase::CommitSigned)?;
        }

        let utxo = self
            .state
            .utxos()
            .iter()
            .map(|u| {
                let mut json = UtxoJson::of(u);
                if phase == TxPhase::Terms {
                    json.witness = None;
                }
                json
            })
            .collect();

        let params = TxParams {
            protocol_version: version,
            mining_fee_rate: self.state.mining_fee_rate()?,
            utxo,
            outputs: self
                .output_destinations()
                .iter()
                .map(DestinationJson::of)
                .collect(),
        };
        serializer::serialize(Self::TYPE, &params)
    }

    /// Parse a contract document, re-validating every term. In the
    /// `Signature` stage all witnesses must be present and verify.
    pub fn deserialize(network: Network, json: &str, phase: TxPhase) -> ContractResult<Self> {
        let params: TxParams = serializer::deserialize(json, Self::TYPE)?;
        if !Self::SUPPORTED_VERSIONS.contains(&params.protocol_version) {
            return Err(ContractError::ProtocolVersion(params.protocol_version));
        }

        let mut tx = Self::new(network);
        tx.state.set_mining_fee_rate(params.mining_fee_rate)?;
        for (index, utxo) in params.utxo.iter().enumerate() {
            let parsed = utxo.to_utxo("utxo", network)?;
            if phase == TxPhase::Signature && parsed.witness.is_none() {
                return Err(ContractError::Parse(format!(
                    "utxo {index} carries no witness"
                )));
            }
            tx.state.add_utxo(
                "utxo",
                &utxo.txid,
                utxo.nout,
                utxo.destination.amount,
                &utxo.destination.addr,
            )?;
            tx.state.utxos_mut()[index].witness = parsed.witness;
        }
        for output in &params.outputs {
            output.to_destination(DestinationRole::CustomFee, "outputs", network)?;
            tx.add_output(output.amount, &output.addr)?;
        }

        if phase == TxPhase::Signature {
            tx.state.advance(Phase::CommitSigned);
            tx.check_sig()?;
        }
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRegistry;

    const SEED: &str = "b37f263befa23efb352f0ba45a5e452363963fabc64c946a75df155244630ebaa1ac8056b873e79232486d5dd36809f8925c9c5ac8322f5380940badc64cc6fe";
    const FILTER: &str = r#"{"look_cache":true, "key_type":"TAPROOT", "accounts":["0'","1'"], "change":["0","1"], "index_range":"0-300"}"#;
    const FUNDING_TXID: &str = "8f3e642289eda5d79c3212b7c5cd990a81bbeed8e768a28400a79b090adb3166";

    fn registry() -> KeyRegistry {
        let mut registry = KeyRegistry::new(Network::Testnet, SEED).unwrap();
        registry.add_key_type("default", FILTER).unwrap();
        registry
    }

    fn cached_address(registry: &KeyRegistry, path: &str) -> String {
        let keypair = registry.derive(path, false).unwrap();
        registry.add_key_to_cache(&keypair).unwrap();
        keypair.p2tr_address(registry.secp()).to_string()
    }

    #[test]
    fn test_sign_and_check_single_transfer() {
        let registry = registry();
        let from = cached_address(&registry, "m/86'/0'/1'/0/0");
        let to = cached_address(&registry, "m/86'/0'/1'/0/1");

        let mut tx = SimpleTransaction::new(Network::Testnet);
        tx.mining_fee_rate(1000).unwrap();
        tx.add_input(FUNDING_TXID, 0, 10_000, &from).unwrap();
        tx.add_output(7_000, &to).unwrap();

        tx.sign(&registry, "default").unwrap();
        assert_eq!(tx.phase(), Phase::CommitSigned);
        tx.check_sig().unwrap();

        let raw = tx.raw_transaction().unwrap();
        assert!(!raw.is_empty());
    }

    #[test]
    fn test_insufficient_funds_blocks_signing() {
        let registry = registry();
        let from = cached_address(&registry, "m/86'/0'/1'/0/0");
        let to = cached_address(&registry, "m/86'/0'/1'/0/1");

        let mut tx = SimpleTransaction::new(Network::Testnet);
        tx.mining_fee_rate(1000).unwrap();
        tx.add_input(FUNDING_TXID, 0, 1_000, &from).unwrap();
        tx.add_output(990, &to).unwrap();

        assert!(matches!(
            tx.sign(&registry, "default"),
            Err(ContractError::InsufficientFunds(_))
        ));
        assert_eq!(tx.phase(), Phase::Draft);
    }

    #[test]
    fn test_change_output_takes_the_leftover() {
        let registry = registry();
        let from = cached_address(&registry, "m/86'/0'/1'/0/0");
        let to = cached_address(&registry, "m/86'/0'/1'/0/1");
        let change = cached_address(&registry, "m/86'/0'/1'/1/0");

        let mut tx = SimpleTransaction::new(Network::Testnet);
        tx.mining_fee_rate(1000).unwrap();
        tx.add_input(FUNDING_TXID, 0, 100_000, &from).unwrap();
        tx.add_output(7_000, &to).unwrap();
        tx.add_change_output(&change).unwrap();

        tx.sign(&registry, "default").unwrap();
        let built = tx.make_tx();
        assert_eq!(built.output.len(), 2);
        let fee = 100_000
            - built.output.iter().map(|o| o.value.to_sat()).sum::<u64>();
        assert!(fee > 0, "change must not swallow the fee");
        tx.check_sig().unwrap();
    }

    #[test]
    fn test_chained_contracts_share_the_txid() {
        let registry = registry();
        let from = cached_address(&registry, "m/86'/0'/1'/0/100");
        let inter = cached_address(&registry, "m/86'/0'/1'/0/101");
        let to = cached_address(&registry, "m/86'/0'/1'/0/102");

        let mut tx1 = SimpleTransaction::new(Network::Testnet);
        tx1.mining_fee_rate(1000).unwrap();
        tx1.add_output(546, &to).unwrap();

        let mut tx = SimpleTransaction::new(Network::Testnet);
        tx.mining_fee_rate(1000).unwrap();
        tx.add_input(FUNDING_TXID, 0, 10_000, &from).unwrap();
        tx.add_output(tx1.min_funding_amount().unwrap(), &inter)
            .unwrap();

        tx1.add_input_from(&tx, 0).unwrap();

        tx.sign(&registry, "default").unwrap();
        tx1.sign(&registry, "default").unwrap();

        assert_eq!(
            tx1.make_tx().input[0].previous_output.txid.to_string(),
            tx.txid()
        );
    }

    #[test]
    fn test_terms_document_roundtrip_is_exact() {
        let registry = registry();
        let from = cached_address(&registry, "m/86'/0'/1'/0/0");
        let to = cached_address(&registry, "m/86'/0'/1'/0/1");

        let mut tx = SimpleTransaction::new(Network::Testnet);
        tx.mining_fee_rate(1000).unwrap();
        tx.add_input(FUNDING_TXID, 0, 10_000, &from).unwrap();
        tx.add_output(7_000, &to).unwrap();

        let json = tx.serialize(2, TxPhase::Terms).unwrap();
        let parsed = SimpleTransaction::deserialize(Network::Testnet, &json, TxPhase::Terms).unwrap();
        assert_eq!(parsed.serialize(2, TxPhase::Terms).unwrap(), json);
    }

    #[test]
    fn test_signed_document_roundtrip_and_verification() {
        let registry = registry();
        let from = cached_address(&registry, "m/86'/0'/1'/0/0");
        let to = cached_address(&registry, "m/86'/0'/1'/0/1");

        let mut tx = SimpleTransaction::new(Network::Testnet);
        tx.mining_fee_rate(1000).unwrap();
        tx.add_input(FUNDING_TXID, 0, 10_000, &from).unwrap();
        tx.add_output(7_000, &to).unwrap();
        tx.sign(&registry, "default").unwrap();

        let json = tx.serialize(2, TxPhase::Signature).unwrap();
        let parsed =
            SimpleTransaction::deserialize(Network::Testnet, &json, TxPhase::Signature).unwrap();
        assert_eq!(parsed.serialize(2, TxPhase::Signature).unwrap(), json);
        assert_eq!(parsed.raw_transaction().unwrap(), tx.raw_transaction().unwrap());
    }

    #[test]
    fn test_deserialize_rejects_malformed_documents() {
        // missing mining_fee_rate
        let json = r#"{"contract_type":"transaction","params":{"protocol_version":2,"utxo":[],"outputs":[]}}"#;
        assert!(matches!(
            SimpleTransaction::deserialize(Network::Regtest, json, TxPhase::Terms),
            Err(ContractError::Parse(_))
        ));

        // unknown output type tag
        let json = r#"{"contract_type":"transaction","params":{"protocol_version":2,"mining_fee_rate":1000,"utxo":[],"outputs":[{"type":"p2future","amount":546,"addr":"bcrt1ptge9ax57nlztgyx2xzjk78julf2wsjug0nw2nl3mrecheevtdxhqp7dzwk"}]}}"#;
        assert!(matches!(
            SimpleTransaction::deserialize(Network::Regtest, json, TxPhase::Terms),
            Err(ContractError::Parse(_))
        ));

        // unsupported protocol version
        let json = r#"{"contract_type":"transaction","params":{"protocol_version":9,"mining_fee_rate":1000,"utxo":[],"outputs":[]}}"#;
        assert!(matches!(
            SimpleTransaction::deserialize(Network::Regtest, json, TxPhase::Terms),
            Err(ContractError::ProtocolVersion(9))
        ));
    }
}
