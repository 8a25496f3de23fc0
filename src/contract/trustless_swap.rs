use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_NUMEQUAL};
use bitcoin::script::Builder as ScriptBuilder;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Network, ScriptBuf, Sequence, TapLeafHash, TapSighashType, Transaction, TxIn, TxOut,
    Witness,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::address::{self, AddressKind};
use crate::contract::builder::{ContractState, DestinationRole, Phase, UtxoRef};
use crate::contract::serializer::{self, DestinationJson, TransferJson};
use crate::keys::KeyRegistry;
use crate::utils::fees::{
    estimate_vsize, fee_for_vsize, tapscript_spend_vin_vsize, TAPROOT_KEYSPEND_VIN_VSIZE,
    TAPROOT_VOUT_VSIZE, TX_BASE_VSIZE,
};
use crate::utils::taproot::TaprootPayload;
use crate::{ContractError, ContractResult};

/// Interchange stages of the trustless swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustlessSwapPhase {
    OrdTerms,
    OrdSwapSig,
    FundsTerms,
    FundsCommitSig,
    FundsSwapTerms,
    FundsSwapSig,
}

/// Ordinal-for-payment swap with no settlement authority for the market.
///
/// The seller locks the ordinal into a 2-of-2 tapscript shared with the
/// market key; the buyer locks the exact payment into a commitment output
/// under their own key. Settlement spends both locks in one transaction:
/// the seller signs their input `SINGLE|ANYONECANPAY` (committing only to
/// the payment routed to [`Self::funds_payoff_address`]), the buyer signs
/// theirs `ALL`, and the market countersignature on the ordinal leaf can
/// collect a fee but can never move either lock on its own.
#[derive(Debug, Clone)]
pub struct TrustlessSwapInscriptionBuilder {
    state: ContractState,
    ord_price: Option<u64>,
    market_script_pk: Option<XOnlyPublicKey>,
    ord_script_pk: Option<XOnlyPublicKey>,
    ord_int_pk: Option<XOnlyPublicKey>,
    ord_commit_utxo: Option<UtxoRef>,
    ord_payoff_addr: Option<String>,
    funds_payoff_addr: Option<String>,
    change_addr: Option<String>,
    ord_swap_sig: Option<Vec<u8>>,
    market_swap_sig: Option<Vec<u8>>,
    funds_swap_sig: Option<Vec<u8>>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TrustlessSwapParams {
    protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mining_fee_rate: Option<u64>,
    ord_price: u64,
    market_fee: DestinationJson,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    market_script_pk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ord_script_pk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ord_int_pk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ord_commit: Option<TransferJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ord_payoff_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    funds_payoff_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    funds: Option<Vec<TransferJson>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    ord_swap_sig: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    market_swap_sig: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    funds_swap_sig: Option<Vec<u8>>,
}

impl TrustlessSwapInscriptionBuilder {
    pub const TYPE: &'static str = "TrustlessSwapInscription";
    pub const PROTOCOL_VERSION: u32 = 6;
    const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 6..=6;

    pub fn new(network: Network) -> Self {
        Self {
            state: ContractState::new(network),
            ord_price: None,
            market_script_pk: None,
            ord_script_pk: None,
            ord_int_pk: None,
            ord_commit_utxo: None,
            ord_payoff_addr: None,
            funds_payoff_addr: None,
            change_addr: None,
            ord_swap_sig: None,
            market_swap_sig: None,
            funds_swap_sig: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn ord_price(&mut self, amount: u64) -> ContractResult<&mut Self> {
        self.state.require_phase("ord_price", Phase::Draft)?;
        if amount < AddressKind::P2tr.dust_limit() {
            return Err(ContractError::Dust {
                field: "ord_price",
                threshold: AddressKind::P2tr.dust_limit(),
                given: amount,
            });
        }
        self.ord_price = Some(amount);
        Ok(self)
    }

    /// Marketplace fee output; zero means none.
    pub fn market_fee(&mut self, amount: u64, addr: &str) -> ContractResult<&mut Self> {
        self.state
            .set_destination(DestinationRole::MarketFee, "market_fee", amount, addr)?;
        Ok(self)
    }

    pub fn mining_fee_rate(&mut self, rate: u64) -> ContractResult<&mut Self> {
        self.state.set_mining_fee_rate(rate)?;
        Ok(self)
    }

    /// Fee-collecting market key; gates nothing but the ordinal leaf's
    /// countersignature.
    pub fn market_script_pub_key(&mut self, pk: XOnlyPublicKey) -> ContractResult<&mut Self> {
        self.state.require_phase("market_script_pk", Phase::Draft)?;
        self.market_script_pk = Some(pk);
        Ok(self)
    }

    /// Seller key inside the ordinal lock leaf.
    pub fn ord_script_pub_key(&mut self, pk: XOnlyPublicKey) -> ContractResult<&mut Self> {
        self.state.require_phase("ord_script_pk", Phase::Draft)?;
        self.ord_script_pk = Some(pk);
        Ok(self)
    }

    /// Internal key of the ordinal lock output.
    pub fn ord_int_pub_key(&mut self, pk: XOnlyPublicKey) -> ContractResult<&mut Self> {
        self.state.require_phase("ord_int_pk", Phase::Draft)?;
        self.ord_int_pk = Some(pk);
        Ok(self)
    }

    /// Lock the seller's inscribed UTXO for the swap.
    pub fn commit_ordinal(
        &mut self,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
    ) -> ContractResult<&mut Self> {
        self.state.require_phase("ord_commit", Phase::Draft)?;
        self.ord_commit_utxo = Some(UtxoRef::new(
            "ord_commit",
            txid,
            nout,
            amount,
            addr,
            self.state.network(),
        )?);
        Ok(self)
    }

    /// Lock a payment UTXO of the buyer against the funds payoff address,
    /// routing any leftover to `change_addr`.
    pub fn fund_commit_ordinal(
        &mut self,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
        change_addr: &str,
    ) -> ContractResult<&mut Self> {
        self.state.add_utxo("funds", txid, nout, amount, addr)?;
        address::decode(change_addr, self.state.network())?;
        self.change_addr = Some(change_addr.to_string());
        Ok(self)
    }

    /// An additional payment UTXO of the buyer.
    pub fn commit_funds(
        &mut self,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
    ) -> ContractResult<&mut Self> {
        self.state.add_utxo("funds", txid, nout, amount, addr)?;
        Ok(self)
    }

    /// Where the ordinal settles: the buyer's address.
    pub fn ord_payoff_address(&mut self, addr: &str) -> ContractResult<&mut Self> {
        self.state.require_phase("ord_payoff_addr", Phase::Draft)?;
        address::decode(addr, self.state.network())?;
        self.ord_payoff_addr = Some(addr.to_string());
        Ok(self)
    }

    /// Where the payment settles: the seller's address.
    pub fn funds_payoff_address(&mut self, addr: &str) -> ContractResult<&mut Self> {
        self.state.require_phase("funds_payoff_addr", Phase::Draft)?;
        address::decode(addr, self.state.network())?;
        self.funds_payoff_addr = Some(addr.to_string());
        Ok(self)
    }

    fn pk(&self, field: &'static str, pk: &Option<XOnlyPublicKey>) -> ContractResult<XOnlyPublicKey> {
        pk.ok_or(ContractError::TermMissing(field))
    }

    fn price(&self) -> ContractResult<u64> {
        self.ord_price.ok_or(ContractError::TermMissing("ord_price"))
    }

    fn market_fee_amount(&self) -> u64 {
        self.state
            .destination(DestinationRole::MarketFee)
            .map(|d| d.amount)
            .unwrap_or(0)
    }

    fn payoff_addr(&self, field: &'static str, addr: &Option<String>) -> ContractResult<ScriptBuf> {
        let addr = addr.as_ref().ok_or(ContractError::TermMissing(field))?;
        let (address, _) = address::decode(addr, self.state.network())?;
        Ok(address.script_pubkey())
    }

    /// `<ord_script_pk> CHECKSIG <market_script_pk> CHECKSIGADD 2 NUMEQUAL`.
    fn ord_swap_script(&self) -> ContractResult<ScriptBuf> {
        let ord_pk = self.pk("ord_script_pk", &self.ord_script_pk)?;
        let market_pk = self.pk("market_script_pk", &self.market_script_pk)?;
        Ok(ScriptBuilder::new()
            .push_x_only_key(&ord_pk)
            .push_opcode(OP_CHECKSIG)
            .push_x_only_key(&market_pk)
            .push_opcode(OP_CHECKSIGADD)
            .push_int(2)
            .push_opcode(OP_NUMEQUAL)
            .into_script())
    }

    fn ord_lock_payload(&self) -> ContractResult<TaprootPayload> {
        let secp = Secp256k1::new();
        let internal = self.pk("ord_int_pk", &self.ord_int_pk)?;
        TaprootPayload::build(
            &secp,
            internal,
            &[self.ord_swap_script()?],
            self.state.network(),
        )
    }

    fn ord_commit_fee(&self) -> ContractResult<u64> {
        let rate = self.state.mining_fee_rate()?;
        Ok(fee_for_vsize(
            rate,
            TX_BASE_VSIZE + TAPROOT_KEYSPEND_VIN_VSIZE + TAPROOT_VOUT_VSIZE,
        ))
    }

    /// Value settling into the ordinal lock after the commit fee.
    fn ord_lock_amount(&self) -> ContractResult<u64> {
        let ord = self
            .ord_commit_utxo
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_commit"))?;
        let fee = self.ord_commit_fee()?;
        let amount = ord.amount.checked_sub(fee).ok_or_else(|| {
            ContractError::InsufficientFunds(format!(
                "{} sat ordinal cannot cover the {fee} sat commit fee",
                ord.amount
            ))
        })?;
        if amount < AddressKind::P2tr.dust_limit() {
            return Err(ContractError::InsufficientFunds(format!(
                "{amount} sat ordinal lock is below dust"
            )));
        }
        Ok(amount)
    }

    fn swap_fee(&self) -> ContractResult<u64> {
        let rate = self.state.mining_fee_rate()?;
        // the 2-of-2 leaf has a fixed encoding: two keys, two checksig
        // opcodes, the threshold and NUMEQUAL
        const ORD_SWAP_SCRIPT_SIZE: usize = 70;
        let mut vsize = TX_BASE_VSIZE
            + tapscript_spend_vin_vsize(ORD_SWAP_SCRIPT_SIZE)
            + TAPROOT_KEYSPEND_VIN_VSIZE;
        vsize += 2 * TAPROOT_VOUT_VSIZE;
        if self.market_fee_amount() > 0 {
            vsize += TAPROOT_VOUT_VSIZE;
        }
        Ok(fee_for_vsize(rate, vsize))
    }

    /// Value the buyer's funds lock must hold.
    fn funds_lock_amount(&self) -> ContractResult<u64> {
        Ok(self.price()? + self.market_fee_amount() + self.swap_fee()?)
    }

    /// Smallest buyer-side input total able to set up the funds lock.
    pub fn min_funding_amount(&self) -> ContractResult<u64> {
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
        let commit_fee = fee_for_vsize(rate, estimate_vsize(input_kinds, output_kinds));
        Ok(self.funds_lock_amount()? + commit_fee)
    }

    /// The buyer's commitment output stays under the buyer's own first
    /// funding key; committing fixes the exact settlement amount.
    fn funds_lock_script(&self) -> ContractResult<ScriptBuf> {
        let first = self
            .state
            .utxos()
            .first()
            .ok_or(ContractError::TermMissing("funds"))?;
        if first.kind != AddressKind::P2tr {
            return Err(ContractError::TermWrongValue(
                "funds must be committed from a taproot address".to_string(),
            ));
        }
        Ok(first.address.script_pubkey())
    }

    fn make_ord_commit_tx(&self) -> ContractResult<Transaction> {
        let ord = self
            .ord_commit_utxo
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_commit"))?;
        let payload = self.ord_lock_payload()?;
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![ord.tx_in()],
            output: vec![TxOut {
                value: Amount::from_sat(self.ord_lock_amount()?),
                script_pubkey: payload.address.script_pubkey(),
            }],
        })
    }

    fn make_funds_commit_tx(&self) -> ContractResult<Transaction> {
        if self.state.utxos().is_empty() {
            return Err(ContractError::TermMissing("funds"));
        }
        let lock_amount = self.funds_lock_amount()?;
        let mut output = vec![TxOut {
            value: Amount::from_sat(lock_amount),
            script_pubkey: self.funds_lock_script()?,
        }];

        let required = self.min_funding_amount()?;
        let total_in = self.state.total_input();
        if let Some(addr) = &self.change_addr {
            let (change_address, kind) = address::decode(addr, self.state.network())?;
            let leftover = total_in.saturating_sub(required);
            if leftover >= kind.dust_limit() {
                output.push(TxOut {
                    value: Amount::from_sat(leftover),
                    script_pubkey: change_address.script_pubkey(),
                });
            }
        }

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self.state.utxos().iter().map(|u| u.tx_in()).collect(),
            output,
        })
    }

    /// Prevouts spent by the settlement transaction: both locks.
    fn swap_prevouts(&self) -> ContractResult<Vec<TxOut>> {
        Ok(vec![
            self.make_ord_commit_tx()?.output[0].clone(),
            self.make_funds_commit_tx()?.output[0].clone(),
        ])
    }

    fn make_swap_tx(&self) -> ContractResult<Transaction> {
        let ord_commit = self.make_ord_commit_tx()?;
        let funds_commit = self.make_funds_commit_tx()?;

        let mut output = vec![
            // output 0 is what the seller's SINGLE|ANYONECANPAY sig pins
            TxOut {
                value: Amount::from_sat(self.price()?),
                script_pubkey: self.payoff_addr("funds_payoff_addr", &self.funds_payoff_addr)?,
            },
            TxOut {
                value: Amount::from_sat(self.ord_lock_amount()?),
                script_pubkey: self.payoff_addr("ord_payoff_addr", &self.ord_payoff_addr)?,
            },
        ];
        if self.market_fee_amount() > 0 {
            let market = self
                .state
                .destination(DestinationRole::MarketFee)
                .ok_or(ContractError::TermMissing("market_fee"))?;
            output.push(market.tx_out());
        }

        let make_input = |txid, vout| TxIn {
            previous_output: bitcoin::OutPoint { txid, vout },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_consensus(0xffffffff),
            witness: Witness::new(),
        };
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![
                make_input(ord_commit.txid(), 0),
                make_input(funds_commit.txid(), 0),
            ],
            output,
        })
    }

    /// Seller keyspend moving the ordinal into the lock.
    pub fn sign_ord_commitment(
        &mut self,
        registry: &KeyRegistry,
        profile: &str,
    ) -> ContractResult<()> {
        let ord = self
            .ord_commit_utxo
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_commit"))?;
        if ord.kind != AddressKind::P2tr {
            return Err(ContractError::TermWrongValue(
                "ord_commit: only a taproot input can be committed".to_string(),
            ));
        }
        let keypair = registry.lookup(&ord.address.to_string(), profile)?;

        let commit_tx = self.make_ord_commit_tx()?;
        let prevouts = [ord.tx_out()];
        let mut cache = SighashCache::new(&commit_tx);
        let sighash = cache.taproot_key_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            TapSighashType::Default,
        )?;
        let sig = keypair.sign_keyspend(registry.secp(), sighash.to_byte_array());
        debug!("ord commit signature: {sig}");

        if let Some(ord) = self.ord_commit_utxo.as_mut() {
            ord.witness = Some(Witness::from_slice(&[sig.serialize().as_slice()]));
        }
        Ok(())
    }

    /// Seller signature on the ordinal lock leaf, `SINGLE|ANYONECANPAY`:
    /// it pins only the payment output, whatever else settlement adds.
    pub fn sign_ord_swap(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        let ord_pk = self.pk("ord_script_pk", &self.ord_script_pk)?;
        let keypair = registry.lookup_schnorr(&ord_pk, profile)?;

        let swap_tx = self.make_swap_tx()?;
        let mut cache = SighashCache::new(&swap_tx);
        let sighash = cache.taproot_script_spend_signature_hash(
            0,
            &Prevouts::One(0, self.swap_prevouts()?[0].clone()),
            TapLeafHash::from_script(&self.ord_swap_script()?, LeafVersion::TapScript),
            TapSighashType::SinglePlusAnyoneCanPay,
        )?;
        let sig = keypair.sign_tapscript(registry.secp(), sighash.to_byte_array());
        debug!("ord swap signature: {sig}");

        let mut sig_bytes = sig.serialize().to_vec();
        sig_bytes.push(TapSighashType::SinglePlusAnyoneCanPay as u8);
        self.ord_swap_sig = Some(sig_bytes);
        Ok(())
    }

    /// Market countersignature on the ordinal lock leaf.
    pub fn sign_market_swap(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        let market_pk = self.pk("market_script_pk", &self.market_script_pk)?;
        let keypair = registry.lookup_schnorr(&market_pk, profile)?;

        let swap_tx = self.make_swap_tx()?;
        let prevouts = self.swap_prevouts()?;
        let mut cache = SighashCache::new(&swap_tx);
        let sighash = cache.taproot_script_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            TapLeafHash::from_script(&self.ord_swap_script()?, LeafVersion::TapScript),
            TapSighashType::Default,
        )?;
        let sig = keypair.sign_tapscript(registry.secp(), sighash.to_byte_array());
        self.market_swap_sig = Some(sig.serialize().to_vec());
        self.try_complete();
        Ok(())
    }

    /// Buyer keyspend signatures moving the payment into the funds lock.
    pub fn sign_funds_commitment(
        &mut self,
        registry: &KeyRegistry,
        profile: &str,
    ) -> ContractResult<()> {
        if self.state.utxos().is_empty() {
            return Err(ContractError::TermMissing("funds"));
        }
        let total_in = self.state.total_input();
        let required = self.min_funding_amount()?;
        if total_in < required {
            return Err(ContractError::InsufficientFunds(format!(
                "{total_in} sat of {required} sat required"
            )));
        }
        if self.state.phase() < Phase::Funded {
            self.state.advance(Phase::Funded);
        }

        let commit_tx = self.make_funds_commit_tx()?;
        let prevouts: Vec<TxOut> = self.state.utxos().iter().map(|u| u.tx_out()).collect();
        let mut cache = SighashCache::new(&commit_tx);

        let mut witnesses = Vec::with_capacity(self.state.utxos().len());
        for (index, utxo) in self.state.utxos().iter().enumerate() {
            if utxo.kind != AddressKind::P2tr {
                return Err(ContractError::TermWrongValue(format!(
                    "funds utxo {index}: only taproot inputs can fund the lock"
                )));
            }
            let keypair = registry.lookup(&utxo.address.to_string(), profile)?;
            let sighash = cache.taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                TapSighashType::Default,
            )?;
            let sig = keypair.sign_keyspend(registry.secp(), sighash.to_byte_array());
            witnesses.push(Witness::from_slice(&[sig.serialize().as_slice()]));
        }
        for (utxo, witness) in self.state.utxos_mut().iter_mut().zip(witnesses) {
            utxo.witness = Some(witness);
        }
        self.state.advance(Phase::CommitSigned);
        Ok(())
    }

    /// Buyer keyspend on the settlement's funds input, `ALL`.
    pub fn sign_funds_swap(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        let lock_script = self.funds_lock_script()?;
        let first = self
            .state
            .utxos()
            .first()
            .ok_or(ContractError::TermMissing("funds"))?;
        let keypair = registry.lookup(&first.address.to_string(), profile)?;

        let swap_tx = self.make_swap_tx()?;
        let prevouts = self.swap_prevouts()?;
        debug_assert_eq!(prevouts[1].script_pubkey, lock_script);
        let mut cache = SighashCache::new(&swap_tx);
        let sighash = cache.taproot_key_spend_signature_hash(
            1,
            &Prevouts::All(&prevouts),
            TapSighashType::Default,
        )?;
        let sig = keypair.sign_keyspend(registry.secp(), sighash.to_byte_array());
        self.funds_swap_sig = Some(sig.serialize().to_vec());
        self.try_complete();
        Ok(())
    }

    fn try_complete(&mut self) {
        if self.ord_swap_sig.is_some()
            && self.market_swap_sig.is_some()
            && self.funds_swap_sig.is_some()
            && self.state.phase() >= Phase::CommitSigned
        {
            self.state.advance(Phase::InscriptionSigned);
        }
    }

    pub fn ord_commit_raw_transaction(&self) -> ContractResult<String> {
        let ord = self
            .ord_commit_utxo
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_commit"))?;
        if ord.witness.is_none() {
            return Err(ContractError::TermMissing("ord_commit sig"));
        }
        Ok(bitcoin::consensus::encode::serialize_hex(
            &self.make_ord_commit_tx()?,
        ))
    }

    pub fn funds_commit_raw_transaction(&self) -> ContractResult<String> {
        self.state
            .require_reached("funds_commit_raw_transaction", Phase::CommitSigned)?;
        Ok(bitcoin::consensus::encode::serialize_hex(
            &self.make_funds_commit_tx()?,
        ))
    }

    /// The settlement transaction with the complete witness set.
    pub fn ord_swap_raw_transaction(&self) -> ContractResult<String> {
        self.state
            .require_reached("ord_swap_raw_transaction", Phase::InscriptionSigned)?;

        let mut swap_tx = self.make_swap_tx()?;
        let payload = self.ord_lock_payload()?;

        let ord_sig = self
            .ord_swap_sig
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_swap_sig"))?;
        let market_sig = self
            .market_swap_sig
            .as_ref()
            .ok_or(ContractError::TermMissing("market_swap_sig"))?;
        // CHECKSIGADD consumes signatures in reverse key order
        let mut witness = Witness::new();
        witness.push(market_sig.as_slice());
        witness.push(ord_sig.as_slice());
        witness.push(payload.script.as_bytes());
        witness.push(payload.control_block.serialize());
        swap_tx.input[0].witness = witness;

        let funds_sig = self
            .funds_swap_sig
            .as_ref()
            .ok_or(ContractError::TermMissing("funds_swap_sig"))?;
        swap_tx.input[1].witness = Witness::from_slice(&[funds_sig.as_slice()]);

        Ok(bitcoin::consensus::encode::serialize_hex(&swap_tx))
    }

    fn check_contract_terms(&self, phase: TrustlessSwapPhase) -> ContractResult<()> {
        self.price()?;
        self.state
            .destination(DestinationRole::MarketFee)
            .ok_or(ContractError::TermMissing("market_fee"))?;
        self.state.mining_fee_rate()?;

        match phase {
            TrustlessSwapPhase::OrdTerms => {
                self.ord_commit_utxo
                    .as_ref()
                    .ok_or(ContractError::TermMissing("ord_commit"))?;
                self.pk("market_script_pk", &self.market_script_pk)?;
                self.payoff_addr("funds_payoff_addr", &self.funds_payoff_addr)?;
            }
            TrustlessSwapPhase::OrdSwapSig => {
                self.check_contract_terms(TrustlessSwapPhase::OrdTerms)?;
                self.pk("ord_script_pk", &self.ord_script_pk)?;
                self.pk("ord_int_pk", &self.ord_int_pk)?;
                self.ord_swap_sig
                    .as_ref()
                    .ok_or(ContractError::TermMissing("ord_swap_sig"))?;
            }
            TrustlessSwapPhase::FundsTerms => {
                if self.state.utxos().is_empty() {
                    return Err(ContractError::TermMissing("funds"));
                }
                self.payoff_addr("ord_payoff_addr", &self.ord_payoff_addr)?;
            }
            TrustlessSwapPhase::FundsCommitSig => {
                self.check_contract_terms(TrustlessSwapPhase::FundsTerms)?;
                if self.state.utxos().iter().any(|u| u.witness.is_none()) {
                    return Err(ContractError::TermMissing("funds commit sig"));
                }
            }
            TrustlessSwapPhase::FundsSwapTerms => {
                self.check_contract_terms(TrustlessSwapPhase::OrdTerms)?;
                self.check_contract_terms(TrustlessSwapPhase::FundsCommitSig)?;
                self.pk("ord_script_pk", &self.ord_script_pk)?;
                self.pk("ord_int_pk", &self.ord_int_pk)?;
            }
            TrustlessSwapPhase::FundsSwapSig => {
                self.check_contract_terms(TrustlessSwapPhase::FundsSwapTerms)?;
                self.funds_swap_sig
                    .as_ref()
                    .ok_or(ContractError::TermMissing("funds_swap_sig"))?;
            }
        }
        Ok(())
    }

    pub fn serialize(&self, version: u32, phase: TrustlessSwapPhase) -> ContractResult<String> {
        serializer::check_protocol_version(version, &Self::SUPPORTED_VERSIONS)?;
        self.check_contract_terms(phase)?;

        let market_fee = self
            .state
            .destination(DestinationRole::MarketFee)
            .map(DestinationJson::of)
            .ok_or(ContractError::TermMissing("market_fee"))?;

        let strip_sigs = matches!(
            phase,
            TrustlessSwapPhase::OrdTerms | TrustlessSwapPhase::FundsTerms
        );

        let ord_commit = self.ord_commit_utxo.as_ref().map(|u| {
            let mut json = TransferJson::of(u);
            if strip_sigs {
                json.sig = None;
            }
            json
        });
        let funds = if self.state.utxos().is_empty() {
            None
        } else {
            Some(
                self.state
                    .utxos()
                    .iter()
                    .map(|u| {
                        let mut json = TransferJson::of(u);
                        if strip_sigs {
                            json.sig = None;
                        }
                        json
                    })
                    .collect(),
            )
        };

        let params = TrustlessSwapParams {
            protocol_version: version,
            mining_fee_rate: Some(self.state.mining_fee_rate()?),
            ord_price: self.price()?,
            market_fee,
            market_script_pk: self.market_script_pk.map(|pk| pk.to_string()),
            ord_script_pk: self.ord_script_pk.map(|pk| pk.to_string()),
            ord_int_pk: self.ord_int_pk.map(|pk| pk.to_string()),
            ord_commit,
            ord_payoff_addr: self.ord_payoff_addr.clone(),
            funds_payoff_addr: self.funds_payoff_addr.clone(),
            funds,
            change_addr: self.change_addr.clone(),
            ord_swap_sig: if strip_sigs {
                None
            } else {
                self.ord_swap_sig.clone()
            },
            market_swap_sig: if strip_sigs {
                None
            } else {
                self.market_swap_sig.clone()
            },
            funds_swap_sig: if strip_sigs {
                None
            } else {
                self.funds_swap_sig.clone()
            },
        };
        serializer::serialize(Self::TYPE, &params)
    }

    /// Import a counterpart's document and re-validate it for `phase`.
    pub fn deserialize(
        network: Network,
        json: &str,
        phase: TrustlessSwapPhase,
    ) -> ContractResult<Self> {
        let params: TrustlessSwapParams = serializer::deserialize(json, Self::TYPE)?;
        if !Self::SUPPORTED_VERSIONS.contains(&params.protocol_version) {
            return Err(ContractError::ProtocolVersion(params.protocol_version));
        }

        let mut builder = Self::new(network);
        if let Some(rate) = params.mining_fee_rate {
            builder.mining_fee_rate(rate)?;
        }
        builder.ord_price(params.ord_price)?;
        builder.market_fee(params.market_fee.amount, &params.market_fee.addr)?;

        if let Some(pk) = &params.market_script_pk {
            builder.market_script_pub_key(serializer::parse_xonly("market_script_pk", pk)?)?;
        }
        if let Some(pk) = &params.ord_script_pk {
            builder.ord_script_pub_key(serializer::parse_xonly("ord_script_pk", pk)?)?;
        }
        if let Some(pk) = &params.ord_int_pk {
            builder.ord_int_pub_key(serializer::parse_xonly("ord_int_pk", pk)?)?;
        }
        if let Some(addr) = &params.ord_payoff_addr {
            builder.ord_payoff_address(addr)?;
        }
        if let Some(addr) = &params.funds_payoff_addr {
            builder.funds_payoff_address(addr)?;
        }
        if let Some(ord) = &params.ord_commit {
            builder.commit_ordinal(&ord.txid, ord.nout, ord.amount, &ord.addr)?;
            if let Some(sig) = &ord.sig {
                serializer::parse_schnorr_sig("ord_commit sig", sig)?;
                if let Some(utxo) = builder.ord_commit_utxo.as_mut() {
                    utxo.witness = Some(Witness::from_slice(&[sig.as_slice()]));
                }
            }
        }
        if let Some(funds) = &params.funds {
            for (index, transfer) in funds.iter().enumerate() {
                builder.commit_funds(
                    &transfer.txid,
                    transfer.nout,
                    transfer.amount,
                    &transfer.addr,
                )?;
                if let Some(sig) = &transfer.sig {
                    serializer::parse_schnorr_sig("funds commit sig", sig)?;
                    builder.state.utxos_mut()[index].witness =
                        Some(Witness::from_slice(&[sig.as_slice()]));
                }
            }
        }
        if let Some(addr) = &params.change_addr {
            address::decode(addr, network)?;
            builder.change_addr = Some(addr.clone());
        }
        builder.ord_swap_sig = params.ord_swap_sig.clone();
        builder.market_swap_sig = params.market_swap_sig.clone();
        builder.funds_swap_sig = params.funds_swap_sig.clone();

        builder.check_contract_terms(phase)?;
        builder.check_sigs()?;

        match phase {
            TrustlessSwapPhase::FundsCommitSig
            | TrustlessSwapPhase::FundsSwapTerms
            | TrustlessSwapPhase::FundsSwapSig => {
                builder.state.advance(Phase::CommitSigned);
                builder.try_complete();
            }
            _ => {}
        }
        Ok(builder)
    }

    /// Verify whatever signatures the imported document carries.
    fn check_sigs(&self) -> ContractResult<()> {
        let secp = Secp256k1::new();

        if let Some(ord) = &self.ord_commit_utxo {
            if let Some(witness) = &ord.witness {
                let sig_bytes = witness
                    .nth(0)
                    .ok_or(ContractError::TermMissing("ord_commit sig"))?;
                let sig = serializer::parse_schnorr_sig("ord_commit sig", sig_bytes)?;
                let commit_tx = self.make_ord_commit_tx()?;
                let prevouts = [ord.tx_out()];
                let mut cache = SighashCache::new(&commit_tx);
                let sighash = cache.taproot_key_spend_signature_hash(
                    0,
                    &Prevouts::All(&prevouts),
                    TapSighashType::Default,
                )?;
                let spk = ord.address.script_pubkey();
                if !spk.is_p2tr() {
                    return Err(ContractError::Signature(
                        "ord_commit: not a taproot prevout".to_string(),
                    ));
                }
                let output_key = XOnlyPublicKey::from_slice(&spk.as_bytes()[2..34])?;
                secp.verify_schnorr(
                    &sig,
                    &Message::from_digest(sighash.to_byte_array()),
                    &output_key,
                )
                .map_err(|_| ContractError::Signature("ord_commit sig".to_string()))?;
            }
        }

        if self.state.utxos().iter().any(|u| u.witness.is_some()) {
            let commit_tx = self.make_funds_commit_tx()?;
            let prevouts: Vec<TxOut> = self.state.utxos().iter().map(|u| u.tx_out()).collect();
            let mut cache = SighashCache::new(&commit_tx);
            for (index, utxo) in self.state.utxos().iter().enumerate() {
                let Some(witness) = &utxo.witness else { continue };
                let sig_bytes = witness
                    .nth(0)
                    .ok_or(ContractError::TermMissing("funds commit sig"))?;
                let sig = serializer::parse_schnorr_sig("funds commit sig", sig_bytes)?;
                let spk = utxo.address.script_pubkey();
                if !spk.is_p2tr() {
                    return Err(ContractError::Signature(format!(
                        "funds utxo {index}: not a taproot prevout"
                    )));
                }
                let output_key = XOnlyPublicKey::from_slice(&spk.as_bytes()[2..34])?;
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
                .map_err(|_| {
                    ContractError::Signature(format!("funds utxo {index} commit signature"))
                })?;
            }
        }

        if let Some(sig_bytes) = &self.ord_swap_sig {
            if sig_bytes.len() != 65
                || sig_bytes[64] != TapSighashType::SinglePlusAnyoneCanPay as u8
            {
                return Err(ContractError::Signature(
                    "ord_swap_sig must use SINGLE|ANYONECANPAY".to_string(),
                ));
            }
            let sig = serializer::parse_schnorr_sig("ord_swap_sig", &sig_bytes[..64])?;
            let ord_pk = self.pk("ord_script_pk", &self.ord_script_pk)?;
            let swap_tx = self.make_swap_tx()?;
            let mut cache = SighashCache::new(&swap_tx);
            let sighash = cache.taproot_script_spend_signature_hash(
                0,
                &Prevouts::One(0, self.swap_prevouts()?[0].clone()),
                TapLeafHash::from_script(&self.ord_swap_script()?, LeafVersion::TapScript),
                TapSighashType::SinglePlusAnyoneCanPay,
            )?;
            secp.verify_schnorr(&sig, &Message::from_digest(sighash.to_byte_array()), &ord_pk)
                .map_err(|_| ContractError::Signature("ord_swap_sig".to_string()))?;
        }

        if let Some(sig_bytes) = &self.market_swap_sig {
            let sig = serializer::parse_schnorr_sig("market_swap_sig", sig_bytes)?;
            let market_pk = self.pk("market_script_pk", &self.market_script_pk)?;
            let swap_tx = self.make_swap_tx()?;
            let prevouts = self.swap_prevouts()?;
            let mut cache = SighashCache::new(&swap_tx);
            let sighash = cache.taproot_script_spend_signature_hash(
                0,
                &Prevouts::All(&prevouts),
                TapLeafHash::from_script(&self.ord_swap_script()?, LeafVersion::TapScript),
                TapSighashType::Default,
            )?;
            secp.verify_schnorr(
                &sig,
                &Message::from_digest(sighash.to_byte_array()),
                &market_pk,
            )
            .map_err(|_| ContractError::Signature("market_swap_sig".to_string()))?;
        }

        if let Some(sig_bytes) = &self.funds_swap_sig {
            let sig = serializer::parse_schnorr_sig("funds_swap_sig", sig_bytes)?;
            let swap_tx = self.make_swap_tx()?;
            let prevouts = self.swap_prevouts()?;
            let output_key =
                XOnlyPublicKey::from_slice(&prevouts[1].script_pubkey.as_bytes()[2..34])?;
            let mut cache = SighashCache::new(&swap_tx);
            let sighash = cache.taproot_key_spend_signature_hash(
                1,
                &Prevouts::All(&prevouts),
                TapSighashType::Default,
            )?;
            secp.verify_schnorr(
                &sig,
                &Message::from_digest(sighash.to_byte_array()),
                &output_key,
            )
            .map_err(|_| ContractError::Signature("funds_swap_sig".to_string()))?;
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
    const ORD_TXID: &str = "345567678879784635241fbc876df9c1345567678879784635241fbc876df9c1";
    const FUNDS_TXID: &str = "8f3e642289eda5d79c3212b7c5cd990a81bbeed8e768a28400a79b090adb3166";

    struct Party {
        registry: KeyRegistry,
        keypair: crate::keys::KeyPair,
        address: String,
    }

    fn party(path: &str) -> Party {
        let mut registry = KeyRegistry::new(Network::Regtest, SEED).unwrap();
        registry.add_key_type("swap", FILTER).unwrap();
        let keypair = registry.derive(path, true).unwrap();
        registry.add_key_to_cache(&keypair).unwrap();
        let address = keypair.p2tr_address(registry.secp()).to_string();
        Party {
            registry,
            keypair,
            address,
        }
    }

    fn terms(seller: &Party, buyer: &Party, market: &Party) -> TrustlessSwapInscriptionBuilder {
        let mut swap = TrustlessSwapInscriptionBuilder::new(Network::Regtest);
        swap.market_fee(1000, &market.address).unwrap();
        swap.mining_fee_rate(3000).unwrap();
        swap.ord_price(10_000).unwrap();
        swap.market_script_pub_key(market.keypair.schnorr_public_key())
            .unwrap();
        swap.ord_script_pub_key(seller.keypair.schnorr_public_key())
            .unwrap();
        swap.ord_int_pub_key(seller.keypair.schnorr_public_key())
            .unwrap();
        swap.commit_ordinal(ORD_TXID, 0, 20_000, &seller.address)
            .unwrap();
        swap.funds_payoff_address(&seller.address).unwrap();
        swap.ord_payoff_address(&buyer.address).unwrap();
        swap.fund_commit_ordinal(FUNDS_TXID, 0, 50_000, &buyer.address, &buyer.address)
            .unwrap();
        swap
    }

    #[test]
    fn test_ord_terms_document_roundtrip() {
        let seller = party("m/86'/1'/0'/0/11");
        let buyer = party("m/86'/1'/0'/0/12");
        let market = party("m/86'/1'/0'/0/13");

        let swap = terms(&seller, &buyer, &market);
        let json = swap.serialize(6, TrustlessSwapPhase::OrdTerms).unwrap();
        assert!(json.contains("\"contract_type\":\"TrustlessSwapInscription\""));

        let parsed = TrustlessSwapInscriptionBuilder::deserialize(
            Network::Regtest,
            &json,
            TrustlessSwapPhase::OrdTerms,
        )
        .unwrap();
        assert_eq!(
            parsed.serialize(6, TrustlessSwapPhase::OrdTerms).unwrap(),
            json
        );
    }

    #[test]
    fn test_settlement_needs_every_lock_signature() {
        let seller = party("m/86'/1'/0'/0/11");
        let buyer = party("m/86'/1'/0'/0/12");
        let market = party("m/86'/1'/0'/0/13");

        let mut swap = terms(&seller, &buyer, &market);

        swap.sign_ord_commitment(&seller.registry, "swap").unwrap();
        swap.sign_funds_commitment(&buyer.registry, "swap").unwrap();
        assert_eq!(swap.phase(), Phase::CommitSigned);

        swap.sign_ord_swap(&seller.registry, "swap").unwrap();
        // missing the buyer's settlement signature: not final yet
        assert!(swap.ord_swap_raw_transaction().is_err());

        swap.sign_funds_swap(&buyer.registry, "swap").unwrap();
        assert!(swap.ord_swap_raw_transaction().is_err());

        swap.sign_market_swap(&market.registry, "swap").unwrap();
        assert_eq!(swap.phase(), Phase::InscriptionSigned);

        let raw = swap.ord_swap_raw_transaction().unwrap();
        assert!(!raw.is_empty());
        assert!(!swap.ord_commit_raw_transaction().unwrap().is_empty());
        assert!(!swap.funds_commit_raw_transaction().unwrap().is_empty());
    }

    #[test]
    fn test_signed_contract_roundtrip_verifies() {
        let seller = party("m/86'/1'/0'/0/11");
        let buyer = party("m/86'/1'/0'/0/12");
        let market = party("m/86'/1'/0'/0/13");

        let mut swap = terms(&seller, &buyer, &market);
        swap.sign_ord_commitment(&seller.registry, "swap").unwrap();
        swap.sign_funds_commitment(&buyer.registry, "swap").unwrap();
        swap.sign_ord_swap(&seller.registry, "swap").unwrap();
        swap.sign_funds_swap(&buyer.registry, "swap").unwrap();
        swap.sign_market_swap(&market.registry, "swap").unwrap();

        let json = swap.serialize(6, TrustlessSwapPhase::FundsSwapSig).unwrap();
        let parsed = TrustlessSwapInscriptionBuilder::deserialize(
            Network::Regtest,
            &json,
            TrustlessSwapPhase::FundsSwapSig,
        )
        .unwrap();
        assert_eq!(
            parsed.ord_swap_raw_transaction().unwrap(),
            swap.ord_swap_raw_transaction().unwrap()
        );
    }

    #[test]
    fn test_tampered_price_invalidates_the_seller_signature() {
        let seller = party("m/86'/1'/0'/0/11");
        let buyer = party("m/86'/1'/0'/0/12");
        let market = party("m/86'/1'/0'/0/13");

        let mut swap = terms(&seller, &buyer, &market);
        swap.sign_ord_commitment(&seller.registry, "swap").unwrap();
        swap.sign_funds_commitment(&buyer.registry, "swap").unwrap();
        swap.sign_ord_swap(&seller.registry, "swap").unwrap();

        let json = swap.serialize(6, TrustlessSwapPhase::OrdSwapSig).unwrap();
        let tampered = json.replace("\"ord_price\":10000", "\"ord_price\":900");
        assert!(matches!(
            TrustlessSwapInscriptionBuilder::deserialize(
                Network::Regtest,
                &tampered,
                TrustlessSwapPhase::OrdSwapSig,
            ),
            Err(ContractError::Signature(_))
        ));
    }

    #[test]
    fn test_underfunded_buyer_is_rejected() {
        let seller = party("m/86'/1'/0'/0/11");
        let buyer = party("m/86'/1'/0'/0/12");
        let market = party("m/86'/1'/0'/0/13");

        let mut swap = TrustlessSwapInscriptionBuilder::new(Network::Regtest);
        swap.market_fee(0, &market.address).unwrap();
        swap.mining_fee_rate(3000).unwrap();
        swap.ord_price(10_000).unwrap();
        swap.market_script_pub_key(market.keypair.schnorr_public_key())
            .unwrap();
        swap.ord_script_pub_key(seller.keypair.schnorr_public_key())
            .unwrap();
        swap.ord_int_pub_key(seller.keypair.schnorr_public_key())
            .unwrap();
        swap.commit_ordinal(ORD_TXID, 0, 20_000, &seller.address)
            .unwrap();
        swap.funds_payoff_address(&seller.address).unwrap();
        swap.ord_payoff_address(&buyer.address).unwrap();
        swap.fund_commit_ordinal(FUNDS_TXID, 0, 10_100, &buyer.address, &buyer.address)
            .unwrap();

        assert!(matches!(
            swap.sign_funds_commitment(&buyer.registry, "swap"),
            Err(ContractError::InsufficientFunds(_))
        ));
    }
}
