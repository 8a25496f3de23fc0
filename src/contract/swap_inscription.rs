use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_CSV, OP_DROP, OP_NUMEQUAL};
use bitcoin::script::Builder as ScriptBuilder;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, ScriptBuf, Sequence, TapLeafHash, TapSighashType, Transaction, TxIn,
    TxOut, Witness,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::address::AddressKind;
use crate::contract::builder::{ContractState, DestinationRole, Phase, UtxoRef};
use crate::contract::serializer::{self, DestinationJson, TransferJson};
use crate::keys::KeyRegistry;
use crate::utils::fees::{
    estimate_vsize, fee_for_vsize, tapscript_spend_vin_vsize, TAPROOT_KEYSPEND_VIN_VSIZE,
    TAPROOT_VOUT_VSIZE, TX_BASE_VSIZE,
};
use crate::utils::taproot::{unspendable_internal_key, TaprootPayload};
use crate::{ContractError, ContractResult};

/// Blocks after which the buyer may reclaim escrowed funds unilaterally.
const PAYBACK_BLOCKS: i64 = 12;

/// Interchange stages of the escrowed swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    OrdTerms,
    FundsTerms,
    FundsCommitSig,
    OrdSwapSig,
    FundsSwapSig,
    MarketSwapSig,
}

/// Escrowed ordinal-for-payment swap.
///
/// The buyer commits funds into a taproot escrow whose swap leaf needs both
/// the buyer key (B) and the designated market key (M); a CSV payback leaf
/// lets the buyer recover funds if the swap never settles. The seller (A)
/// contributes the inscribed UTXO signed `ALL|ANYONECANPAY`, so neither side
/// ever sees the other's private key material and the market cannot move the
/// ordinal without the buyer's cooperation.
#[derive(Debug, Clone)]
pub struct SwapInscriptionBuilder {
    state: ContractState,
    ord_price: Option<u64>,
    ord_mining_fee_rate: Option<u64>,
    ord_utxo: Option<UtxoRef>,
    swap_script_pk_a: Option<XOnlyPublicKey>,
    swap_script_pk_b: Option<XOnlyPublicKey>,
    swap_script_pk_m: Option<XOnlyPublicKey>,
    funds_unspendable_key_factor: Option<SecretKey>,
    ord_swap_sig_a: Option<Vec<u8>>,
    funds_swap_sig_b: Option<Vec<u8>>,
    funds_swap_sig_m: Option<Vec<u8>>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SwapParams {
    protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mining_fee_rate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ord_mining_fee_rate: Option<u64>,
    ord_price: u64,
    market_fee: DestinationJson,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    swap_script_pk_a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    swap_script_pk_b: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    swap_script_pk_m: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ord: Option<TransferJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    funds: Option<Vec<TransferJson>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    funds_unspendable_key_factor: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    funds_swap_sig_b: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    funds_swap_sig_m: Option<Vec<u8>>,
}

impl SwapInscriptionBuilder {
    pub const TYPE: &'static str = "SwapInscription";
    pub const PROTOCOL_VERSION: u32 = 6;
    const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 5..=6;

    pub fn new(network: Network) -> Self {
        Self {
            state: ContractState::new(network),
            ord_price: None,
            ord_mining_fee_rate: None,
            ord_utxo: None,
            swap_script_pk_a: None,
            swap_script_pk_b: None,
            swap_script_pk_m: None,
            funds_unspendable_key_factor: None,
            ord_swap_sig_a: None,
            funds_swap_sig_b: None,
            funds_swap_sig_m: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Price the buyer pays for the ordinal, routed to the seller key.
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

    /// Mining fee rate the ordinal side contributes, sat/kvB.
    pub fn set_ord_mining_fee_rate(&mut self, rate: u64) -> ContractResult<&mut Self> {
        self.state.require_phase("ord_mining_fee_rate", Phase::Draft)?;
        self.ord_mining_fee_rate = Some(rate);
        Ok(self)
    }

    /// The seller's inscribed UTXO.
    pub fn ord_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
    ) -> ContractResult<&mut Self> {
        self.state.require_phase("ord_utxo", Phase::Draft)?;
        self.ord_utxo = Some(UtxoRef::new(
            "ord_utxo",
            txid,
            nout,
            amount,
            addr,
            self.state.network(),
        )?);
        Ok(self)
    }

    /// A payment UTXO of the buyer.
    pub fn add_funds_utxo(
        &mut self,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
    ) -> ContractResult<&mut Self> {
        self.state.add_utxo("funds", txid, nout, amount, addr)?;
        Ok(self)
    }

    /// Seller payoff key. Swap keys are raw internal x-only keys.
    pub fn swap_script_pub_key_a(&mut self, pk: XOnlyPublicKey) -> ContractResult<&mut Self> {
        self.state.require_phase("swap_script_pk_a", Phase::Draft)?;
        self.swap_script_pk_a = Some(pk);
        Ok(self)
    }

    /// Buyer key: receives the ordinal and co-signs the escrow.
    pub fn swap_script_pub_key_b(&mut self, pk: XOnlyPublicKey) -> ContractResult<&mut Self> {
        self.state.require_phase("swap_script_pk_b", Phase::Draft)?;
        self.swap_script_pk_b = Some(pk);
        Ok(self)
    }

    /// Market key controlling the escrow's swap leaf together with B.
    pub fn set_swap_script_pub_key_m(&mut self, pk: XOnlyPublicKey) -> ContractResult<&mut Self> {
        self.state.require_phase("swap_script_pk_m", Phase::Draft)?;
        self.swap_script_pk_m = Some(pk);
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

    fn key_address(&self, pk: XOnlyPublicKey) -> Address {
        let secp = Secp256k1::new();
        Address::p2tr(&secp, pk, None, self.state.network())
    }

    /// `<B> CHECKSIG <M> CHECKSIGADD 2 NUMEQUAL` — both must sign.
    fn swap_script(&self) -> ContractResult<ScriptBuf> {
        let pk_b = self.pk("swap_script_pk_b", &self.swap_script_pk_b)?;
        let pk_m = self.pk("swap_script_pk_m", &self.swap_script_pk_m)?;
        Ok(ScriptBuilder::new()
            .push_x_only_key(&pk_b)
            .push_opcode(OP_CHECKSIG)
            .push_x_only_key(&pk_m)
            .push_opcode(OP_CHECKSIGADD)
            .push_int(2)
            .push_opcode(OP_NUMEQUAL)
            .into_script())
    }

    /// `<12> CSV DROP <B> CHECKSIG` — the buyer's unilateral exit.
    fn payback_script(&self) -> ContractResult<ScriptBuf> {
        let pk_b = self.pk("swap_script_pk_b", &self.swap_script_pk_b)?;
        Ok(ScriptBuilder::new()
            .push_int(PAYBACK_BLOCKS)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_x_only_key(&pk_b)
            .push_opcode(OP_CHECKSIG)
            .into_script())
    }

    fn escrow_payload(&self) -> ContractResult<TaprootPayload> {
        let factor = self
            .funds_unspendable_key_factor
            .as_ref()
            .ok_or(ContractError::TermMissing("funds_unspendable_key_factor"))?;
        let secp = Secp256k1::new();
        let internal = unspendable_internal_key(&secp, factor)?;
        TaprootPayload::build(
            &secp,
            internal,
            &[self.swap_script()?, self.payback_script()?],
            self.state.network(),
        )
    }

    /// Fee the settlement transaction pays, split across both rate terms.
    fn swap_fee(&self) -> ContractResult<u64> {
        let rate = self.state.mining_fee_rate()?;
        let ord_rate = self
            .ord_mining_fee_rate
            .ok_or(ContractError::TermMissing("ord_mining_fee_rate"))?;

        let mut vsize = TX_BASE_VSIZE + tapscript_spend_vin_vsize(self.swap_script()?.len());
        vsize += 2 * TAPROOT_VOUT_VSIZE; // ordinal and price outputs
        if self.market_fee_amount() > 0 {
            vsize += TAPROOT_VOUT_VSIZE;
        }
        Ok(fee_for_vsize(rate, vsize) + fee_for_vsize(ord_rate, TAPROOT_KEYSPEND_VIN_VSIZE))
    }

    /// Value the escrow output must hold.
    fn escrow_amount(&self) -> ContractResult<u64> {
        Ok(self.price()? + self.market_fee_amount() + self.swap_fee()?)
    }

    /// Smallest funds-side input total able to set up the escrow.
    pub fn min_funding_amount(&self) -> ContractResult<u64> {
        let rate = self.state.mining_fee_rate()?;
        let input_kinds: Vec<AddressKind> = if self.state.utxos().is_empty() {
            vec![AddressKind::P2tr]
        } else {
            self.state.utxos().iter().map(|u| u.kind).collect()
        };
        let commit_fee = fee_for_vsize(rate, estimate_vsize(input_kinds, [AddressKind::P2tr]));
        Ok(self.escrow_amount()? + commit_fee)
    }

    fn make_funds_commit_tx(&self) -> ContractResult<Transaction> {
        let payload = self.escrow_payload()?;
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self.state.utxos().iter().map(|u| u.tx_in()).collect(),
            output: vec![TxOut {
                value: Amount::from_sat(self.escrow_amount()?),
                script_pubkey: payload.address.script_pubkey(),
            }],
        })
    }

    fn make_swap_tx(&self) -> ContractResult<Transaction> {
        let ord = self
            .ord_utxo
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_utxo"))?;
        let pk_a = self.pk("swap_script_pk_a", &self.swap_script_pk_a)?;
        let pk_b = self.pk("swap_script_pk_b", &self.swap_script_pk_b)?;

        let funds_commit = self.make_funds_commit_tx()?;

        let mut output = vec![
            TxOut {
                value: Amount::from_sat(ord.amount),
                script_pubkey: self.key_address(pk_b).script_pubkey(),
            },
            TxOut {
                value: Amount::from_sat(self.price()?),
                script_pubkey: self.key_address(pk_a).script_pubkey(),
            },
        ];
        if self.market_fee_amount() > 0 {
            let pk_m = self.pk("swap_script_pk_m", &self.swap_script_pk_m)?;
            output.push(TxOut {
                value: Amount::from_sat(self.market_fee_amount()),
                script_pubkey: self.key_address(pk_m).script_pubkey(),
            });
        }

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![
                ord.tx_in(),
                TxIn {
                    previous_output: bitcoin::OutPoint {
                        txid: funds_commit.txid(),
                        vout: 0,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::from_consensus(0xffffffff),
                    witness: Witness::new(),
                },
            ],
            output,
        })
    }

    fn swap_prevouts(&self) -> ContractResult<Vec<TxOut>> {
        let ord = self
            .ord_utxo
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_utxo"))?;
        let funds_commit = self.make_funds_commit_tx()?;
        Ok(vec![ord.tx_out(), funds_commit.output[0].clone()])
    }

    /// Seller signature over the swap transaction, `ALL|ANYONECANPAY`: it
    /// commits to every payoff output but only to the seller's own input.
    pub fn sign_ord_swap(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        let ord = self
            .ord_utxo
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_utxo"))?;
        let keypair = registry.lookup(&ord.address.to_string(), profile)?;

        let swap_tx = self.make_swap_tx()?;
        let mut cache = SighashCache::new(&swap_tx);
        let sighash = cache.taproot_key_spend_signature_hash(
            0,
            &Prevouts::One(0, ord.tx_out()),
            TapSighashType::AllPlusAnyoneCanPay,
        )?;
        let sig = keypair.sign_keyspend(registry.secp(), sighash.to_byte_array());
        debug!("ord swap signature: {sig}");

        let mut sig_bytes = sig.serialize().to_vec();
        sig_bytes.push(TapSighashType::AllPlusAnyoneCanPay as u8);
        self.ord_swap_sig_a = Some(sig_bytes);
        Ok(())
    }

    /// Buyer signatures moving the payment UTXOs into the escrow. Creates
    /// the escrow key factor, so the escrow address exists from here on.
    pub fn sign_funds_commitment(
        &mut self,
        registry: &KeyRegistry,
        profile: &str,
    ) -> ContractResult<()> {
        if self.funds_unspendable_key_factor.is_none() {
            #[cfg(feature = "rand")]
            {
                self.funds_unspendable_key_factor =
                    Some(SecretKey::new(&mut rand::thread_rng()));
            }
            #[cfg(not(feature = "rand"))]
            return Err(ContractError::TermMissing("funds_unspendable_key_factor"));
        }

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
                    "funds utxo {index}: only taproot inputs can fund the escrow"
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

    /// Buyer half of the escrow's swap leaf.
    pub fn sign_funds_swap(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        let pk_b = self.pk("swap_script_pk_b", &self.swap_script_pk_b)?;
        let keypair = registry.lookup_schnorr(&pk_b, profile)?;
        let sig = self.tapscript_swap_sig(registry, &keypair)?;
        self.funds_swap_sig_b = Some(sig);
        Ok(())
    }

    /// Market half of the escrow's swap leaf; completes the signature set.
    pub fn market_sign_swap(&mut self, registry: &KeyRegistry, profile: &str) -> ContractResult<()> {
        let pk_m = self.pk("swap_script_pk_m", &self.swap_script_pk_m)?;
        let keypair = registry.lookup_schnorr(&pk_m, profile)?;
        let sig = self.tapscript_swap_sig(registry, &keypair)?;
        self.funds_swap_sig_m = Some(sig);

        if self.ord_swap_sig_a.is_some()
            && self.funds_swap_sig_b.is_some()
            && self.state.phase() >= Phase::CommitSigned
        {
            self.state.advance(Phase::InscriptionSigned);
        }
        Ok(())
    }

    fn tapscript_swap_sig(
        &self,
        registry: &KeyRegistry,
        keypair: &crate::keys::KeyPair,
    ) -> ContractResult<Vec<u8>> {
        let swap_tx = self.make_swap_tx()?;
        let prevouts = self.swap_prevouts()?;
        let mut cache = SighashCache::new(&swap_tx);
        let sighash = cache.taproot_script_spend_signature_hash(
            1,
            &Prevouts::All(&prevouts),
            TapLeafHash::from_script(&self.swap_script()?, LeafVersion::TapScript),
            TapSighashType::Default,
        )?;
        let sig = keypair.sign_tapscript(registry.secp(), sighash.to_byte_array());
        debug!("escrow swap leaf signature: {sig}");
        Ok(sig.serialize().to_vec())
    }

    /// The buyer's escrow funding transaction, fully signed.
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
        let payload = self.escrow_payload()?;

        let sig_a = self
            .ord_swap_sig_a
            .as_ref()
            .ok_or(ContractError::TermMissing("ord_swap_sig_a"))?;
        swap_tx.input[0].witness = Witness::from_slice(&[sig_a.as_slice()]);

        let sig_b = self
            .funds_swap_sig_b
            .as_ref()
            .ok_or(ContractError::TermMissing("funds_swap_sig_b"))?;
        let sig_m = self
            .funds_swap_sig_m
            .as_ref()
            .ok_or(ContractError::TermMissing("funds_swap_sig_m"))?;
        // CHECKSIGADD consumes signatures in reverse key order: B's on top
        let mut witness = Witness::new();
        witness.push(sig_m.as_slice());
        witness.push(sig_b.as_slice());
        witness.push(payload.script.as_bytes());
        witness.push(payload.control_block.serialize());
        swap_tx.input[1].witness = witness;

        Ok(bitcoin::consensus::encode::serialize_hex(&swap_tx))
    }

    fn check_contract_terms(&self, phase: SwapPhase) -> ContractResult<()> {
        self.price()?;
        self.state
            .destination(DestinationRole::MarketFee)
            .ok_or(ContractError::TermMissing("market_fee"))?;
        self.state.mining_fee_rate()?;

        match phase {
            SwapPhase::OrdTerms => {
                self.ord_utxo
                    .as_ref()
                    .ok_or(ContractError::TermMissing("ord_utxo"))?;
                self.pk("swap_script_pk_a", &self.swap_script_pk_a)?;
                self.pk("swap_script_pk_m", &self.swap_script_pk_m)?;
                self.ord_mining_fee_rate
                    .ok_or(ContractError::TermMissing("ord_mining_fee_rate"))?;
            }
            SwapPhase::FundsTerms => {
                if self.state.utxos().is_empty() {
                    return Err(ContractError::TermMissing("funds"));
                }
                self.pk("swap_script_pk_b", &self.swap_script_pk_b)?;
                self.pk("swap_script_pk_m", &self.swap_script_pk_m)?;
            }
            SwapPhase::FundsCommitSig => {
                self.check_contract_terms(SwapPhase::FundsTerms)?;
                self.funds_unspendable_key_factor
                    .as_ref()
                    .ok_or(ContractError::TermMissing("funds_unspendable_key_factor"))?;
                if self.state.utxos().iter().any(|u| u.witness.is_none()) {
                    return Err(ContractError::TermMissing("funds commit sig"));
                }
            }
            SwapPhase::OrdSwapSig => {
                self.check_contract_terms(SwapPhase::OrdTerms)?;
                self.pk("swap_script_pk_b", &self.swap_script_pk_b)?;
                self.ord_swap_sig_a
                    .as_ref()
                    .ok_or(ContractError::TermMissing("ord_swap_sig_a"))?;
            }
            SwapPhase::FundsSwapSig => {
                self.check_contract_terms(SwapPhase::FundsCommitSig)?;
                self.funds_swap_sig_b
                    .as_ref()
                    .ok_or(ContractError::TermMissing("funds_swap_sig_b"))?;
            }
            SwapPhase::MarketSwapSig => {
                self.check_contract_terms(SwapPhase::FundsSwapSig)?;
                self.check_contract_terms(SwapPhase::OrdSwapSig)?;
                self.funds_swap_sig_m
                    .as_ref()
                    .ok_or(ContractError::TermMissing("funds_swap_sig_m"))?;
            }
        }
        Ok(())
    }

    pub fn serialize(&self, version: u32, phase: SwapPhase) -> ContractResult<String> {
        serializer::check_protocol_version(version, &Self::SUPPORTED_VERSIONS)?;
        self.check_contract_terms(phase)?;

        let market_fee = self
            .state
            .destination(DestinationRole::MarketFee)
            .map(DestinationJson::of)
            .ok_or(ContractError::TermMissing("market_fee"))?;

        let include_ord = matches!(
            phase,
            SwapPhase::OrdTerms
                | SwapPhase::OrdSwapSig
                | SwapPhase::FundsSwapSig
                | SwapPhase::MarketSwapSig
        );
        let include_funds = !matches!(phase, SwapPhase::OrdTerms | SwapPhase::OrdSwapSig);

        let ord = if include_ord {
            self.ord_utxo.as_ref().map(|u| {
                let mut json = TransferJson::of(u);
                json.sig = if phase == SwapPhase::OrdTerms {
                    None
                } else {
                    self.ord_swap_sig_a.clone()
                };
                json
            })
        } else {
            None
        };

        let funds = if include_funds {
            Some(
                self.state
                    .utxos()
                    .iter()
                    .map(|u| {
                        let mut json = TransferJson::of(u);
                        if phase == SwapPhase::FundsTerms {
                            json.sig = None;
                        }
                        json
                    })
                    .collect(),
            )
        } else {
            None
        };

        let params = SwapParams {
            protocol_version: version,
            mining_fee_rate: Some(self.state.mining_fee_rate()?),
            ord_mining_fee_rate: self.ord_mining_fee_rate,
            ord_price: self.price()?,
            market_fee,
            swap_script_pk_a: self.swap_script_pk_a.map(|pk| pk.to_string()),
            swap_script_pk_b: self.swap_script_pk_b.map(|pk| pk.to_string()),
            swap_script_pk_m: self.swap_script_pk_m.map(|pk| pk.to_string()),
            ord,
            funds,
            funds_unspendable_key_factor: if include_funds {
                self.funds_unspendable_key_factor
                    .as_ref()
                    .map(|f| f.secret_bytes().to_vec())
            } else {
                None
            },
            funds_swap_sig_b: self.funds_swap_sig_b.clone(),
            funds_swap_sig_m: self.funds_swap_sig_m.clone(),
        };
        serializer::serialize(Self::TYPE, &params)
    }

    /// Import a counterpart's document and re-validate it for `phase`.
    pub fn deserialize(network: Network, json: &str, phase: SwapPhase) -> ContractResult<Self> {
        let params: SwapParams = serializer::deserialize(json, Self::TYPE)?;
        if !Self::SUPPORTED_VERSIONS.contains(&params.protocol_version) {
            return Err(ContractError::ProtocolVersion(params.protocol_version));
        }

        let mut builder = Self::new(network);
        if let Some(rate) = params.mining_fee_rate {
            builder.mining_fee_rate(rate)?;
        }
        if let Some(rate) = params.ord_mining_fee_rate {
            builder.set_ord_mining_fee_rate(rate)?;
        }
        builder.ord_price(params.ord_price)?;
        builder.market_fee(params.market_fee.amount, &params.market_fee.addr)?;

        if let Some(pk) = &params.swap_script_pk_a {
            builder.swap_script_pub_key_a(serializer::parse_xonly("swap_script_pk_a", pk)?)?;
        }
        if let Some(pk) = &params.swap_script_pk_b {
            builder.swap_script_pub_key_b(serializer::parse_xonly("swap_script_pk_b", pk)?)?;
        }
        if let Some(pk) = &params.swap_script_pk_m {
            builder.set_swap_script_pub_key_m(serializer::parse_xonly("swap_script_pk_m", pk)?)?;
        }

        if let Some(ord) = &params.ord {
            builder.ord_utxo(&ord.txid, ord.nout, ord.amount, &ord.addr)?;
            builder.ord_swap_sig_a = ord.sig.clone();
        }
        if let Some(funds) = &params.funds {
            for (index, transfer) in funds.iter().enumerate() {
                builder.add_funds_utxo(
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
        if let Some(factor) = &params.funds_unspendable_key_factor {
            builder.funds_unspendable_key_factor = Some(
                SecretKey::from_slice(factor).map_err(|e| {
                    ContractError::TermWrongValue(format!("funds_unspendable_key_factor: {e}"))
                })?,
            );
        }
        builder.funds_swap_sig_b = params.funds_swap_sig_b.clone();
        builder.funds_swap_sig_m = params.funds_swap_sig_m.clone();

        builder.check_contract_terms(phase)?;
        builder.check_sigs(phase)?;

        match phase {
            SwapPhase::FundsCommitSig | SwapPhase::FundsSwapSig => {
                builder.state.advance(Phase::CommitSigned)
            }
            SwapPhase::MarketSwapSig => builder.state.advance(Phase::InscriptionSigned),
            _ => {}
        }
        Ok(builder)
    }

    /// Verify whatever signatures the imported document carries.
    fn check_sigs(&self, phase: SwapPhase) -> ContractResult<()> {
        let secp = Secp256k1::new();

        if matches!(phase, SwapPhase::FundsCommitSig | SwapPhase::FundsSwapSig | SwapPhase::MarketSwapSig) {
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
                let output_key =
                    XOnlyPublicKey::from_slice(&spk.as_bytes()[2..34])?;
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

        if let Some(sig_a) = &self.ord_swap_sig_a {
            if sig_a.len() != 65 || sig_a[64] != TapSighashType::AllPlusAnyoneCanPay as u8 {
                return Err(ContractError::Signature(
                    "ord_swap_sig_a must use ALL|ANYONECANPAY".to_string(),
                ));
            }
            let ord = self
                .ord_utxo
                .as_ref()
                .ok_or(ContractError::TermMissing("ord_utxo"))?;
            let sig = serializer::parse_schnorr_sig("ord_swap_sig_a", &sig_a[..64])?;
            let swap_tx = self.make_swap_tx()?;
            let mut cache = SighashCache::new(&swap_tx);
            let sighash = cache.taproot_key_spend_signature_hash(
                0,
                &Prevouts::One(0, ord.tx_out()),
                TapSighashType::AllPlusAnyoneCanPay,
            )?;
            let spk = ord.address.script_pubkey();
            if !spk.is_p2tr() {
                return Err(ContractError::Signature(
                    "ord_utxo: not a taproot prevout".to_string(),
                ));
            }
            let output_key = XOnlyPublicKey::from_slice(&spk.as_bytes()[2..34])?;
            secp.verify_schnorr(
                &sig,
                &Message::from_digest(sighash.to_byte_array()),
                &output_key,
            )
            .map_err(|_| ContractError::Signature("ord_swap_sig_a".to_string()))?;
        }

        for (field, sig_bytes, pk) in [
            ("funds_swap_sig_b", &self.funds_swap_sig_b, self.swap_script_pk_b),
            ("funds_swap_sig_m", &self.funds_swap_sig_m, self.swap_script_pk_m),
        ] {
            let Some(sig_bytes) = sig_bytes else { continue };
            let pk = pk.ok_or(ContractError::TermMissing("swap script key"))?;
            let sig = serializer::parse_schnorr_sig(field, sig_bytes)?;
            let swap_tx = self.make_swap_tx()?;
            let prevouts = self.swap_prevouts()?;
            let mut cache = SighashCache::new(&swap_tx);
            let sighash = cache.taproot_script_spend_signature_hash(
                1,
                &Prevouts::All(&prevouts),
                TapLeafHash::from_script(&self.swap_script()?, LeafVersion::TapScript),
                TapSighashType::Default,
            )?;
            secp.verify_schnorr(&sig, &Message::from_digest(sighash.to_byte_array()), &pk)
                .map_err(|_| ContractError::Signature(field.to_string()))?;
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

    fn terms(seller: &Party, buyer: &Party, market: &Party) -> SwapInscriptionBuilder {
        let mut swap = SwapInscriptionBuilder::new(Network::Regtest);
        swap.ord_price(10_000).unwrap();
        swap.market_fee(1000, &market.address).unwrap();
        swap.mining_fee_rate(3000).unwrap();
        swap.set_ord_mining_fee_rate(3000).unwrap();
        swap.ord_utxo(ORD_TXID, 0, 546, &seller.address).unwrap();
        swap.add_funds_utxo(FUNDS_TXID, 0, 50_000, &buyer.address)
            .unwrap();
        swap.swap_script_pub_key_a(seller.keypair.schnorr_public_key())
            .unwrap();
        swap.swap_script_pub_key_b(buyer.keypair.schnorr_public_key())
            .unwrap();
        swap.set_swap_script_pub_key_m(market.keypair.schnorr_public_key())
            .unwrap();
        swap
    }

    #[test]
    fn test_ord_terms_document_can_be_emitted_unsigned() {
        let seller = party("m/86'/1'/0'/0/1");
        let buyer = party("m/86'/1'/0'/0/2");
        let market = party("m/86'/1'/0'/0/3");

        let swap = terms(&seller, &buyer, &market);
        let json = swap.serialize(5, SwapPhase::OrdTerms).unwrap();
        assert!(json.contains("\"contract_type\":\"SwapInscription\""));

        let parsed =
            SwapInscriptionBuilder::deserialize(Network::Regtest, &json, SwapPhase::OrdTerms)
                .unwrap();
        assert_eq!(parsed.serialize(5, SwapPhase::OrdTerms).unwrap(), json);
    }

    #[test]
    fn test_full_swap_signature_flow() {
        let seller = party("m/86'/1'/0'/0/1");
        let buyer = party("m/86'/1'/0'/0/2");
        let market = party("m/86'/1'/0'/0/3");

        let mut swap = terms(&seller, &buyer, &market);

        swap.sign_funds_commitment(&buyer.registry, "swap").unwrap();
        assert_eq!(swap.phase(), Phase::CommitSigned);

        swap.sign_ord_swap(&seller.registry, "swap").unwrap();
        swap.sign_funds_swap(&buyer.registry, "swap").unwrap();
        swap.market_sign_swap(&market.registry, "swap").unwrap();
        assert_eq!(swap.phase(), Phase::InscriptionSigned);

        let commit_raw = swap.funds_commit_raw_transaction().unwrap();
        let swap_raw = swap.ord_swap_raw_transaction().unwrap();
        assert!(!commit_raw.is_empty());
        assert!(!swap_raw.is_empty());

        // the fully signed contract round-trips with signature verification
        let json = swap.serialize(6, SwapPhase::MarketSwapSig).unwrap();
        let parsed = SwapInscriptionBuilder::deserialize(
            Network::Regtest,
            &json,
            SwapPhase::MarketSwapSig,
        )
        .unwrap();
        assert_eq!(
            parsed.ord_swap_raw_transaction().unwrap(),
            swap_raw
        );
    }

    #[test]
    fn test_underfunded_escrow_is_rejected() {
        let seller = party("m/86'/1'/0'/0/1");
        let buyer = party("m/86'/1'/0'/0/2");
        let market = party("m/86'/1'/0'/0/3");

        let mut swap = SwapInscriptionBuilder::new(Network::Regtest);
        swap.ord_price(10_000).unwrap();
        swap.market_fee(0, &market.address).unwrap();
        swap.mining_fee_rate(3000).unwrap();
        swap.set_ord_mining_fee_rate(3000).unwrap();
        swap.ord_utxo(ORD_TXID, 0, 546, &seller.address).unwrap();
        swap.add_funds_utxo(FUNDS_TXID, 0, 10_500, &buyer.address)
            .unwrap();
        swap.swap_script_pub_key_a(seller.keypair.schnorr_public_key())
            .unwrap();
        swap.swap_script_pub_key_b(buyer.keypair.schnorr_public_key())
            .unwrap();
        swap.set_swap_script_pub_key_m(market.keypair.schnorr_public_key())
            .unwrap();

        assert!(matches!(
            swap.sign_funds_commitment(&buyer.registry, "swap"),
            Err(ContractError::InsufficientFunds(_))
        ));
    }

    #[test]
    fn test_ord_price_below_dust_is_rejected() {
        let mut swap = SwapInscriptionBuilder::new(Network::Regtest);
        assert!(matches!(
            swap.ord_price(329),
            Err(ContractError::Dust {
                field: "ord_price",
                threshold: 330,
                given: 329,
            })
        ));
    }

    #[test]
    fn test_serialize_checks_phase_terms() {
        let seller = party("m/86'/1'/0'/0/1");
        let buyer = party("m/86'/1'/0'/0/2");
        let market = party("m/86'/1'/0'/0/3");

        let swap = terms(&seller, &buyer, &market);
        // nothing is signed yet, the commit-signed document cannot be emitted
        assert!(matches!(
            swap.serialize(6, SwapPhase::FundsCommitSig),
            Err(ContractError::TermMissing(_))
        ));
    }
}
