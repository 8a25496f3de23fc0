use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

use crate::address::{self, AddressKind};
use crate::utils::parse_txid;
use crate::{ContractError, ContractResult};

/// Lifecycle of a contract template.
///
/// Every builder moves forward only: attaching terms happens in `Draft`,
/// the funding check promotes to `Funded`, and the signing stages promote
/// further. Setters called outside their phase fail with
/// [`ContractError::InvalidPhase`] instead of silently mutating a template
/// the counterparty may already hold a signature for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Draft,
    Funded,
    CommitSigned,
    InscriptionSigned,
}

/// What an output is for within a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationRole {
    Ordinal,
    MarketFee,
    AuthorFee,
    CustomFee,
    Change,
}

impl DestinationRole {
    /// Fee collection roles accept a zero amount, meaning "no output".
    fn zero_allowed(&self) -> bool {
        matches!(self, DestinationRole::MarketFee | DestinationRole::AuthorFee)
    }
}

/// A dust-validated output of a contract transaction.
#[derive(Debug, Clone)]
pub struct Destination {
    pub role: DestinationRole,
    pub amount: u64,
    pub address: Address,
    pub kind: AddressKind,
}

impl Destination {
    pub fn new(
        role: DestinationRole,
        field: &'static str,
        amount: u64,
        addr: &str,
        network: Network,
    ) -> ContractResult<Self> {
        let (address, kind) = address::decode(addr, network)?;
        if amount != 0 || !role.zero_allowed() {
            address::check_dust(field, amount, kind)?;
        }
        Ok(Self {
            role,
            amount,
            address,
            kind,
        })
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.amount),
            script_pubkey: self.script_pubkey(),
        }
    }
}

/// A dust-validated reference to an unspent output, plus the witness that
/// spends it once a signing stage has run.
#[derive(Debug, Clone)]
pub struct UtxoRef {
    pub txid: Txid,
    pub nout: u32,
    pub amount: u64,
    pub address: Address,
    pub kind: AddressKind,
    pub witness: Option<Witness>,
}

impl UtxoRef {
    pub fn new(
        field: &'static str,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
        network: Network,
    ) -> ContractResult<Self> {
        let txid = parse_txid(txid)?;
        let (address, kind) = address::decode(addr, network)?;
        address::check_dust(field, amount, kind)?;
        Ok(Self {
            txid,
            nout,
            amount,
            address,
            kind,
            witness: None,
        })
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.nout,
        }
    }

    /// The output this reference spends.
    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.amount),
            script_pubkey: self.address.script_pubkey(),
        }
    }

    pub fn tx_in(&self) -> TxIn {
        TxIn {
            previous_output: self.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_consensus(0xffffffff),
            witness: self.witness.clone().unwrap_or_default(),
        }
    }
}

/// Shared accumulator of the builder family: network, fee rate, ordered
/// destinations and UTXO references, and the phase marker that gates
/// mutation.
#[derive(Debug, Clone)]
pub struct ContractState {
    network: Network,
    mining_fee_rate: Option<u64>,
    destinations: Vec<Destination>,
    utxos: Vec<UtxoRef>,
    phase: Phase,
}

impl ContractState {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            mining_fee_rate: None,
            destinations: Vec::new(),
            utxos: Vec::new(),
            phase: Phase::Draft,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Gate a mutation on the builder still being in `allowed` phase.
    pub fn require_phase(&self, operation: &'static str, allowed: Phase) -> ContractResult<()> {
        if self.phase != allowed {
            return Err(ContractError::InvalidPhase {
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    /// Gate an operation on the builder having reached at least `min`.
    pub fn require_reached(&self, operation: &'static str, min: Phase) -> ContractResult<()> {
        if self.phase < min {
            return Err(ContractError::InvalidPhase {
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    pub fn advance(&mut self, to: Phase) {
        debug_assert!(to >= self.phase);
        self.phase = to;
    }

    pub fn set_mining_fee_rate(&mut self, rate: u64) -> ContractResult<()> {
        self.require_phase("mining_fee_rate", Phase::Draft)?;
        self.mining_fee_rate = Some(rate);
        Ok(())
    }

    /// Fee rate in sat/kvB; required before any funding math.
    pub fn mining_fee_rate(&self) -> ContractResult<u64> {
        self.mining_fee_rate
            .ok_or(ContractError::TermMissing("mining_fee_rate"))
    }

    pub fn add_utxo(
        &mut self,
        field: &'static str,
        txid: &str,
        nout: u32,
        amount: u64,
        addr: &str,
    ) -> ContractResult<()> {
        self.require_phase(field, Phase::Draft)?;
        let utxo = UtxoRef::new(field, txid, nout, amount, addr, self.network)?;
        self.utxos.push(utxo);
        Ok(())
    }

    /// Append a destination, keeping attachment order.
    pub fn push_destination(
        &mut self,
        role: DestinationRole,
        field: &'static str,
        amount: u64,
        addr: &str,
    ) -> ContractResult<()> {
        self.require_phase(field, Phase::Draft)?;
        let destination = Destination::new(role, field, amount, addr, self.network)?;
        self.destinations.push(destination);
        Ok(())
    }

    /// Set the single destination of `role`, replacing an earlier value.
    pub fn set_destination(
        &mut self,
        role: DestinationRole,
        field: &'static str,
        amount: u64,
        addr: &str,
    ) -> ContractResult<()> {
        self.require_phase(field, Phase::Draft)?;
        let destination = Destination::new(role, field, amount, addr, self.network)?;
        if let Some(existing) = self.destinations.iter_mut().find(|d| d.role == role) {
            *existing = destination;
        } else {
            self.destinations.push(destination);
        }
        Ok(())
    }

    pub fn destination(&self, role: DestinationRole) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.role == role)
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn utxos(&self) -> &[UtxoRef] {
        &self.utxos
    }

    pub fn utxos_mut(&mut self) -> &mut [UtxoRef] {
        &mut self.utxos
    }

    pub fn total_input(&self) -> u64 {
        self.utxos.iter().map(|u| u.amount).sum()
    }

    /// Sum of destination amounts, zero-amount fee roles excluded.
    pub fn total_destination(&self) -> u64 {
        self.destinations.iter().map(|d| d.amount).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "bcrt1pm7l3k3ahhfqpzv9nlcc390esx8afn4kgccmcrzzvr8cqdq63kxxqwqqp2f";
    const TXID: &str = "8f3e642289eda5d79c3212b7c5cd990a81bbeed8e768a28400a79b090adb3166";

    #[test]
    fn test_phase_ordering_gates_mutation() {
        let mut state = ContractState::new(Network::Regtest);
        state.set_mining_fee_rate(1000).unwrap();
        state.advance(Phase::CommitSigned);

        let err = state.set_mining_fee_rate(2000).unwrap_err();
        assert!(matches!(
            err,
            ContractError::InvalidPhase {
                phase: Phase::CommitSigned,
                ..
            }
        ));
        assert!(state
            .require_reached("serialize", Phase::InscriptionSigned)
            .is_err());
        assert!(state.require_reached("serialize", Phase::Funded).is_ok());
    }

    #[test]
    fn test_fee_destinations_accept_zero_others_do_not() {
        let mut state = ContractState::new(Network::Regtest);
        state
            .set_destination(DestinationRole::MarketFee, "market_fee", 0, ADDR)
            .unwrap();
        assert!(matches!(
            state.set_destination(DestinationRole::Ordinal, "ord_destination", 0, ADDR),
            Err(ContractError::Dust { .. })
        ));
    }

    #[test]
    fn test_set_destination_replaces_by_role() {
        let mut state = ContractState::new(Network::Regtest);
        state
            .set_destination(DestinationRole::Ordinal, "ord_destination", 546, ADDR)
            .unwrap();
        state
            .set_destination(DestinationRole::Ordinal, "ord_destination", 600, ADDR)
            .unwrap();
        assert_eq!(state.destinations().len(), 1);
        assert_eq!(state.destination(DestinationRole::Ordinal).unwrap().amount, 600);
    }

    #[test]
    fn test_utxo_requires_valid_txid_and_amount() {
        let mut state = ContractState::new(Network::Regtest);
        assert!(matches!(
            state.add_utxo("utxo", "not-a-txid", 0, 10_000, ADDR),
            Err(ContractError::TermWrongValue(_))
        ));
        assert!(matches!(
            state.add_utxo("utxo", TXID, 0, 329, ADDR),
            Err(ContractError::Dust {
                threshold: 330,
                given: 329,
                ..
            })
        ));
        state.add_utxo("utxo", TXID, 0, 10_000, ADDR).unwrap();
        assert_eq!(state.total_input(), 10_000);
    }
}
