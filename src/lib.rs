//! # ord-contracts
//!
//! A library for building, validating, partially signing and exchanging
//! Bitcoin transaction contracts around Ordinal inscriptions:
//!
//! - [`CreateInscriptionBuilder`] mints content onto a satoshi through the
//!   commit/reveal pattern;
//! - [`SwapInscriptionBuilder`] and [`TrustlessSwapInscriptionBuilder`]
//!   settle an inscribed UTXO against a payment between mutually
//!   distrusting parties, with and without a market-escrowed path;
//! - [`SimpleTransaction`] is the template-free contract container;
//! - [`KeyRegistry`] owns HD key derivation and reverse address lookup;
//! - [`Bip322`] signs and verifies off-chain messages.
//!
//! Contracts travel between parties as versioned JSON documents: each side
//! deserializes, re-validates every term, appends its own signatures and
//! re-serializes, so no party ever needs another's private key material.

#[macro_use]
extern crate log;

mod address;
mod bip322;
mod contract;
mod error;
mod keys;
mod result;
mod utils;

pub use address::AddressKind;
pub use bip322::Bip322;
pub use contract::{
    ContractState, CreateInscriptionBuilder, Destination, DestinationRole, InscribePhase, Phase,
    SimpleTransaction, SwapInscriptionBuilder, SwapPhase, TrustlessSwapInscriptionBuilder,
    TrustlessSwapPhase, TxPhase, UtxoRef,
};
pub use error::ContractError;
pub use keys::{DerivationProfile, KeyPair, KeyRegistry, KeyType};
pub use result::ContractResult;
