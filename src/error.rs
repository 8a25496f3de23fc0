use thiserror::Error;

use crate::contract::Phase;

/// Contract library error.
///
/// Callers are expected to branch on the variant, not on the message text:
/// every validation failure is reported as a distinct kind carrying the
/// offending field or value.
#[derive(Error, Debug)]
pub enum ContractError {
    /// An amount was assigned below the dust threshold of its address kind.
    #[error("dust amount for {field}: {given} sat is below the {threshold} sat minimum")]
    Dust {
        field: &'static str,
        threshold: u64,
        given: u64,
    },
    /// Attached UTXOs cannot cover the destinations plus mining fee.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// A term required by the requested operation or phase is not set.
    #[error("contract term is missing: {0}")]
    TermMissing(&'static str),
    /// A term is present but holds a value the contract cannot accept.
    #[error("wrong contract term value: {0}")]
    TermWrongValue(String),
    /// A deserialized term contradicts the one already held by the builder.
    #[error("contract term mismatch: {0}")]
    TermMismatch(String),
    /// A mutation was attempted outside the phase that allows it.
    #[error("{operation} is not allowed in the {phase:?} phase")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },
    /// A key lookup filter misses required fields or holds malformed ones.
    #[error("wrong key lookup filter: {0}")]
    WrongKeyLookupFilter(String),
    /// A derivation path string could not be parsed.
    #[error("wrong derivation path: {0}")]
    WrongDerivationPath(String),
    /// A derivation profile name is already registered.
    #[error("duplicate profile: {0}")]
    DuplicateProfile(String),
    /// No cached keypair matches the requested address and profile.
    #[error("key not found: {0}")]
    KeyNotFound(String),
    /// The master seed is not valid hex of an acceptable length.
    #[error("invalid seed: {0}")]
    InvalidSeed(String),
    /// Malformed JSON document, signature blob or address string.
    #[error("parse error: {0}")]
    Parse(String),
    /// The requested contract protocol version is not supported.
    #[error("unsupported protocol version: {0}")]
    ProtocolVersion(u32),
    /// A provided signature does not verify against its transaction.
    #[error("signature error: {0}")]
    Signature(String),
    /// Taproot script tree construction failed.
    #[error("taproot compute error")]
    TaprootCompute,
    #[error("bitcoin sighash error: {0}")]
    BitcoinSigHash(#[from] bitcoin::sighash::Error),
    #[error("bitcoin script error: {0}")]
    PushBytes(#[from] bitcoin::script::PushBytesError),
    #[error("secp256k1 error: {0}")]
    Secp(#[from] bitcoin::secp256k1::Error),
}

impl From<serde_json::Error> for ContractError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<hex::FromHexError> for ContractError {
    fn from(e: hex::FromHexError) -> Self {
        Self::Parse(e.to_string())
    }
}
