use std::str::FromStr;

use bitcoin::Txid;

pub mod fees;
mod h160;
mod push_bytes;
mod sha256;
pub mod taproot;

pub use h160::h160sum;
pub use push_bytes::bytes_to_push_bytes;
pub use sha256::sha256sum;

use crate::{ContractError, ContractResult};

pub const PROTOCOL_ID: [u8; 3] = *b"ord";
/// Tag 1, representing the MIME type of the envelope body.
pub const CONTENT_TYPE_TAG: [u8; 1] = [1];

/// Parse a 32-byte transaction id from its hex form.
pub fn parse_txid(s: &str) -> ContractResult<Txid> {
    Txid::from_str(s).map_err(|e| ContractError::TermWrongValue(format!("txid {s}: {e}")))
}
