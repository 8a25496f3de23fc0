mod builder;
mod create_inscription;
mod serializer;
mod simple_transaction;
mod swap_inscription;
mod trustless_swap;

pub use builder::{ContractState, Destination, DestinationRole, Phase, UtxoRef};
pub use create_inscription::{CreateInscriptionBuilder, InscribePhase};
pub use serializer::{ContractDocument, DestinationJson, TransferJson, UtxoJson};
pub use simple_transaction::{SimpleTransaction, TxPhase};
pub use swap_inscription::{SwapInscriptionBuilder, SwapPhase};
pub use trustless_swap::{TrustlessSwapInscriptionBuilder, TrustlessSwapPhase};
