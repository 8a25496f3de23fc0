//! Virtual-size and mining-fee estimation for contract transactions.
//!
//! Rates travel through contract documents as integer sat/kvB; fees always
//! round up so an estimated transaction never pays below the agreed rate.

use crate::address::AddressKind;

/// Non-witness overhead of a transaction: version, locktime, in/out counts.
pub const TX_BASE_VSIZE: u64 = 10;
/// A taproot output.
pub const TAPROOT_VOUT_VSIZE: u64 = 43;
/// A taproot keyspend input, witness included.
pub const TAPROOT_KEYSPEND_VIN_VSIZE: u64 = 58;
/// The smallest taproot transaction: one keyspend input, one output.
pub const MIN_TAPROOT_TX_VSIZE: u64 =
    TX_BASE_VSIZE + TAPROOT_VOUT_VSIZE + TAPROOT_KEYSPEND_VIN_VSIZE;

/// Fee in sats for `vsize` virtual bytes at `rate` sat/kvB, rounded up.
pub fn fee_for_vsize(rate: u64, vsize: u64) -> u64 {
    (rate * vsize).div_ceil(1000)
}

/// Virtual size of a taproot script-path input revealing `script_len` bytes
/// of tapscript with a single-leaf control block.
pub fn tapscript_spend_vin_vsize(script_len: usize) -> u64 {
    // keyspend base plus script, control block and their compact-size prefixes
    TAPROOT_KEYSPEND_VIN_VSIZE + (script_len as u64 + 33 + 3).div_ceil(4)
}

/// Virtual size of a transaction with `input_kinds` witness inputs and
/// `output_kinds` outputs, all spent by their standard single-signature path.
pub fn estimate_vsize(
    input_kinds: impl IntoIterator<Item = AddressKind>,
    output_kinds: impl IntoIterator<Item = AddressKind>,
) -> u64 {
    TX_BASE_VSIZE
        + input_kinds
            .into_iter()
            .map(|k| k.input_vsize())
            .sum::<u64>()
        + output_kinds
            .into_iter()
            .map(|k| k.output_vsize())
            .sum::<u64>()
}
