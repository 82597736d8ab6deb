//! Node types and wei amounts.
//!
//! Transactions and receipts come from the node as Alloy RPC types. Required amounts arrive as
//! decimal wei strings and are handled as [`U256`], the width of the EVM `value` field, so
//! amounts above 64 bits compare exactly.

use alloy_primitives::U256;

pub use alloy_rpc_types_eth::{Transaction, TransactionReceipt};

/// A required amount, written as a decimal wei string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredWei {
    Exact(U256),
    /// Larger than any `uint256`; no transaction can satisfy it.
    Unreachable,
}

/// Parses a decimal wei amount. Returns `None` if the input is not a plain digit string.
pub fn parse_decimal_wei(value: &str) -> Option<RequiredWei> {
    let digits = value.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Digits-only input fails to parse only on overflow.
    Some(match U256::from_str_radix(digits, 10) {
        Ok(amount) => RequiredWei::Exact(amount),
        Err(_) => RequiredWei::Unreachable,
    })
}
