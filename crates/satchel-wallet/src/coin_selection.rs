//! Largest-first coin selection.
//!
//! UTXOs are sorted by value descending (outpoint ascending as tiebreaker, so
//! the choice is deterministic) and taken greedily until they cover the
//! target plus the fixed fee. Change below the dust limit is added to the fee
//! instead of creating an unspendable output.

use satchel_core::constants::DUST_LIMIT;

use crate::error::WalletError;
use crate::store::WalletUtxo;

/// Result of coin selection: which UTXOs to spend and the fee/change breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<WalletUtxo>,
    /// Sum of the selected values.
    pub total_input: u64,
    /// Amount paid to the recipient.
    pub amount: u64,
    /// Fee actually paid, including any folded dust change.
    pub fee: u64,
    /// Change returned to the wallet. Zero or at least the dust limit.
    pub change: u64,
}

pub struct CoinSelector;

impl CoinSelector {
    /// Select UTXOs covering `target + fee`.
    ///
    /// Callers pass only spendable UTXOs; pending-spent ones must already be
    /// filtered out.
    pub fn select(utxos: &[WalletUtxo], target: u64, fee: u64) -> Result<CoinSelection, WalletError> {
        if target == 0 {
            return Err(WalletError::InvalidAmount("target must be non-zero".into()));
        }
        let needed = target
            .checked_add(fee)
            .ok_or_else(|| WalletError::InvalidAmount("amount plus fee overflows".into()))?;
        if utxos.is_empty() {
            return Err(WalletError::InsufficientFunds { have: 0, need: needed });
        }

        let mut sorted: Vec<&WalletUtxo> = utxos.iter().collect();
        sorted.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));

        let mut selected = Vec::new();
        let mut total_input: u64 = 0;
        for utxo in sorted {
            selected.push(utxo.clone());
            total_input = total_input.saturating_add(utxo.value);

            if total_input >= needed {
                let surplus = total_input - needed;
                let (change, fee) = if surplus < DUST_LIMIT {
                    (0, fee + surplus)
                } else {
                    (surplus, fee)
                };
                return Ok(CoinSelection { selected, total_input, amount: target, fee, change });
            }
        }

        Err(WalletError::InsufficientFunds { have: total_input, need: needed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::{Chain, KeyOrigin};
    use satchel_core::constants::COIN;
    use satchel_core::types::{Hash256, OutPoint, Script};

    fn utxo(tag: u8, value: u64) -> WalletUtxo {
        WalletUtxo {
            outpoint: OutPoint::new(Hash256([tag; 32]), 0),
            value,
            script_pubkey: Script::p2pkh(&[tag; 20]),
            origin: KeyOrigin { chain: Chain::External, index: tag as u32 },
            height: Some(1),
        }
    }

    #[test]
    fn select_single_utxo_with_change() {
        let utxos = vec![utxo(1, 10 * COIN)];
        let result = CoinSelector::select(&utxos, 8 * COIN, 10_000).unwrap();
        assert_eq!(result.selected.len(), 1);
        assert_eq!(result.fee, 10_000);
        assert_eq!(result.change, 2 * COIN - 10_000);
    }

    #[test]
    fn largest_first() {
        let utxos = vec![utxo(1, COIN), utxo(2, 5 * COIN), utxo(3, 2 * COIN)];
        let result = CoinSelector::select(&utxos, 3 * COIN, 10_000).unwrap();
        assert_eq!(result.selected.len(), 1);
        assert_eq!(result.selected[0].outpoint.txid, Hash256([2; 32]));
    }

    #[test]
    fn ties_broken_by_outpoint() {
        let utxos = vec![utxo(9, COIN), utxo(4, COIN)];
        let result = CoinSelector::select(&utxos, COIN / 2, 0).unwrap();
        assert_eq!(result.selected[0].outpoint.txid, Hash256([4; 32]));
    }

    #[test]
    fn accumulates_multiple_inputs() {
        let utxos = vec![utxo(1, 2 * COIN), utxo(2, 2 * COIN), utxo(3, 2 * COIN)];
        let result = CoinSelector::select(&utxos, 5 * COIN, 10_000).unwrap();
        assert_eq!(result.selected.len(), 3);
        assert_eq!(result.total_input, 6 * COIN);
    }

    #[test]
    fn dust_change_folded_into_fee() {
        let utxos = vec![utxo(1, 100_000)];
        let result = CoinSelector::select(&utxos, 89_800, 10_000).unwrap();
        assert_eq!(result.change, 0);
        assert_eq!(result.fee, 10_200);
        assert_eq!(result.amount + result.fee, result.total_input);
    }

    #[test]
    fn insufficient_funds() {
        let utxos = vec![utxo(1, COIN)];
        let err = CoinSelector::select(&utxos, COIN, 10_000).unwrap_err();
        assert_eq!(err, WalletError::InsufficientFunds { have: COIN, need: COIN + 10_000 });
    }

    #[test]
    fn empty_set_is_insufficient() {
        let err = CoinSelector::select(&[], COIN, 10_000).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { have: 0, .. }));
    }

    #[test]
    fn zero_target_rejected() {
        let err = CoinSelector::select(&[utxo(1, COIN)], 0, 10_000).unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
    }

    #[test]
    fn fields_balance() {
        let utxos = vec![utxo(1, 5 * COIN), utxo(2, 3 * COIN)];
        let r = CoinSelector::select(&utxos, 6 * COIN, 10_000).unwrap();
        assert_eq!(r.total_input, r.amount + r.fee + r.change);
    }
}
