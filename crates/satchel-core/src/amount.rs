//! Coin amounts: parsing user input and rendering friendly strings.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{COIN, COIN_DECIMALS, TICKER};
use crate::error::AmountError;

/// A non-negative amount in satoshis.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    pub fn from_sat(sat: u64) -> Self {
        Self(sat)
    }

    pub fn to_sat(self) -> u64 {
        self.0
    }

    /// Parse a decimal coin amount such as `"0.5"` or `"12"`.
    ///
    /// At most eight fractional digits are accepted. Signs, exponents and
    /// zero are rejected.
    pub fn parse_coins(s: &str) -> Result<Self, AmountError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(AmountError::InvalidFormat(s.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::InvalidFormat(s.to_string()));
        }
        if frac.len() > COIN_DECIMALS {
            return Err(AmountError::TooPrecise { max: COIN_DECIMALS });
        }

        let whole_sat = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u64>()
                .map_err(|_| AmountError::Overflow)?
                .checked_mul(COIN)
                .ok_or(AmountError::Overflow)?
        };
        let frac_sat = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<width$}", width = COIN_DECIMALS);
            padded.parse::<u64>().map_err(|_| AmountError::InvalidFormat(s.to_string()))?
        };
        let total = whole_sat.checked_add(frac_sat).ok_or(AmountError::Overflow)?;
        if total == 0 {
            return Err(AmountError::NotPositive);
        }
        Ok(Self(total))
    }

    /// Friendly form with at least two decimals, e.g. `"0.50 BTC"`.
    pub fn to_friendly_string(self) -> String {
        format!("{} {TICKER}", format_coins(self.0 as i128))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_friendly_string())
    }
}

/// Friendly form of a signed delta, e.g. `"-0.25 BTC"`.
pub fn format_signed(delta: i64) -> String {
    format!("{} {TICKER}", format_coins(delta as i128))
}

fn format_coins(sat: i128) -> String {
    let sign = if sat < 0 { "-" } else { "" };
    let abs = sat.unsigned_abs();
    let coin = COIN as u128;
    let whole = abs / coin;
    let frac = format!("{:0width$}", abs % coin, width = COIN_DECIMALS);
    let trimmed = frac.trim_end_matches('0');
    let frac = if trimmed.len() < 2 { &frac[..2] } else { trimmed };
    format!("{sign}{whole}.{frac}")
}
