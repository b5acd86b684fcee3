// src/converter.rs
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PaymasterError, PaymasterResult};

/// Token minimal units per native minimal unit, as `numerator / denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    numerator: U256,
    denominator: U256,
}

impl ExchangeRate {
    pub fn new(numerator: U256, denominator: U256) -> PaymasterResult<Self> {
        if numerator.is_zero() || denominator.is_zero() {
            return Err(PaymasterError::InvalidParameters(
                "exchange rate terms must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn whole(rate: u64) -> PaymasterResult<Self> {
        Self::new(rate.into(), U256::one())
    }

    pub fn numerator(&self) -> U256 {
        self.numerator
    }

    pub fn denominator(&self) -> U256 {
        self.denominator
    }

    /// Token amount for `gas_cost`, rounded up.
    pub fn apply(&self, gas_cost: U256) -> PaymasterResult<U256> {
        let scaled = gas_cost
            .checked_mul(self.numerator)
            .ok_or(PaymasterError::GasOverflow)?;
        let (quotient, remainder) = scaled.div_mod(self.denominator);
        if remainder.is_zero() {
            Ok(quotient)
        } else {
            quotient
                .checked_add(U256::one())
                .ok_or(PaymasterError::GasOverflow)
        }
    }
}

impl fmt::Display for ExchangeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == U256::one() {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl FromStr for ExchangeRate {
    type Err = PaymasterError;

    /// Parses `N` or `N/D` in decimal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            U256::from_dec_str(part.trim())
                .map_err(|e| PaymasterError::InvalidParameters(format!("bad rate {s:?}: {e}")))
        };
        match s.split_once('/') {
            Some((num, den)) => Self::new(parse(num)?, parse(den)?),
            None => Self::new(parse(s)?, U256::one()),
        }
    }
}

/// Static per-token exchange-rate table owned by one sponsor.
#[derive(Debug, Clone, Default)]
pub struct CostConverter {
    rates: HashMap<Address, ExchangeRate>,
}

impl CostConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Administrative rate registration. Replaces any previous rate.
    pub fn add_token(&mut self, token: Address, rate: ExchangeRate) {
        info!("Registered token {:?} at rate {}", token, rate);
        self.rates.insert(token, rate);
    }

    pub fn rate_of(&self, token: Address) -> PaymasterResult<ExchangeRate> {
        self.rates
            .get(&token)
            .copied()
            .ok_or(PaymasterError::UnknownToken(token))
    }

    pub fn quote(&self, token: Address, gas_cost: U256) -> PaymasterResult<U256> {
        self.rate_of(token)?.apply(gas_cost)
    }

    pub fn supported_tokens(&self) -> Vec<Address> {
        let mut tokens: Vec<_> = self.rates.keys().copied().collect();
        tokens.sort();
        tokens
    }
}
