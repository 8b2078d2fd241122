//! Validated construction of unsigned transactions

use crate::config::{TargetConfig, TxDefaults};
use crate::error::{LoadError, LoadResult};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Eip1559TransactionRequest, TransactionRequest, U256};
use ethers::utils::parse_units;

/// Where the gas price of a transaction comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPriceSource {
    Fixed(U256),
    /// Use the gas price observed from the node for this iteration
    Network,
}

/// Raw, unvalidated description of what to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub to: String,
    pub value: String,
    pub gas_price: GasPriceSource,
}

impl TxRequest {
    pub fn from_target(target: &TargetConfig) -> LoadResult<Self> {
        let gas_price = match &target.gas_price {
            Some(raw) => GasPriceSource::Fixed(parse_amount(raw)?),
            None => GasPriceSource::Network,
        };

        Ok(Self {
            to: target.to.clone(),
            value: target.value.clone(),
            gas_price,
        })
    }
}

/// Fee fields of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeQuote {
    Legacy {
        gas_price: U256,
    },
    /// EIP-1559 fee cap and tip
    Dynamic {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl FeeQuote {
    pub fn legacy(gas_price: U256) -> Self {
        Self::Legacy { gas_price }
    }

    /// Most the transaction can pay per unit of gas
    pub fn max_price_per_gas(&self) -> U256 {
        match self {
            Self::Legacy { gas_price } => *gas_price,
            Self::Dynamic {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic { .. })
    }
}

/// A fully specified transaction awaiting a signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    to: Address,
    value: U256,
    fees: FeeQuote,
    nonce: u64,
    gas_limit: Option<u64>,
    chain_id: Option<u64>,
}

impl UnsignedTransaction {
    pub fn to(&self) -> Address {
        self.to
    }

    pub fn value(&self) -> U256 {
        self.value
    }

    /// Effective upper bound on the price per gas
    pub fn gas_price(&self) -> U256 {
        self.fees.max_price_per_gas()
    }

    pub fn fees(&self) -> FeeQuote {
        self.fees
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn gas_limit(&self) -> Option<u64> {
        self.gas_limit
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.chain_id
    }

    /// Signer input: EIP-155 legacy or EIP-1559, following the fee kind
    pub fn to_typed(&self) -> TypedTransaction {
        match self.fees {
            FeeQuote::Legacy { gas_price } => {
                let mut tx = TransactionRequest::new()
                    .to(self.to)
                    .value(self.value)
                    .gas_price(gas_price)
                    .nonce(self.nonce);

                if let Some(gas) = self.gas_limit {
                    tx = tx.gas(gas);
                }
                if let Some(chain_id) = self.chain_id {
                    tx = tx.chain_id(chain_id);
                }

                TypedTransaction::Legacy(tx)
            }
            FeeQuote::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut tx = Eip1559TransactionRequest::new()
                    .to(self.to)
                    .value(self.value)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas)
                    .nonce(self.nonce);

                if let Some(gas) = self.gas_limit {
                    tx = tx.gas(gas);
                }
                if let Some(chain_id) = self.chain_id {
                    tx = tx.chain_id(chain_id);
                }

                TypedTransaction::Eip1559(tx)
            }
        }
    }
}

/// Applies defaults and validation to transaction requests. Pure.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    gas_limit: Option<u64>,
    chain_id: Option<u64>,
    default_gas_price: Option<U256>,
    dynamic_fees: bool,
}

impl TransactionBuilder {
    pub fn new(gas_limit: Option<u64>, chain_id: Option<u64>, default_gas_price: Option<U256>) -> Self {
        Self {
            gas_limit,
            chain_id,
            default_gas_price,
            dynamic_fees: false,
        }
    }

    /// Emit EIP-1559 transactions instead of legacy ones
    pub fn with_dynamic_fees(mut self, dynamic_fees: bool) -> Self {
        self.dynamic_fees = dynamic_fees;
        self
    }

    /// Builder from configured defaults; `chain_id` overrides the configured one
    pub fn from_defaults(defaults: &TxDefaults, chain_id: u64) -> LoadResult<Self> {
        let default_gas_price = defaults.gas_price.as_deref().map(parse_amount).transpose()?;
        Ok(Self::new(Some(defaults.gas_limit), Some(chain_id), default_gas_price)
            .with_dynamic_fees(defaults.dynamic_txs))
    }

    /// Validate `request` and assemble the transaction for `nonce`.
    /// `network_fees` is consulted only for `GasPriceSource::Network`.
    pub fn build(
        &self,
        request: &TxRequest,
        nonce: u64,
        network_fees: Option<FeeQuote>,
    ) -> LoadResult<UnsignedTransaction> {
        let to = parse_address(&request.to)?;
        let value = parse_amount(&request.value)?;

        let fees = match request.gas_price {
            GasPriceSource::Fixed(price) => self.flat_fees(price),
            GasPriceSource::Network => match network_fees {
                Some(quote) => self.conform(quote),
                None => self
                    .default_gas_price
                    .map(|price| self.flat_fees(price))
                    .ok_or_else(|| {
                        LoadError::GasEstimation(
                            "no network gas price observed and no default configured".to_string(),
                        )
                    })?,
            },
        };

        Ok(UnsignedTransaction {
            to,
            value,
            fees,
            nonce,
            gas_limit: self.gas_limit,
            chain_id: self.chain_id,
        })
    }

    /// A single configured price; as a fee cap it doubles as the tip
    fn flat_fees(&self, price: U256) -> FeeQuote {
        if self.dynamic_fees {
            FeeQuote::Dynamic {
                max_fee_per_gas: price,
                max_priority_fee_per_gas: price,
            }
        } else {
            FeeQuote::legacy(price)
        }
    }

    fn conform(&self, quote: FeeQuote) -> FeeQuote {
        match (self.dynamic_fees, quote) {
            (true, FeeQuote::Legacy { gas_price }) => self.flat_fees(gas_price),
            (false, FeeQuote::Dynamic { .. }) => FeeQuote::legacy(quote.max_price_per_gas()),
            _ => quote,
        }
    }
}

/// Parse a `0x`-prefixed, 40 hex digit address. Case is not significant.
pub fn parse_address(input: &str) -> LoadResult<Address> {
    let invalid = |reason: &str| LoadError::InvalidAddress {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| invalid("missing 0x prefix"))?;

    if digits.len() != 40 {
        return Err(invalid("expected 40 hex digits"));
    }

    let bytes = hex::decode(digits).map_err(|e| invalid(&e.to_string()))?;
    Ok(Address::from_slice(&bytes))
}

/// Parse a non-negative amount in wei.
///
/// Accepts a plain decimal integer (`"100000000000000"`) or a decimal with a
/// unit suffix (`"0.0001ether"`, `"20 gwei"`, `"5wei"`).
pub fn parse_amount(input: &str) -> LoadResult<U256> {
    let invalid = |reason: String| LoadError::InvalidAmount {
        input: input.to_string(),
        reason,
    };

    let normalized = input.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(invalid("empty amount".to_string()));
    }
    if normalized.starts_with('-') {
        return Err(invalid("amount must be non-negative".to_string()));
    }

    let (number, unit) = ["ether", "gwei", "wei"]
        .iter()
        .find_map(|unit| normalized.strip_suffix(unit).map(|n| (n.trim(), Some(*unit))))
        .unwrap_or((normalized.as_str(), None));

    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(invalid("not a decimal number".to_string()));
    }

    match unit {
        None | Some("wei") => {
            U256::from_dec_str(number).map_err(|e| invalid(format!("not representable: {}", e)))
        }
        Some(unit) => parse_units(number, unit)
            .map(U256::from)
            .map_err(|e| invalid(format!("not representable: {}", e))),
    }
}
