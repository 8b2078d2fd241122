//! Fee observation for network-priced transactions

use super::builder::FeeQuote;
use crate::chain::RpcGateway;
use crate::error::LoadResult;

use ethers::types::U256;
use tracing::debug;

/// Fee reader with an optional safety buffer for legacy prices
pub struct GasEstimator {
    /// Buffer percentage for gas price (e.g., 10 = 10% above the node's quote)
    gas_price_buffer_percent: u64,
    /// Quote EIP-1559 fee caps instead of a legacy gas price
    dynamic_fees: bool,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(gas_price_buffer_percent: u64) -> Self {
        Self {
            gas_price_buffer_percent,
            dynamic_fees: false,
        }
    }

    pub fn with_dynamic_fees(mut self, dynamic_fees: bool) -> Self {
        self.dynamic_fees = dynamic_fees;
        self
    }

    /// Current network gas price plus buffer
    pub async fn get_gas_price(&self, gateway: &dyn RpcGateway) -> LoadResult<U256> {
        let price = gateway.gas_price().await?;
        let buffered = self.apply_buffer(price);

        debug!("Gas price {} (quoted {})", buffered, price);
        Ok(buffered)
    }

    /// Fees for the next transaction.
    ///
    /// Dynamic quotes double the suggested tip and cap the fee at twice the
    /// latest base fee plus tip, which survives several full blocks of base
    /// fee growth.
    pub async fn get_fees(&self, gateway: &dyn RpcGateway) -> LoadResult<FeeQuote> {
        if !self.dynamic_fees {
            return Ok(FeeQuote::legacy(self.get_gas_price(gateway).await?));
        }

        let (tip, base_fee) = tokio::try_join!(gateway.max_priority_fee(), gateway.base_fee())?;
        let quote = FeeQuote::Dynamic {
            max_fee_per_gas: base_fee.saturating_add(tip).saturating_mul(U256::from(2)),
            max_priority_fee_per_gas: tip.saturating_mul(U256::from(2)),
        };

        debug!("Fee quote {:?} (base fee {}, tip {})", quote, base_fee, tip);
        Ok(quote)
    }

    fn apply_buffer(&self, price: U256) -> U256 {
        let buffer = price.saturating_mul(U256::from(self.gas_price_buffer_percent)) / 100;
        price.saturating_add(buffer)
    }

    /// Upper bound on the wei a transaction can spend
    pub fn calculate_cost(value: U256, gas_limit: u64, gas_price: U256) -> U256 {
        value.saturating_add(U256::from(gas_limit).saturating_mul(gas_price))
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new(0)
    }
}
