//! Price-point and pair value objects.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Order side, inferred from a point's geometry rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy base asset with quote asset.
    Buy,
    /// Sell base asset for quote asset.
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A single grid price point: place `size` at `price`, step out of the
/// way when the ticker crosses `cancel`.
///
/// The side is inferred: a point with `cancel` above `price` is a buy
/// (the order is pulled when the market runs away upward), a point with
/// `cancel` below `price` is a sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    /// Base asset quantity the point wants filled.
    pub size: Decimal,
    /// Limit price.
    pub price: Decimal,
    /// Ticker threshold at which an open order is cancelled.
    pub cancel: Decimal,
}

impl Point {
    /// Validate the point.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invalid`] when any component is
    /// non-positive or `cancel` equals `price` (which would leave the
    /// side undefined).
    pub fn check(&self) -> Result<(), EngineError> {
        if self.size <= Decimal::ZERO {
            return Err(EngineError::invalid(format!(
                "point size must be positive, got {}",
                self.size
            )));
        }
        if self.price <= Decimal::ZERO {
            return Err(EngineError::invalid(format!(
                "point price must be positive, got {}",
                self.price
            )));
        }
        if self.cancel <= Decimal::ZERO {
            return Err(EngineError::invalid(format!(
                "point cancel price must be positive, got {}",
                self.cancel
            )));
        }
        if self.cancel == self.price {
            return Err(EngineError::invalid(
                "point cancel price must differ from the limit price",
            ));
        }

        Ok(())
    }

    /// The side implied by the cancel threshold.
    #[must_use]
    pub fn side(&self) -> Side {
        if self.cancel > self.price {
            Side::Buy
        } else {
            Side::Sell
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}@{} (cancel {})",
            self.side(),
            self.size,
            self.price,
            self.cancel
        )
    }
}

/// A buy point and a sell point forming one profitable round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    /// Where the pair accumulates.
    pub buy: Point,
    /// Where the pair distributes.
    pub sell: Point,
}

impl Pair {
    /// Validate the pair.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invalid`] when either point is invalid, the
    /// sides are wrong, the sell price does not exceed the buy price, or
    /// the sell size exceeds the buy size (the pair would go short).
    pub fn check(&self) -> Result<(), EngineError> {
        self.buy.check()?;
        self.sell.check()?;

        if self.buy.side() != Side::Buy {
            return Err(EngineError::invalid("pair buy point is not a buy"));
        }
        if self.sell.side() != Side::Sell {
            return Err(EngineError::invalid("pair sell point is not a sell"));
        }
        if self.sell.price <= self.buy.price {
            return Err(EngineError::invalid(format!(
                "pair sell price {} must exceed buy price {}",
                self.sell.price, self.buy.price
            )));
        }
        if self.sell.size > self.buy.size {
            return Err(EngineError::invalid(format!(
                "pair sell size {} must not exceed buy size {}",
                self.sell.size, self.buy.size
            )));
        }

        Ok(())
    }

    /// Quote asset needed to fund one full buy of this pair.
    #[must_use]
    pub fn budget(&self) -> Decimal {
        self.buy.size * self.buy.price
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buy {} / sell {}", self.buy, self.sell)
    }
}
