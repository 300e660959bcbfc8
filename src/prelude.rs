//! Crate prelude.

use hmac::Hmac;
pub use hmac::Mac;
use sha2::Sha256;

pub use crate::error::EngineError;
pub use crate::point::{Pair, Point, Side};
pub use crate::shutdown::{StopCause, StopToken};

/// Hashing type for digital signatures.
pub type HmacSha256 = Hmac<Sha256>;

/// Ticker fan-out subscription.
pub type TickerFeed = crate::topic::Subscription<crate::exchange::Ticker>;

/// Order update fan-out subscription.
pub type OrderFeed = crate::topic::Subscription<crate::exchange::OrderRecord>;
