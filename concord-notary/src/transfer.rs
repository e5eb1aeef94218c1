//! Cross-chain reserve transfers and their refund forms.

use serde::{Deserialize, Serialize};

use concord_core::{CurrencyId, IdentityId};

// ReserveTransfer flag bits.
const TRANSFER_PRECONVERT: u32 = 1;
const TRANSFER_CONVERT: u32 = 1 << 1;
const TRANSFER_REFUND: u32 = 1 << 2;

/// Conversion fee in basis points (1%).
pub const CONVERSION_FEE_BASIS_POINTS: i64 = 100;

/// Fee charged on a converted value.
pub fn calculate_conversion_fee(value: i64) -> i64 {
    value * CONVERSION_FEE_BASIS_POINTS / 10_000
}

/// One cross-chain value transfer inside an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveTransfer {
    /// Transfer flag bits.
    pub flags: u32,
    /// Currency the value is denominated in.
    #[serde(rename = "currencyid")]
    pub first_currency: CurrencyId,
    /// Transferred value.
    #[serde(rename = "value")]
    pub first_value: i64,
    /// Currency the transfer targets on the destination system.
    #[serde(rename = "destinationcurrencyid")]
    pub dest_currency_id: CurrencyId,
    /// Recipient on the destination system.
    pub destination: IdentityId,
    /// Where value goes if the transfer is refunded.
    #[serde(rename = "returnaddress")]
    pub return_address: IdentityId,
}

impl ReserveTransfer {
    /// A plain transfer with no conversion semantics.
    pub fn new(
        first_currency: CurrencyId,
        first_value: i64,
        dest_currency_id: CurrencyId,
        destination: IdentityId,
        return_address: IdentityId,
    ) -> Self {
        Self {
            flags: 0,
            first_currency,
            first_value,
            dest_currency_id,
            destination,
            return_address,
        }
    }

    /// Mark as a pre-launch conversion.
    pub fn pre_conversion(mut self) -> Self {
        self.flags |= TRANSFER_PRECONVERT;
        self
    }

    /// Mark as a post-launch conversion.
    pub fn conversion(mut self) -> Self {
        self.flags |= TRANSFER_CONVERT;
        self
    }

    /// Whether this transfer converts before launch.
    pub fn is_pre_conversion(&self) -> bool {
        self.flags & TRANSFER_PRECONVERT != 0
    }

    /// Whether this transfer converts after launch.
    pub fn is_conversion(&self) -> bool {
        self.flags & TRANSFER_CONVERT != 0
    }

    /// Whether this transfer is already a refund.
    pub fn is_refund(&self) -> bool {
        self.flags & TRANSFER_REFUND != 0
    }

    /// The canonical "return to sender" form of this transfer.
    ///
    /// Refunding an already-refund transfer is a no-op.
    pub fn refund_transfer(&self) -> Self {
        if self.is_refund() {
            return self.clone();
        }
        let mut refund = self.clone();
        refund.flags = TRANSFER_REFUND;
        refund.dest_currency_id = refund.first_currency;
        refund.destination = refund.return_address;
        refund
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::hash;

    fn transfer(value: i64) -> ReserveTransfer {
        ReserveTransfer::new(
            hash(b"reserve-x"),
            value,
            hash(b"basket"),
            hash(b"alice"),
            hash(b"alice-return"),
        )
    }

    #[test]
    fn test_conversion_fee_is_one_percent() {
        assert_eq!(calculate_conversion_fee(200), 2);
        assert_eq!(calculate_conversion_fee(10_000), 100);
    }

    #[test]
    fn test_refund_redirects_to_return_address() {
        let t = transfer(500).pre_conversion();
        let refund = t.refund_transfer();
        assert!(refund.is_refund());
        assert!(!refund.is_pre_conversion());
        assert_eq!(refund.destination, t.return_address);
        assert_eq!(refund.dest_currency_id, t.first_currency);
        assert_eq!(refund.first_value, 500);
    }

    #[test]
    fn test_refund_is_idempotent() {
        let refund = transfer(500).conversion().refund_transfer();
        assert_eq!(refund.refund_transfer(), refund);
    }

    #[test]
    fn test_flag_accessors() {
        assert!(transfer(1).pre_conversion().is_pre_conversion());
        assert!(transfer(1).conversion().is_conversion());
        assert!(!transfer(1).is_refund());
    }
}
