//! Start-transaction parameters: bridge-side encoding and device-side decoding.
//!
//! Two addressing modes exist:
//!
//! | Mode       | A zero register means            | Missing parameter |
//! |------------|----------------------------------|-------------------|
//! | `Explicit` | the value zero                   | presence bit unset ⇒ error |
//! | `Legacy`   | "not written, use the fallback"  | never detected    |
//!
//! `Legacy` reproduces the original register layout bit for bit, including
//! its ambiguity: a real order id or quantity of zero is read from the
//! fallback address instead.

use serde::{Deserialize, Serialize};

use crate::map::{
    presence, HR_AUTH_KEY, HR_LEGACY_FALLBACK, HR_LEGACY_NONCE, HR_NONCE, HR_ORDER_ID,
    HR_PRESENCE, HR_QUANTITY,
};
use crate::{to_word, ControlSurface, RangeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingMode {
    /// Primary addresses only, gated by the presence mask in `holding[13]`.
    #[default]
    Explicit,
    /// Zero-means-unset fallback addressing.
    Legacy,
}

// ---------------------------------------------------------------------------
// Device side
// ---------------------------------------------------------------------------

/// Parameters of a start request as read from the holding registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartParameters {
    pub order_id: i16,
    pub quantity: i16,
    pub key: i16,
    pub nonce: i16,
}

/// A parameter the presence mask did not declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingParameter(pub &'static str);

impl std::fmt::Display for MissingParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "start parameter not written: {}", self.0)
    }
}

impl std::error::Error for MissingParameter {}

fn non_zero_or(surface: &ControlSurface, primary: u16, fallback: u16) -> i16 {
    match surface.holding(primary) {
        0 => surface.holding(fallback),
        v => v,
    }
}

impl StartParameters {
    /// Read the credentials (key, nonce) only.
    ///
    /// The device authenticates before it looks at the job parameters, so
    /// credentials are read on their own.
    pub fn read_credentials(
        surface: &ControlSurface,
        mode: AddressingMode,
    ) -> Result<(i16, i16), MissingParameter> {
        match mode {
            AddressingMode::Legacy => Ok((
                non_zero_or(surface, HR_AUTH_KEY, HR_NONCE),
                non_zero_or(surface, HR_NONCE, HR_LEGACY_NONCE),
            )),
            AddressingMode::Explicit => {
                let mask = surface.holding(HR_PRESENCE);
                require(mask, presence::KEY, "key")?;
                require(mask, presence::NONCE, "nonce")?;
                Ok((surface.holding(HR_AUTH_KEY), surface.holding(HR_NONCE)))
            }
        }
    }

    /// Read all four parameters.
    pub fn read(surface: &ControlSurface, mode: AddressingMode) -> Result<Self, MissingParameter> {
        let (key, nonce) = Self::read_credentials(surface, mode)?;
        let (order_id, quantity) = match mode {
            AddressingMode::Legacy => (
                non_zero_or(surface, HR_ORDER_ID, HR_LEGACY_FALLBACK),
                non_zero_or(surface, HR_QUANTITY, HR_LEGACY_FALLBACK),
            ),
            AddressingMode::Explicit => {
                let mask = surface.holding(HR_PRESENCE);
                require(mask, presence::ORDER_ID, "order_id")?;
                require(mask, presence::QUANTITY, "quantity")?;
                (surface.holding(HR_ORDER_ID), surface.holding(HR_QUANTITY))
            }
        };
        Ok(Self {
            order_id,
            quantity,
            key,
            nonce,
        })
    }
}

fn require(mask: i16, bit: i16, name: &'static str) -> Result<(), MissingParameter> {
    if mask & bit == bit {
        Ok(())
    } else {
        Err(MissingParameter(name))
    }
}

// ---------------------------------------------------------------------------
// Bridge side
// ---------------------------------------------------------------------------

/// A validated start transaction, ready to be written register by register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTransaction {
    pub order_id: i16,
    pub quantity: i16,
    pub key: i16,
    pub nonce: i16,
}

impl StartTransaction {
    /// Validate an order's id and quantity against the word range.
    ///
    /// # Errors
    /// [`RangeError`] if either value is negative or above `i16::MAX`.
    pub fn new(order_id: i64, quantity: i32, key: i16, nonce: i16) -> Result<Self, RangeError> {
        Ok(Self {
            order_id: to_word("order_id", order_id)?,
            quantity: to_word("quantity", i64::from(quantity))?,
            key,
            nonce,
        })
    }

    /// Holding-register writes in the order the bridge issues them.
    ///
    /// The legacy fallback registers are zeroed so a stale value from a
    /// previous job is never picked up, and the presence mask goes last.
    pub fn register_writes(&self) -> [(u16, i16); 7] {
        [
            (HR_ORDER_ID, self.order_id),
            (HR_LEGACY_FALLBACK, 0),
            (HR_QUANTITY, self.quantity),
            (HR_AUTH_KEY, self.key),
            (HR_NONCE, self.nonce),
            (HR_LEGACY_NONCE, 0),
            (HR_PRESENCE, presence::ALL),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: i16 = 0xBEEFu16 as i16;

    fn written(tx: &StartTransaction) -> ControlSurface {
        let s = ControlSurface::new();
        for (addr, v) in tx.register_writes() {
            s.set_holding(addr, v);
        }
        s
    }

    #[test]
    fn explicit_mode_reads_what_the_bridge_wrote() {
        let tx = StartTransaction::new(12, 3, KEY, 99).unwrap();
        let p = StartParameters::read(&written(&tx), AddressingMode::Explicit).unwrap();
        assert_eq!(
            p,
            StartParameters {
                order_id: 12,
                quantity: 3,
                key: KEY,
                nonce: 99
            }
        );
    }

    #[test]
    fn legacy_mode_reads_what_the_bridge_wrote() {
        let tx = StartTransaction::new(12, 3, KEY, 99).unwrap();
        let p = StartParameters::read(&written(&tx), AddressingMode::Legacy).unwrap();
        assert_eq!((p.order_id, p.quantity, p.key, p.nonce), (12, 3, KEY, 99));
    }

    #[test]
    fn explicit_mode_keeps_a_real_zero_quantity() {
        let s = ControlSurface::new();
        let tx = StartTransaction::new(5, 0, KEY, 1).unwrap();
        for (addr, v) in tx.register_writes() {
            s.set_holding(addr, v);
        }
        // A stale fallback value must not leak into an explicit zero.
        s.set_holding(HR_LEGACY_FALLBACK, 40);
        let p = StartParameters::read(&s, AddressingMode::Explicit).unwrap();
        assert_eq!(p.quantity, 0);
    }

    #[test]
    fn legacy_mode_falls_back_on_zero() {
        let s = ControlSurface::new();
        s.set_holding(HR_LEGACY_FALLBACK, 8);
        s.set_holding(HR_NONCE, KEY);
        s.set_holding(HR_LEGACY_NONCE, 4);
        let p = StartParameters::read(&s, AddressingMode::Legacy).unwrap();
        // id and quantity both come from holding[1]; key from holding[11].
        assert_eq!(p.order_id, 8);
        assert_eq!(p.quantity, 8);
        assert_eq!(p.key, KEY);
        assert_eq!(p.nonce, KEY);
    }

    #[test]
    fn explicit_mode_reports_missing_parameter() {
        let s = ControlSurface::new();
        s.set_holding(HR_AUTH_KEY, KEY);
        s.set_holding(HR_PRESENCE, presence::KEY);
        assert_eq!(
            StartParameters::read_credentials(&s, AddressingMode::Explicit),
            Err(MissingParameter("nonce"))
        );
    }

    #[test]
    fn out_of_range_values_are_rejected_not_wrapped() {
        let err = StartTransaction::new(40_000, 1, KEY, 1).unwrap_err();
        assert_eq!(err.field, "order_id");
        assert_eq!(err.value, 40_000);
        assert!(StartTransaction::new(1, -1, KEY, 1).is_err());
        assert!(StartTransaction::new(i64::from(i16::MAX), i32::from(i16::MAX), KEY, 1).is_ok());
    }
}
