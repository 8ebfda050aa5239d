//! otb-surface
//!
//! The control surface is the typed view over the device's register/coil
//! address space. Both the bridge and the device speak in terms of this
//! crate; neither touches raw addresses outside of `map`.
//!
//! - `map`: the fixed address constants.
//! - [`ControlSurface`]: atomic storage for the four banks.
//! - [`SurfaceEvent`]: change notifications emitted by a transport after it
//!   applied a remote write.
//! - [`StartTransaction`] / [`StartParameters`]: how a start request is laid
//!   out in holding registers, in either [`AddressingMode`].

pub mod map;
mod params;
mod surface;

pub use params::{AddressingMode, MissingParameter, StartParameters, StartTransaction};
pub use surface::ControlSurface;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A remote write landed on the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    CoilsChanged { start: u16, count: u16 },
    HoldingChanged { start: u16, count: u16 },
}

impl SurfaceEvent {
    /// `true` if the written range includes `address`.
    pub fn touches(&self, address: u16) -> bool {
        let (start, count) = match *self {
            SurfaceEvent::CoilsChanged { start, count } => (start, count),
            SurfaceEvent::HoldingChanged { start, count } => (start, count),
        };
        address >= start && u32::from(address) < u32::from(start) + u32::from(count)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl std::fmt::Display for Bank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Bank::Coil => "coil",
            Bank::Discrete => "discrete",
            Bank::Holding => "holding",
            Bank::Input => "input",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceError {
    AddressOutOfRange { bank: Bank, address: u16, count: u16 },
}

impl std::fmt::Display for SurfaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SurfaceError::AddressOutOfRange {
                bank,
                address,
                count,
            } => write!(
                f,
                "{bank}[{address}..+{count}] outside 0..{}",
                map::BANK_SIZE
            ),
        }
    }
}

impl std::error::Error for SurfaceError {}

/// A value that does not fit the protocol's non-negative word range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeError {
    pub field: &'static str,
    pub value: i64,
}

impl std::fmt::Display for RangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} = {} outside protocol range 0..={}",
            self.field,
            self.value,
            i16::MAX
        )
    }
}

impl std::error::Error for RangeError {}

// ---------------------------------------------------------------------------
// Word conversion
// ---------------------------------------------------------------------------

/// Convert a non-negative value to a register word, refusing to wrap.
pub fn to_word(field: &'static str, value: i64) -> Result<i16, RangeError> {
    if (0..=i64::from(i16::MAX)).contains(&value) {
        Ok(value as i16)
    } else {
        Err(RangeError { field, value })
    }
}

/// Saturate a count at the largest representable register value.
pub fn clamp_word(count: u32) -> i16 {
    count.min(i16::MAX as u32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_touches_its_range_only() {
        let ev = SurfaceEvent::CoilsChanged { start: 1, count: 2 };
        assert!(!ev.touches(0));
        assert!(ev.touches(1));
        assert!(ev.touches(2));
        assert!(!ev.touches(3));
    }

    #[test]
    fn clamp_word_saturates() {
        assert_eq!(clamp_word(0), 0);
        assert_eq!(clamp_word(32_767), i16::MAX);
        assert_eq!(clamp_word(u32::MAX), i16::MAX);
    }

    #[test]
    fn to_word_bounds() {
        assert_eq!(to_word("x", 0), Ok(0));
        assert_eq!(to_word("x", 32_767), Ok(i16::MAX));
        assert!(to_word("x", 32_768).is_err());
        assert!(to_word("x", -1).is_err());
    }
}
