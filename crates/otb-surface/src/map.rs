//! Fixed address map shared by the bridge and the device.
//!
//! ```text
//! holding[0]   order id            (legacy: holding[1] when zero)
//! holding[1]   legacy id / quantity fallback
//! holding[2]   quantity            (legacy: holding[1] when zero)
//! holding[10]  authentication key  (legacy: holding[11] when zero)
//! holding[11]  nonce               (legacy: holding[12] when zero)
//! holding[12]  legacy nonce fallback
//! holding[13]  parameter presence mask
//! holding[14]  abort target (nonce of the job to abort)
//! input[0..2]  produced count (mirrored)
//! input[2]     order id of the admitted job
//! input[3]     nonce of the admitted job
//! discrete[0..2] completion flag (mirrored)
//! coil[0..2]   start trigger (either one)
//! coil[2]      abort request
//! ```

/// Addresses per bank (coils, discrete inputs, holding and input registers).
pub const BANK_SIZE: u16 = 2000;

pub const HR_ORDER_ID: u16 = 0;
pub const HR_LEGACY_FALLBACK: u16 = 1;
pub const HR_QUANTITY: u16 = 2;
pub const HR_AUTH_KEY: u16 = 10;
pub const HR_NONCE: u16 = 11;
pub const HR_LEGACY_NONCE: u16 = 12;
pub const HR_PRESENCE: u16 = 13;
pub const HR_ABORT_NONCE: u16 = 14;

pub const IR_PRODUCED: u16 = 0;
pub const IR_PRODUCED_MIRROR: u16 = 1;
pub const IR_ACTIVE_ORDER: u16 = 2;
pub const IR_ACTIVE_NONCE: u16 = 3;

pub const DI_DONE: u16 = 0;
pub const DI_DONE_MIRROR: u16 = 1;

pub const COIL_START: u16 = 0;
pub const COIL_START_ALT: u16 = 1;
pub const COIL_ABORT: u16 = 2;

/// Bits of `holding[HR_PRESENCE]`.
pub mod presence {
    pub const ORDER_ID: i16 = 0x1;
    pub const QUANTITY: i16 = 0x2;
    pub const KEY: i16 = 0x4;
    pub const NONCE: i16 = 0x8;
    pub const ALL: i16 = ORDER_ID | QUANTITY | KEY | NONCE;
}
