//! Shared register storage.
//!
//! # Invariants
//!
//! - Every cell is a word-sized atomic. Readers (the polling bridge) never
//!   observe a torn value while the device writes.
//! - `ControlSurface` never emits events. Change notification belongs to the
//!   transport that applied a remote write; the device's own writes are
//!   silent, so clearing a coil from inside the device cannot re-trigger it.

use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};

use crate::map::{
    BANK_SIZE, COIL_ABORT, COIL_START, COIL_START_ALT, DI_DONE, DI_DONE_MIRROR,
    IR_ACTIVE_NONCE, IR_ACTIVE_ORDER, IR_PRODUCED, IR_PRODUCED_MIRROR,
};
use crate::{clamp_word, Bank, SurfaceError};

/// Coils, discrete inputs, holding registers and input registers of one device.
pub struct ControlSurface {
    coils: Vec<AtomicBool>,
    discrete: Vec<AtomicBool>,
    holding: Vec<AtomicI16>,
    input: Vec<AtomicI16>,
}

impl Default for ControlSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControlSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSurface")
            .field("start", &self.start_requested())
            .field("abort", &self.abort_requested())
            .field("produced", &self.produced())
            .field("done", &self.done())
            .finish()
    }
}

fn check(bank: Bank, address: u16, count: u16) -> Result<(), SurfaceError> {
    let end = u32::from(address) + u32::from(count);
    if count == 0 || end > u32::from(BANK_SIZE) {
        return Err(SurfaceError::AddressOutOfRange {
            bank,
            address,
            count,
        });
    }
    Ok(())
}

impl ControlSurface {
    /// All cells zeroed / cleared.
    pub fn new() -> Self {
        let n = usize::from(BANK_SIZE);
        Self {
            coils: (0..n).map(|_| AtomicBool::new(false)).collect(),
            discrete: (0..n).map(|_| AtomicBool::new(false)).collect(),
            holding: (0..n).map(|_| AtomicI16::new(0)).collect(),
            input: (0..n).map(|_| AtomicI16::new(0)).collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Range access (transport side)
    // -----------------------------------------------------------------------

    pub fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, SurfaceError> {
        check(Bank::Coil, address, count)?;
        Ok(read_bits(&self.coils, address, count))
    }

    pub fn read_discrete_inputs(&self, address: u16, count: u16) -> Result<Vec<bool>, SurfaceError> {
        check(Bank::Discrete, address, count)?;
        Ok(read_bits(&self.discrete, address, count))
    }

    pub fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<i16>, SurfaceError> {
        check(Bank::Holding, address, count)?;
        Ok(read_words(&self.holding, address, count))
    }

    pub fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<i16>, SurfaceError> {
        check(Bank::Input, address, count)?;
        Ok(read_words(&self.input, address, count))
    }

    pub fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), SurfaceError> {
        let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
        check(Bank::Coil, address, count)?;
        for (cell, v) in self.coils[usize::from(address)..].iter().zip(values) {
            cell.store(*v, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn write_holding_registers(&self, address: u16, values: &[i16]) -> Result<(), SurfaceError> {
        let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
        check(Bank::Holding, address, count)?;
        for (cell, v) in self.holding[usize::from(address)..].iter().zip(values) {
            cell.store(*v, Ordering::SeqCst);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Single-cell access (addresses from `map` are always in range)
    // -----------------------------------------------------------------------

    pub fn coil(&self, address: u16) -> bool {
        bit(&self.coils, address)
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        set_bit(&self.coils, address, value);
    }

    pub fn holding(&self, address: u16) -> i16 {
        word(&self.holding, address)
    }

    pub fn set_holding(&self, address: u16, value: i16) {
        set_word(&self.holding, address, value);
    }

    pub fn input(&self, address: u16) -> i16 {
        word(&self.input, address)
    }

    pub fn set_input(&self, address: u16, value: i16) {
        set_word(&self.input, address, value);
    }

    pub fn discrete(&self, address: u16) -> bool {
        bit(&self.discrete, address)
    }

    pub fn set_discrete(&self, address: u16, value: bool) {
        set_bit(&self.discrete, address, value);
    }

    // -----------------------------------------------------------------------
    // Semantic helpers
    // -----------------------------------------------------------------------

    /// Either start coil is set.
    pub fn start_requested(&self) -> bool {
        self.coil(COIL_START) || self.coil(COIL_START_ALT)
    }

    pub fn clear_start_coils(&self) {
        self.set_coil(COIL_START, false);
        self.set_coil(COIL_START_ALT, false);
    }

    pub fn abort_requested(&self) -> bool {
        self.coil(COIL_ABORT)
    }

    pub fn clear_abort(&self) {
        self.set_coil(COIL_ABORT, false);
    }

    /// Zero the produced-count mirror and clear the completion flags.
    pub fn reset_progress(&self) {
        self.set_input(IR_PRODUCED, 0);
        self.set_input(IR_PRODUCED_MIRROR, 0);
        self.set_discrete(DI_DONE, false);
        self.set_discrete(DI_DONE_MIRROR, false);
    }

    /// Write `count` (clamped to `i16::MAX`) to both produced-count registers.
    pub fn publish_produced(&self, count: u32) {
        let word = clamp_word(count);
        self.set_input(IR_PRODUCED, word);
        self.set_input(IR_PRODUCED_MIRROR, word);
    }

    pub fn produced(&self) -> i16 {
        self.input(IR_PRODUCED)
    }

    /// Set both completion bits.
    pub fn mark_done(&self) {
        self.set_discrete(DI_DONE, true);
        self.set_discrete(DI_DONE_MIRROR, true);
    }

    pub fn done(&self) -> bool {
        self.discrete(DI_DONE)
    }

    /// Echo the admitted job. The nonce is written last: a reader that sees
    /// it has also seen the progress reset that preceded admission.
    pub fn set_active_job(&self, order_id: i16, nonce: i16) {
        self.set_input(IR_ACTIVE_ORDER, order_id);
        self.set_input(IR_ACTIVE_NONCE, nonce);
    }

    pub fn active_order(&self) -> i16 {
        self.input(IR_ACTIVE_ORDER)
    }

    pub fn active_nonce(&self) -> i16 {
        self.input(IR_ACTIVE_NONCE)
    }
}

fn read_bits(cells: &[AtomicBool], address: u16, count: u16) -> Vec<bool> {
    let start = usize::from(address);
    cells[start..start + usize::from(count)]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .collect()
}

fn read_words(cells: &[AtomicI16], address: u16, count: u16) -> Vec<i16> {
    let start = usize::from(address);
    cells[start..start + usize::from(count)]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .collect()
}

// Out-of-range single-cell reads return the cleared value and writes are
// dropped; only `map` constants reach these.
fn bit(cells: &[AtomicBool], address: u16) -> bool {
    cells
        .get(usize::from(address))
        .map(|c| c.load(Ordering::SeqCst))
        .unwrap_or(false)
}

fn set_bit(cells: &[AtomicBool], address: u16, value: bool) {
    if let Some(c) = cells.get(usize::from(address)) {
        c.store(value, Ordering::SeqCst);
    }
}

fn word(cells: &[AtomicI16], address: u16) -> i16 {
    cells
        .get(usize::from(address))
        .map(|c| c.load(Ordering::SeqCst))
        .unwrap_or(0)
}

fn set_word(cells: &[AtomicI16], address: u16, value: i16) {
    if let Some(c) = cells.get(usize::from(address)) {
        c.store(value, Ordering::SeqCst);
    }
}
