//! Configuration constants and parameter validation.
//!
//! All format limits and tuning knobs live in `constants`; the validation
//! helpers here turn out-of-range parameters into errors before any file is
//! touched.

mod constants;

pub use constants::*;

use eyre::{ensure, Result};

/// Checks that a block size is a power of two within the supported range.
pub fn validate_block_size(block_size: usize) -> Result<()> {
    ensure!(
        (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) && block_size.is_power_of_two(),
        "invalid block size: {} (must be a power of two in {}..={})",
        block_size,
        MIN_BLOCK_SIZE,
        MAX_BLOCK_SIZE
    );
    Ok(())
}

/// Checks that a key size fits the record and header formats.
pub fn validate_key_size(key_size: usize) -> Result<()> {
    ensure!(
        (MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&key_size),
        "invalid key size: {} (must be in {}..={})",
        key_size,
        MIN_KEY_SIZE,
        MAX_KEY_SIZE
    );
    Ok(())
}

/// Checks that a load factor lies in (0, 1].
pub fn validate_load_factor(load_factor: f64) -> Result<()> {
    ensure!(
        load_factor > 0.0 && load_factor <= 1.0,
        "invalid load factor: {} (must be in (0, 1])",
        load_factor
    );
    Ok(())
}
