// src/instance/ports.rs

use std::collections::HashSet;

use crate::error::{Result, ShimError};

/// Lowest port in `from..=to` not held by a live instance.
pub fn allocate(from: u16, to: u16, held: &HashSet<u16>) -> Result<u16> {
    (from..=to)
        .find(|port| !held.contains(port))
        .ok_or(ShimError::PortsExhausted { from, to })
}
