// src/protocol/mod.rs
//
// Fixed-layout status and control frames for the stock CAN devices the
// subsystem talks to. Pure byte-array pack/unpack, no concurrency; the
// device API carries the payloads, these modules give them meaning.

pub mod pcm;
pub mod pdp;

use crate::error::{CanError, CanResult};

pub(crate) fn require_len(data: &[u8], len: usize) -> CanResult<()> {
    if data.len() < len {
        return Err(CanError::ParameterOutOfRange);
    }
    Ok(())
}
