//! Position word codec for the servo register map.
//!
//! The servo firmware stores goal and present positions as a single unsigned
//! 16-bit word using a sign-fold convention: non-negative logical positions
//! occupy the lower half of the wire domain and negative positions are folded
//! into the upper half. This module owns the mapping in both directions so
//! the rest of the crate only ever deals in signed logical counts.
//!
//! The two directions are intentionally asymmetric:
//!
//! - `encode` clips to the safety sub-range `[-SAFETY_CLIP, SAFETY_CLIP]`
//!   before folding, so a command can never drive an axis to its mechanical
//!   extremes.
//! - `decode` accepts the full wire domain `[0, WIRE_MAX]` and can therefore
//!   report logical magnitudes up to `LOGICAL_MAX`, positions the hardware
//!   may legitimately be sitting at even though `encode` will never command
//!   them.
//!
//! Round-trip identity `decode(encode(x)) == x` holds exactly on the safety
//! range and nowhere else.

/// Largest logical magnitude the wire format can represent.
pub const LOGICAL_MAX: i32 = 32767;

/// Symmetric clip applied to commanded positions before encoding.
pub const SAFETY_CLIP: i32 = 32000;

/// Largest meaningful wire word; `encode(-LOGICAL_MAX)` would land here.
pub const WIRE_MAX: u16 = 65534;

/// Encode a signed logical position into the unsigned wire word.
///
/// Values outside the safety range saturate to the nearest safety bound
/// before folding.
pub fn encode(logical: i32) -> u16 {
    let clipped = logical.clamp(-SAFETY_CLIP, SAFETY_CLIP);
    if clipped >= 0 {
        clipped as u16
    } else {
        (LOGICAL_MAX - clipped) as u16
    }
}

/// Decode an unsigned wire word back into a signed logical position.
///
/// Words above `WIRE_MAX` (only 65535 is possible) are treated as `WIRE_MAX`.
pub fn decode(wire: u16) -> i32 {
    let clipped = wire.min(WIRE_MAX) as i32;
    if clipped <= LOGICAL_MAX {
        clipped
    } else {
        LOGICAL_MAX - clipped
    }
}

/// Decode a sign-magnitude speed word: bit 15 carries the sign, the low
/// 15 bits the magnitude. Used by the present-speed half of the status
/// register.
pub fn decode_speed(wire: u16) -> i32 {
    let magnitude = (wire & 0x7FFF) as i32;
    if wire & 0x8000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}
