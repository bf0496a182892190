//! The R/K operand encoding shared by the 9-bit `B` and `C` fields.
//!
//! The high bit of the field selects between a register index (clear) and a
//! constant-pool index (set). Constant indices referenced this way must
//! therefore fit in 8 bits.

/// Flag bit marking an R/K operand as a constant-pool index.
pub const BIT_RK: u32 = 1 << 8;

/// Largest constant-pool index that still fits in an R/K operand.
pub const MAX_INDEX_RK: u32 = BIT_RK - 1;

/// Whether an R/K operand refers to the constant pool.
pub const fn is_constant(rk: u32) -> bool {
    rk & BIT_RK != 0
}

/// The constant-pool index of a constant R/K operand.
pub const fn constant_index(rk: u32) -> u32 {
    rk & !BIT_RK
}

/// Encode a constant-pool index as an R/K operand.
pub const fn from_constant(index: u32) -> u32 {
    index | BIT_RK
}
