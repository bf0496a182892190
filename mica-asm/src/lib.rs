//! Instruction set of the mica virtual machine.
//!
//! Every mica instruction is a single 32-bit word with the 6-bit opcode in
//! the low bits. Four operand layouts share the remaining 26 bits; see
//! [`Instruction`] for the exact field positions and [`OpCode`] for the
//! per-opcode layout table.

#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![warn(missing_docs)]

mod fb;
mod instruction;
mod opcode;
mod rk;

#[cfg(test)]
mod encoding_tests;

pub use fb::{fb_to_int, int_to_fb};
pub use instruction::{
    Instruction, RawInstruction, MAX_A, MAX_AX, MAX_B, MAX_BX, MAX_C, MAX_SBX, NO_REG,
};
pub use opcode::{ArgKind, InvalidOpcode, OpCode, OpMeta, OpMode};
pub use rk::{constant_index, from_constant, is_constant, BIT_RK, MAX_INDEX_RK};

/// Number of list elements a single SETLIST instruction flushes.
pub const FIELDS_PER_FLUSH: u32 = 50;
