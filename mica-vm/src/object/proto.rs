//! Function prototypes and their debug descriptors.

use mica_asm::Instruction;

use super::GcRef;
use crate::value::Value;

/// Compile-time description of one upvalue of a prototype.
#[derive(Debug, Clone)]
pub struct UpvalDesc {
    /// Variable name, for debug information.
    pub name: Option<GcRef>,
    /// Whether the upvalue captures a register of the enclosing function
    /// (true) or an upvalue of it (false).
    pub in_stack: bool,
    /// Register or enclosing-upvalue index being captured.
    pub index: u32,
}

/// Activity window of a named local, for debug information.
#[derive(Debug, Clone)]
pub struct LocalVar {
    /// Variable name.
    pub name: GcRef,
    /// First instruction where the variable is live.
    pub start_pc: u32,
    /// First instruction where the variable is dead.
    pub end_pc: u32,
}

/// A compiled function prototype.
///
/// Owns the code vector, its parallel line-info vector, the constant pool
/// and the nested prototypes. Produced by the code generator, consumed by
/// the interpreter and dumpers.
#[derive(Debug, Clone, Default)]
pub struct Proto {
    /// The instructions.
    pub code: Vec<Instruction>,
    /// Source line of each instruction.
    pub lines: Vec<u32>,
    /// The constant pool.
    pub constants: Vec<Value>,
    /// Nested child prototypes.
    pub protos: Vec<GcRef>,
    /// Upvalue descriptors.
    pub upvalues: Vec<UpvalDesc>,
    /// Local-variable descriptors.
    pub locals: Vec<LocalVar>,
    /// Number of fixed parameters.
    pub num_params: u8,
    /// Whether the function accepts varargs.
    pub is_vararg: bool,
    /// High-water mark of the register frame; at most 255.
    pub max_stack_size: u8,
    /// Chunk name.
    pub source: Option<GcRef>,
    /// Line of the `function` keyword, 0 for main chunks.
    pub line_defined: u32,
    /// Line of the matching `end`.
    pub last_line_defined: u32,
}

impl Proto {
    /// Hard limit on the register frame.
    pub const MAX_REGISTERS: u32 = 255;

    /// Hard limit on the constant pool, from the 26-bit EXTRAARG field.
    pub const MAX_CONSTANTS: usize = 1 << 26;
}
