//! Runtime and compile-time error variants.

use thiserror::Error;

/// Fatal compile-time errors raised by the code generator.
///
/// These are structured so the embedder can surface them with source
/// positions; the generator never panics on malformed-but-parseable input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A jump offset no longer fits the signed 18-bit `sBx` field.
    #[error("control structure too long (line {line})")]
    JumpTooLong {
        /// Source line of the offending construct.
        line: u32,
    },
    /// The register frame would grow past the 8-bit addressable window.
    #[error("function or expression needs too many registers (line {line})")]
    TooManyRegisters {
        /// Source line of the offending expression.
        line: u32,
    },
    /// A table constructor flushes more blocks than SETLIST can encode.
    #[error("constructor too long (line {line})")]
    ConstructorTooLong {
        /// Source line of the constructor.
        line: u32,
    },
    /// A per-function resource (constants, upvalues, nested prototypes)
    /// overflowed its encoding limit.
    #[error("too many {what} (limit is {limit}) at line {line}")]
    LimitExceeded {
        /// Which resource ran out.
        what: &'static str,
        /// The hard limit imposed by the instruction encoding.
        limit: usize,
        /// Source line where the limit was crossed.
        line: u32,
    },
    /// A finished prototype failed bytecode verification.
    #[error("invalid bytecode at pc {pc}: {reason}")]
    InvalidBytecode {
        /// Index of the offending instruction.
        pc: usize,
        /// What the verifier objected to.
        reason: &'static str,
    },
}

impl CompileError {
    /// Source line the error points at, when it carries one.
    pub const fn line(&self) -> Option<u32> {
        match self {
            Self::JumpTooLong { line }
            | Self::TooManyRegisters { line }
            | Self::ConstructorTooLong { line }
            | Self::LimitExceeded { line, .. } => Some(*line),
            Self::InvalidBytecode { .. } => None,
        }
    }
}

/// Errors surfaced by the runtime half: allocation pressure, finalizers and
/// host-raised failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    /// Allocation pushed the heap past its configured limit and an emergency
    /// collection could not recover. The display text mirrors the always-live
    /// message object kept in the permanent list.
    #[error("not enough memory")]
    OutOfMemory,
    /// A user `__gc` metamethod failed; the original error is wrapped and
    /// rethrown, never swallowed.
    #[error("error in __gc metamethod ({0})")]
    GcMetamethod(String),
    /// Host-raised runtime error, unwound to the nearest protected boundary.
    #[error("{0}")]
    Runtime(String),
    /// A code-generation failure crossing the runtime boundary.
    #[error(transparent)]
    Compile(#[from] CompileError),
}
