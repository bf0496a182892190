//! Core runtime of the mica scripting language.
//!
//! Two subsystems make up this crate: the register-based bytecode code
//! generator (driven by an external parser through [`codegen::Compiler`])
//! and the incremental tri-color garbage collector ([`heap::Heap`]) that
//! owns every object the compiler, interpreter and host share.
//!
//! The lexer/parser, the interpreter dispatch loop, the embedding surface
//! and the standard library are external collaborators: this crate defines
//! the contracts they consume.

#![deny(unsafe_code)]
#![deny(unused_must_use)]
#![warn(missing_docs)]

pub mod codegen;
pub mod error;
pub mod heap;
pub mod object;
pub mod value;

pub use codegen::{verify_proto, BinOp, Compiler, ExpDesc, ExpKind, UnOp, MULTRET, NO_JUMP};
pub use error::{CompileError, VmError};
pub use heap::{GcParams, GcState, Heap};
pub use object::{GcRef, Proto, StrKind, Table, TableKey, Upvalue};
pub use value::{NativeFn, TypeTag, Value};

#[doc(no_inline)]
pub use mica_asm;
