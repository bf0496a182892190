//! Closures and the upvalues they capture.

use super::GcRef;
use crate::value::Value;

/// A captured variable.
///
/// Open upvalues alias a live stack slot of their owning thread; closing
/// copies the slot's value into the upvalue itself. The `touched` flag marks
/// open upvalues written during a mark phase so the atomic phase can re-mark
/// their values without traversing every suspended thread.
#[derive(Debug, Clone)]
pub enum Upvalue {
    /// Still aliasing a stack slot of a live frame.
    Open {
        /// The owning thread.
        thread: GcRef,
        /// Index of the aliased stack slot.
        index: usize,
        /// Written during a mark phase; re-marked in the atomic phase.
        touched: bool,
    },
    /// Owns its value.
    Closed(Value),
}

/// A closure: a prototype plus its captured upvalues.
#[derive(Debug, Clone)]
pub struct Closure {
    /// The compiled prototype.
    pub proto: GcRef,
    /// Captured upvalue objects, one per prototype descriptor.
    pub upvalues: Vec<GcRef>,
}
