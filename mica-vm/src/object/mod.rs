//! The collectable object model: headers, colors and the arena handle.
//!
//! Every heap object lives in the heap arena and is addressed by a [`GcRef`].
//! The header carries the intrusive `next` link routing the object through
//! exactly one of the global lists (`allgc`, `finobj`, `tobefnz`, `fixedgc`)
//! and the mark byte interpreted by the tri-color collector.

mod closure;
mod proto;
mod string;
mod table;
mod thread;

pub use closure::{Closure, Upvalue};
pub use proto::{LocalVar, Proto, UpvalDesc};
pub(crate) use string::StringTable;
pub use string::{Str, StrKind, SHORT_STR_LIMIT};
pub use table::{Table, TableKey};
pub use thread::Thread;

use crate::value::Value;

/// Handle to a heap object: an index into the heap arena.
///
/// Handles are only meaningful against the heap that issued them and stay
/// valid until the object is swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display(fmt = "obj#{}", _0)]
pub struct GcRef(pub(crate) u32);

impl GcRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags::bitflags! {
    /// The mark byte. The two whites alternate each cycle so survivors do
    /// not need re-marking; gray is the absence of any color bit.
    pub struct Marks: u8 {
        /// White of even cycles.
        const WHITE0 = 1 << 0;
        /// White of odd cycles.
        const WHITE1 = 1 << 1;
        /// Reached and fully scanned.
        const BLACK = 1 << 2;
        /// Finalizer has been scheduled for this object.
        const FINALIZED = 1 << 3;
    }
}

impl Marks {
    /// Both white bits.
    pub const WHITES: Marks = Marks::from_bits_truncate(0b11);
}

/// Per-object header: intrusive list link plus mark byte.
#[derive(Debug, Clone)]
pub struct Header {
    pub(crate) next: Option<GcRef>,
    pub(crate) marks: Marks,
}

impl Header {
    pub(crate) fn new(white: Marks) -> Self {
        Self {
            next: None,
            marks: white,
        }
    }

    /// Not yet reached this cycle (either white variant).
    pub fn is_white(&self) -> bool {
        self.marks.intersects(Marks::WHITES)
    }

    /// Reached and fully scanned.
    pub fn is_black(&self) -> bool {
        self.marks.contains(Marks::BLACK)
    }

    /// Reached but not yet scanned: neither white nor black.
    pub fn is_gray(&self) -> bool {
        !self.marks.intersects(Marks::WHITES | Marks::BLACK)
    }

    /// Dead at sweep time: bears the white of the previous cycle.
    pub(crate) fn is_dead(&self, other_white: Marks) -> bool {
        self.marks.intersects(other_white)
    }

    /// Clear the white bits, leaving the object gray.
    pub(crate) fn white_to_gray(&mut self) {
        self.marks.remove(Marks::WHITES);
    }

    /// Promote a gray object to black.
    pub(crate) fn gray_to_black(&mut self) {
        self.marks.insert(Marks::BLACK);
    }

    /// Demote a black object to gray (backward barrier).
    pub(crate) fn black_to_gray(&mut self) {
        self.marks.remove(Marks::BLACK);
    }

    /// Recolor to the given current white, dropping black.
    pub(crate) fn make_white(&mut self, white: Marks) {
        self.marks.remove(Marks::WHITES | Marks::BLACK);
        self.marks.insert(white);
    }
}

/// Discriminant of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Interned short or heap long string.
    Str,
    /// Hybrid array/hash table.
    Table,
    /// Function prototype.
    Proto,
    /// Closure over a prototype.
    Closure,
    /// Open or closed captured variable.
    Upvalue,
    /// Full userdata.
    Userdata,
    /// Cooperative thread.
    Thread,
}

impl core::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Str => "string",
            Self::Table => "table",
            Self::Proto => "prototype",
            Self::Closure => "closure",
            Self::Upvalue => "upvalue",
            Self::Userdata => "userdata",
            Self::Thread => "thread",
        };
        f.write_str(name)
    }
}

/// Full userdata: a host value slot with an optional metatable.
#[derive(Debug, Clone, Default)]
pub struct Userdata {
    /// The associated user value.
    pub user_value: Value,
    /// Optional metatable.
    pub metatable: Option<GcRef>,
}

/// A heap object body; the header lives alongside it in the arena slot.
#[derive(Debug, Clone)]
pub enum Object {
    /// String payload.
    Str(Str),
    /// Table payload.
    Table(Table),
    /// Prototype payload.
    Proto(Proto),
    /// Closure payload.
    Closure(Closure),
    /// Upvalue payload.
    Upvalue(Upvalue),
    /// Userdata payload.
    Userdata(Userdata),
    /// Thread payload.
    Thread(Thread),
}

impl Object {
    /// Discriminant of this object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Str(_) => ObjectKind::Str,
            Self::Table(_) => ObjectKind::Table,
            Self::Proto(_) => ObjectKind::Proto,
            Self::Closure(_) => ObjectKind::Closure,
            Self::Upvalue(_) => ObjectKind::Upvalue,
            Self::Userdata(_) => ObjectKind::Userdata,
            Self::Thread(_) => ObjectKind::Thread,
        }
    }
}

/// One arena slot: header plus body.
#[derive(Debug, Clone)]
pub struct GcBox {
    pub(crate) header: Header,
    pub(crate) body: Object,
}
