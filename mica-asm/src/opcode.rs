//! Operation codes and the per-opcode layout table.

use core::fmt;

/// Operation codes of the mica instruction set, numbered as dumped chunks
/// store them.
///
/// The set is fixed: prototypes are dumpable, so renumbering an opcode is a
/// wire-format break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::EnumCount, strum::EnumIter, strum::FromRepr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum OpCode {
    /// `R(A) := R(B)`
    MOVE = 0x00,
    /// `R(A) := K(Bx)`
    LOADK = 0x01,
    /// `R(A) := K(extra arg)`; the next instruction is always EXTRAARG
    LOADKX = 0x02,
    /// `R(A) := (bool)B; if (C) pc++`
    LOADBOOL = 0x03,
    /// `R(A), R(A+1), ..., R(A+B) := nil`
    LOADNIL = 0x04,
    /// `R(A) := U(B)`
    GETUPVAL = 0x05,
    /// `R(A) := U(B)[RK(C)]`
    GETTABUP = 0x06,
    /// `R(A) := R(B)[RK(C)]`
    GETTABLE = 0x07,
    /// `U(A)[RK(B)] := RK(C)`
    SETTABUP = 0x08,
    /// `U(B) := R(A)`
    SETUPVAL = 0x09,
    /// `R(A)[RK(B)] := RK(C)`
    SETTABLE = 0x0a,
    /// `R(A) := {}` with B/C as byte-float size hints
    NEWTABLE = 0x0b,
    /// `R(A+1) := R(B); R(A) := R(B)[RK(C)]` (method-call prep)
    SELF = 0x0c,
    /// `R(A) := RK(B) + RK(C)`
    ADD = 0x0d,
    /// `R(A) := RK(B) - RK(C)`
    SUB = 0x0e,
    /// `R(A) := RK(B) * RK(C)`
    MUL = 0x0f,
    /// `R(A) := RK(B) % RK(C)`
    MOD = 0x10,
    /// `R(A) := RK(B) ^ RK(C)`
    POW = 0x11,
    /// `R(A) := RK(B) / RK(C)`
    DIV = 0x12,
    /// `R(A) := RK(B) // RK(C)`
    IDIV = 0x13,
    /// `R(A) := RK(B) & RK(C)`
    BAND = 0x14,
    /// `R(A) := RK(B) | RK(C)`
    BOR = 0x15,
    /// `R(A) := RK(B) ~ RK(C)`
    BXOR = 0x16,
    /// `R(A) := RK(B) << RK(C)`
    SHL = 0x17,
    /// `R(A) := RK(B) >> RK(C)`
    SHR = 0x18,
    /// `R(A) := -R(B)`
    UNM = 0x19,
    /// `R(A) := ~R(B)`
    BNOT = 0x1a,
    /// `R(A) := not R(B)`
    NOT = 0x1b,
    /// `R(A) := length of R(B)`
    LEN = 0x1c,
    /// `R(A) := R(B).. ... ..R(C)` (right-associative chains coalesce)
    CONCAT = 0x1d,
    /// `pc += sBx`; if A > 0, close upvalues down to register A-1
    JMP = 0x1e,
    /// `if ((RK(B) == RK(C)) != A) pc++`
    EQ = 0x1f,
    /// `if ((RK(B) < RK(C)) != A) pc++`
    LT = 0x20,
    /// `if ((RK(B) <= RK(C)) != A) pc++`
    LE = 0x21,
    /// `if (bool(R(A)) != C) pc++`
    TEST = 0x22,
    /// `if (bool(R(B)) == C) R(A) := R(B) else pc++`
    TESTSET = 0x23,
    /// `R(A), ..., R(A+C-2) := R(A)(R(A+1), ..., R(A+B-1))`
    CALL = 0x24,
    /// `return R(A)(R(A+1), ..., R(A+B-1))`
    TAILCALL = 0x25,
    /// `return R(A), ..., R(A+B-2)`
    RETURN = 0x26,
    /// numeric for loop tail: step, test, jump back
    FORLOOP = 0x27,
    /// numeric for loop head: prepare and jump to FORLOOP
    FORPREP = 0x28,
    /// generic for: call the iterator, expecting C results
    TFORCALL = 0x29,
    /// generic for loop tail
    TFORLOOP = 0x2a,
    /// `R(A)[(C-1)*FPF + i] := R(A+i), 1 <= i <= B`
    SETLIST = 0x2b,
    /// `R(A) := closure(proto[Bx])`
    CLOSURE = 0x2c,
    /// `R(A), R(A+1), ..., R(A+B-2) := vararg`
    VARARG = 0x2d,
    /// extra (larger) argument for the previous instruction
    EXTRAARG = 0x2e,
}

/// Operand layout of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpMode {
    /// `A` 8 bits, `B` 9 bits, `C` 9 bits
    Abc,
    /// `A` 8 bits, `Bx` 18 bits unsigned
    ABx,
    /// `A` 8 bits, `sBx` 18 bits biased signed
    AsBx,
    /// `Ax` 26 bits
    Ax,
}

/// How an instruction uses its `B` or `C` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Field is not used.
    Unused,
    /// Field is an opaque argument (count, flag, size hint).
    Any,
    /// Field is a register index or a jump offset.
    Register,
    /// Field is an R/K operand: register, or constant index with the high
    /// bit set.
    RegOrConst,
}

/// Static description of one opcode: layout, test behavior and field usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpMeta {
    /// Operand layout.
    pub mode: OpMode,
    /// Usage of the `B` field (meaningless outside ABC).
    pub b: ArgKind,
    /// Usage of the `C` field (meaningless outside ABC).
    pub c: ArgKind,
    /// Instruction writes register `A`.
    pub sets_a: bool,
    /// Instruction is a test: the next instruction must be a JMP.
    pub is_test: bool,
}

const fn meta(mode: OpMode, b: ArgKind, c: ArgKind, sets_a: bool, is_test: bool) -> OpMeta {
    OpMeta {
        mode,
        b,
        c,
        sets_a,
        is_test,
    }
}

impl OpCode {
    /// Number of distinct opcodes.
    pub const COUNT: usize = <Self as strum::EnumCount>::COUNT;

    /// Static layout and field-usage description of this opcode.
    pub const fn meta(self) -> OpMeta {
        use ArgKind::{Any, RegOrConst, Register, Unused};
        use OpMode::{ABx, Abc, AsBx, Ax};

        match self {
            Self::MOVE => meta(Abc, Register, Unused, true, false),
            Self::LOADK => meta(ABx, RegOrConst, Unused, true, false),
            Self::LOADKX => meta(ABx, Unused, Unused, true, false),
            Self::LOADBOOL => meta(Abc, Any, Any, true, false),
            Self::LOADNIL => meta(Abc, Any, Unused, true, false),
            Self::GETUPVAL => meta(Abc, Any, Unused, true, false),
            Self::GETTABUP => meta(Abc, Any, RegOrConst, true, false),
            Self::GETTABLE => meta(Abc, Register, RegOrConst, true, false),
            Self::SETTABUP => meta(Abc, RegOrConst, RegOrConst, false, false),
            Self::SETUPVAL => meta(Abc, Any, Unused, false, false),
            Self::SETTABLE => meta(Abc, RegOrConst, RegOrConst, false, false),
            Self::NEWTABLE => meta(Abc, Any, Any, true, false),
            Self::SELF => meta(Abc, Register, RegOrConst, true, false),
            Self::ADD
            | Self::SUB
            | Self::MUL
            | Self::MOD
            | Self::POW
            | Self::DIV
            | Self::IDIV
            | Self::BAND
            | Self::BOR
            | Self::BXOR
            | Self::SHL
            | Self::SHR => meta(Abc, RegOrConst, RegOrConst, true, false),
            Self::UNM | Self::BNOT | Self::NOT | Self::LEN => {
                meta(Abc, Register, Unused, true, false)
            }
            Self::CONCAT => meta(Abc, Register, Register, true, false),
            Self::JMP => meta(AsBx, Register, Unused, false, false),
            Self::EQ | Self::LT | Self::LE => meta(Abc, RegOrConst, RegOrConst, false, true),
            Self::TEST => meta(Abc, Unused, Any, false, true),
            Self::TESTSET => meta(Abc, Register, Any, true, true),
            Self::CALL => meta(Abc, Any, Any, true, false),
            Self::TAILCALL => meta(Abc, Any, Any, true, false),
            Self::RETURN => meta(Abc, Any, Unused, false, false),
            Self::FORLOOP => meta(AsBx, Register, Unused, true, false),
            Self::FORPREP => meta(AsBx, Register, Unused, true, false),
            Self::TFORCALL => meta(Abc, Unused, Any, false, false),
            Self::TFORLOOP => meta(AsBx, Register, Unused, true, false),
            Self::SETLIST => meta(Abc, Any, Any, false, false),
            Self::CLOSURE => meta(ABx, Any, Unused, true, false),
            Self::VARARG => meta(Abc, Any, Unused, true, false),
            Self::EXTRAARG => meta(Ax, Any, Any, false, false),
        }
    }

    /// Operand layout of this opcode.
    pub const fn mode(self) -> OpMode {
        self.meta().mode
    }

    /// Whether this opcode is a test whose following instruction must be a
    /// JMP.
    pub const fn is_test(self) -> bool {
        self.meta().is_test
    }

    /// Whether this opcode writes register `A`.
    pub const fn sets_a(self) -> bool {
        self.meta().sets_a
    }
}

static_assertions::const_assert!(OpCode::COUNT <= 1 << 6);

/// A byte that does not name any opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcode(pub u8);

impl fmt::Display for InvalidOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid opcode byte {:#04x}", self.0)
    }
}

impl std::error::Error for InvalidOpcode {}

impl TryFrom<u8> for OpCode {
    type Error = InvalidOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcode(byte))
    }
}
