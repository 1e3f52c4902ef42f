//! Instruction Set
//!
//! A stack machine. Each opcode is one byte followed by its operands,
//! described by a format string:
//!
//! - `b`: 32-bit branch offset, relative to the pc after the operand
//! - `c`: 8-bit signed int
//! - `g`: 8-bit conversion op
//! - `h`: 16-bit signed int
//! - `i`: 32-bit signed int
//! - `o`: 16-bit tuple slot offset
//! - `p`: 32-bit native-function index
//! - `s`: 32-bit string-pool index
//! - `t`: 32-bit type-pool index
//! - `v`: 16-bit variable reference (negative for parameters)
//! - `V`: 32-bit literal-pool index
//!
//! Every opcode declares a stack delta used for code-generation
//! verification; ops whose consumption depends on runtime data (calls,
//! conversions, aggregate creation, emit) adjust the stack explicitly and
//! declare zero.

use num_enum::TryFromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    VerifySp,

    // Loads. The "u" variants uniq the loaded value and write it back to
    // its slot, so in-place container stores see exclusive ownership.
    LoadV,
    LoadVu,
    FloadV,
    FloadVu,
    Xload8,
    XloadR,
    XloadV,
    XloadVu,
    MindexV,
    MindexVu,
    Sload8,
    SloadR,
    SloadV,

    // Stores.
    StoreV,
    Undefine,
    FstoreV,
    FclearB,
    FsetB,
    FtestB,
    Xstore8,
    XstoreR,
    XstoreV,
    MinsertV,
    MstoreV,
    SstoreV,

    // Indexed increments.
    Inc64,
    Finc64,
    Xinc64,
    Minc64,

    // Stack.
    Push8,
    PushV,
    DupV,
    PopV,

    // Aggregate creation.
    NewB,
    NewStr,
    NewA,
    NewM,
    CreateA,
    CreateT,
    CreateM,
    CreateC,

    // Arithmetic, logic.
    AndBool,
    OrBool,
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    AddUint,
    SubUint,
    MulUint,
    DivUint,
    ModUint,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    AddFpr,
    AddArray,
    AddBytes,
    AddString,
    AddTime,
    SubTime,
    ShlInt,
    ShrInt,
    AndInt,
    OrInt,
    XorInt,
    ShlUint,
    ShrUint,
    AndUint,
    OrUint,
    XorUint,

    // Condition code.
    SetCc,
    GetCc,

    // Comparisons; all write the condition code.
    EqlBits,
    NeqBits,
    LssBits,
    LeqBits,
    GtrBits,
    GeqBits,
    EqlFloat,
    NeqFloat,
    LssFloat,
    LeqFloat,
    GtrFloat,
    GeqFloat,
    LssInt,
    LeqInt,
    GtrInt,
    GeqInt,
    EqlString,
    NeqString,
    LssString,
    LeqString,
    GtrString,
    GeqString,
    EqlBytes,
    NeqBytes,
    LssBytes,
    LeqBytes,
    GtrBytes,
    GeqBytes,
    EqlArray,
    NeqArray,
    EqlMap,
    NeqMap,
    EqlTuple,
    NeqTuple,
    EqlClosure,
    NeqClosure,

    // Conversions.
    Basicconv,
    Arrayconv,
    Mapconv,

    // Control.
    Branch,
    BranchTrue,
    BranchFalse,
    TrapFalse,
    Enter,
    SetBp,
    Callc,
    Callcnf,
    Call,
    Calli,
    Ret,
    RetV,
    RetU,
    Terminate,
    Stop,
    Emit,

    // Must stay last.
    Illegal,
}

pub struct InstrInfo {
    pub op: Opcode,
    pub name: &'static str,
    pub fmt: &'static str,
    /// >= 0 for loads/pushes, < 0 for stores/pops. Ops marked (x) adjust
    /// the stack explicitly at run time and declare zero here.
    pub stack_delta: i32,
}

macro_rules! instr {
    ($op:ident, $fmt:expr, $delta:expr) => {
        InstrInfo {
            op: Opcode::$op,
            name: stringify!($op),
            fmt: $fmt,
            stack_delta: $delta,
        }
    };
}

pub static INSTR_TABLE: &[InstrInfo] = &[
    instr!(Nop, "", 0),
    instr!(VerifySp, "i", 0),
    instr!(LoadV, "v", 1),
    instr!(LoadVu, "v", 1),
    instr!(FloadV, "o", 0),
    instr!(FloadVu, "o", 0),
    instr!(Xload8, "", -1),
    instr!(XloadR, "", -1),
    instr!(XloadV, "", -1),
    instr!(XloadVu, "", -1),
    instr!(MindexV, "", -1),
    instr!(MindexVu, "", -1),
    instr!(Sload8, "", -2),
    instr!(SloadR, "", -2),
    instr!(SloadV, "", -2),
    instr!(StoreV, "v", -1),
    instr!(Undefine, "v", 0),
    instr!(FstoreV, "o", -2),
    instr!(FclearB, "i", -1),
    instr!(FsetB, "i", 0),
    instr!(FtestB, "i", 0),
    instr!(Xstore8, "", -3),
    instr!(XstoreR, "", -3),
    instr!(XstoreV, "", -3),
    instr!(MinsertV, "", 0),
    instr!(MstoreV, "", -3),
    instr!(SstoreV, "", -4),
    instr!(Inc64, "vc", 0),
    instr!(Finc64, "oc", -1),
    instr!(Xinc64, "c", -2),
    instr!(Minc64, "c", -2),
    instr!(Push8, "c", 1),
    instr!(PushV, "V", 1),
    instr!(DupV, "", 1),
    instr!(PopV, "", -1),
    instr!(NewB, "", -1),
    instr!(NewStr, "", -1),
    instr!(NewA, "t", -1),
    instr!(NewM, "t", 0),
    instr!(CreateA, "it", 0), // (x)
    instr!(CreateT, "t", 0),  // (x)
    instr!(CreateM, "it", 0), // (x)
    instr!(CreateC, "bct", 1),
    instr!(AndBool, "", -1),
    instr!(OrBool, "", -1),
    instr!(AddInt, "", -1),
    instr!(SubInt, "", -1),
    instr!(MulInt, "", -1),
    instr!(DivInt, "", -1),
    instr!(ModInt, "", -1),
    instr!(AddUint, "", -1),
    instr!(SubUint, "", -1),
    instr!(MulUint, "", -1),
    instr!(DivUint, "", -1),
    instr!(ModUint, "", -1),
    instr!(AddFloat, "", -1),
    instr!(SubFloat, "", -1),
    instr!(MulFloat, "", -1),
    instr!(DivFloat, "", -1),
    instr!(AddFpr, "", -1),
    instr!(AddArray, "", -1),
    instr!(AddBytes, "", -1),
    instr!(AddString, "", -1),
    instr!(AddTime, "", -1),
    instr!(SubTime, "", -1),
    instr!(ShlInt, "", -1),
    instr!(ShrInt, "", -1),
    instr!(AndInt, "", -1),
    instr!(OrInt, "", -1),
    instr!(XorInt, "", -1),
    instr!(ShlUint, "", -1),
    instr!(ShrUint, "", -1),
    instr!(AndUint, "", -1),
    instr!(OrUint, "", -1),
    instr!(XorUint, "", -1),
    instr!(SetCc, "", -1),
    instr!(GetCc, "", 1),
    instr!(EqlBits, "", -2),
    instr!(NeqBits, "", -2),
    instr!(LssBits, "", -2),
    instr!(LeqBits, "", -2),
    instr!(GtrBits, "", -2),
    instr!(GeqBits, "", -2),
    instr!(EqlFloat, "", -2),
    instr!(NeqFloat, "", -2),
    instr!(LssFloat, "", -2),
    instr!(LeqFloat, "", -2),
    instr!(GtrFloat, "", -2),
    instr!(GeqFloat, "", -2),
    instr!(LssInt, "", -2),
    instr!(LeqInt, "", -2),
    instr!(GtrInt, "", -2),
    instr!(GeqInt, "", -2),
    instr!(EqlString, "", -2),
    instr!(NeqString, "", -2),
    instr!(LssString, "", -2),
    instr!(LeqString, "", -2),
    instr!(GtrString, "", -2),
    instr!(GeqString, "", -2),
    instr!(EqlBytes, "", -2),
    instr!(NeqBytes, "", -2),
    instr!(LssBytes, "", -2),
    instr!(LeqBytes, "", -2),
    instr!(GtrBytes, "", -2),
    instr!(GeqBytes, "", -2),
    instr!(EqlArray, "", -2),
    instr!(NeqArray, "", -2),
    instr!(EqlMap, "", -2),
    instr!(NeqMap, "", -2),
    instr!(EqlTuple, "", -2),
    instr!(NeqTuple, "", -2),
    instr!(EqlClosure, "", -2),
    instr!(NeqClosure, "", -2),
    instr!(Basicconv, "gt", 0), // (x)
    instr!(Arrayconv, "gt", 0), // (x)
    instr!(Mapconv, "tgg", 0),  // (x)
    instr!(Branch, "b", 0),
    instr!(BranchTrue, "b", 0),
    instr!(BranchFalse, "b", 0),
    instr!(TrapFalse, "s", 0),
    instr!(Enter, "ii", 0),
    instr!(SetBp, "c", 0),
    instr!(Callc, "p", 0),   // (x)
    instr!(Callcnf, "p", 0), // (x)
    instr!(Call, "", -1),
    instr!(Calli, "b", 0),
    instr!(Ret, "h", 0),
    instr!(RetV, "h", -1),
    instr!(RetU, "h", 1),
    instr!(Terminate, "", 0),
    instr!(Stop, "s", 0),
    instr!(Emit, "h", 0), // (x)
    instr!(Illegal, "", 0),
];

impl Opcode {
    #[inline]
    pub fn info(self) -> &'static InstrInfo {
        &INSTR_TABLE[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn fmt(self) -> &'static str {
        self.info().fmt
    }

    pub fn stack_delta(self) -> i32 {
        self.info().stack_delta
    }
}

/// Does this opcode write the condition code?
pub fn sets_cc(op: Opcode) -> bool {
    op == Opcode::SetCc || (Opcode::EqlBits <= op && op <= Opcode::NeqClosure)
}

/// Does this opcode consume the condition code?
pub fn uses_cc(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::GetCc | Opcode::BranchTrue | Opcode::BranchFalse | Opcode::TrapFalse
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_enum_order() {
        for (i, info) in INSTR_TABLE.iter().enumerate() {
            assert_eq!(
                info.op as usize, i,
                "instruction table out of order at {} ({})",
                i, info.name
            );
        }
        assert_eq!(
            INSTR_TABLE.last().unwrap().op,
            Opcode::Illegal,
            "Illegal must stay last"
        );
    }

    #[test]
    fn test_try_from_primitive() {
        assert_eq!(Opcode::try_from(0u8).unwrap(), Opcode::Nop);
        assert!(Opcode::try_from(Opcode::Illegal as u8 + 1).is_err());
    }

    #[test]
    fn test_cc_predicates() {
        assert!(sets_cc(Opcode::EqlBits));
        assert!(sets_cc(Opcode::NeqClosure));
        assert!(sets_cc(Opcode::SetCc));
        assert!(!sets_cc(Opcode::AddInt));
        assert!(uses_cc(Opcode::BranchTrue));
        assert!(uses_cc(Opcode::TrapFalse));
        assert!(!uses_cc(Opcode::Branch));
    }

    #[test]
    fn test_stack_deltas() {
        assert_eq!(Opcode::Push8.stack_delta(), 1);
        assert_eq!(Opcode::PopV.stack_delta(), -1);
        assert_eq!(Opcode::EqlBits.stack_delta(), -2);
        assert_eq!(Opcode::SstoreV.stack_delta(), -4);
    }
}
