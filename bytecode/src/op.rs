/// Bytecode opcodes.
///
/// Operands are a single byte or a 4-byte little-endian word, at fixed
/// per-opcode offsets; [`Op::length`] gives the full instruction size.
/// The sixteen builtin invoke groups (`InvokeEq` .. `InvokeBitShl`) carry
/// the same operands as their general counterparts and fall back to the
/// general dispatch path whenever the smi fast path does not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // Loads.
    LoadLocal0 = 0,
    LoadLocal1,
    LoadLocal2,
    /// Operands: `offset:u8`
    LoadLocal,
    /// Operands: `offset:i32`
    LoadLocalWide,
    /// Operands: `offset:u8`
    LoadBoxed,
    /// Operands: `index:i32`
    LoadStatic,
    /// Operands: `index:i32` — runs the initializer on first access.
    LoadStaticInit,
    /// Operands: `field:u8`
    LoadField,
    /// Operands: `field:i32`
    LoadFieldWide,
    /// Operands: `index:i32` — program constant table.
    LoadConst,
    /// Operands: `index:i32` — current function's literal pool.
    LoadConstUnfold,

    // Stores.
    /// Operands: `offset:u8`
    StoreLocal,
    /// Operands: `offset:u8`
    StoreBoxed,
    /// Operands: `index:i32`
    StoreStatic,
    /// Operands: `field:u8`
    StoreField,
    /// Operands: `field:i32`
    StoreFieldWide,

    // Literals.
    LoadLiteralNull,
    LoadLiteralTrue,
    LoadLiteralFalse,
    LoadLiteral0,
    LoadLiteral1,
    /// Operands: `value:u8`
    LoadLiteral,
    /// Operands: `value:i32`
    LoadLiteralWide,

    // Invocation.
    /// Operands: `selector:i32`
    InvokeMethod,
    /// Operands: `index:i32` — dispatch table.
    InvokeMethodFast,
    /// Operands: `selector:i32` — vtable offset in the id field.
    InvokeMethodVtable,
    /// Operands: `index:i32` — static method table.
    InvokeStatic,
    /// Operands: `index:i32` — current function's literal pool.
    InvokeStaticUnfold,
    /// Operands: `index:i32`
    InvokeFactory,
    /// Operands: `index:i32`
    InvokeFactoryUnfold,
    /// Operands: `arity:u8`, `native:u8`
    InvokeNative,
    /// Operands: `arity:u8`, `native:u8` — non-null result yields to a port.
    InvokeNativeYield,
    /// Operands: `unused:i32` — late-bound send; receiver and selector
    /// smi are on the stack. Padded to the common invoke length so the
    /// noSuchMethod machinery can decode the site from a return address.
    InvokeSelector,
    /// Operands: `selector:i32`
    InvokeTest,
    /// Operands: `index:i32`
    InvokeTestFast,
    /// Operands: `selector:i32`
    InvokeTestVtable,

    // Builtin invoke groups: same operands as the general forms.
    InvokeEq,
    InvokeEqFast,
    InvokeEqVtable,
    InvokeLt,
    InvokeLtFast,
    InvokeLtVtable,
    InvokeLe,
    InvokeLeFast,
    InvokeLeVtable,
    InvokeGt,
    InvokeGtFast,
    InvokeGtVtable,
    InvokeGe,
    InvokeGeFast,
    InvokeGeVtable,
    InvokeAdd,
    InvokeAddFast,
    InvokeAddVtable,
    InvokeSub,
    InvokeSubFast,
    InvokeSubVtable,
    InvokeMod,
    InvokeModFast,
    InvokeModVtable,
    InvokeMul,
    InvokeMulFast,
    InvokeMulVtable,
    InvokeTruncDiv,
    InvokeTruncDivFast,
    InvokeTruncDivVtable,
    InvokeBitNot,
    InvokeBitNotFast,
    InvokeBitNotVtable,
    InvokeBitAnd,
    InvokeBitAndFast,
    InvokeBitAndVtable,
    InvokeBitOr,
    InvokeBitOrFast,
    InvokeBitOrVtable,
    InvokeBitXor,
    InvokeBitXorFast,
    InvokeBitXorVtable,
    InvokeBitShr,
    InvokeBitShrFast,
    InvokeBitShrVtable,
    InvokeBitShl,
    InvokeBitShlFast,
    InvokeBitShlVtable,

    // Control.
    Pop,
    /// Operands: `locals:u8`, `arguments:u8`
    Return,
    /// Operands: `locals:i32`, `arguments:u8`
    ReturnWide,
    /// Operands: `delta:i32`
    BranchWide,
    /// Operands: `delta:i32`
    BranchIfTrueWide,
    /// Operands: `delta:i32`
    BranchIfFalseWide,
    /// Operands: `delta:u8` — backwards; performs a stack check.
    BranchBack,
    /// Operands: `delta:u8`
    BranchBackIfTrue,
    /// Operands: `delta:u8`
    BranchBackIfFalse,
    /// Operands: `delta:i32`
    BranchBackWide,
    /// Operands: `delta:i32`
    BranchBackIfTrueWide,
    /// Operands: `delta:i32`
    BranchBackIfFalseWide,
    /// Operands: `pop:u8`, `delta:i32`
    PopAndBranchWide,
    /// Operands: `pop:u8`, `delta:i32`
    PopAndBranchBackWide,

    // Allocation.
    /// Operands: `class:i32` — program class table index.
    Allocate,
    /// Operands: `index:i32` — class from the literal pool.
    AllocateUnfold,
    /// Operands: `class:i32` — immutable iff all field values are.
    AllocateImmutable,
    /// Operands: `index:i32`
    AllocateImmutableUnfold,
    AllocateBoxed,

    Negate,
    /// Operands: `size:i32` — room for `size` more slots.
    StackOverflowCheck,
    Throw,
    /// The smi on top of the stack encodes the interrupt kind.
    ProcessYield,
    CoroutineChange,
    Identical,
    IdenticalNonNumeric,

    /// Operands: `delta:u8` — distance to the noSuchMethod invocation.
    EnterNoSuchMethod,
    ExitNoSuchMethod,

    /// Operands: `delta:i32`, `return_delta:i32` — for finally blocks.
    SubroutineCall,
    SubroutineReturn,

    /// Operands: `size:u8` — frame-size marker for the stack walker.
    FrameSize,
    /// Terminates a function body; never interpreted.
    MethodEnd,
}

/// Which dispatch mechanism an invoke opcode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeForm {
    /// Primary lookup cache keyed on `(class, selector)`.
    Method,
    /// Range search over a dispatch-table segment.
    Fast,
    /// Offset-validated vtable entry.
    Vtable,
}

/// The builtin operation behind a monomorphized invoke group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Builtin {
    Eq = 0,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mod,
    Mul,
    TruncDiv,
    BitNot,
    BitAnd,
    BitOr,
    BitXor,
    BitShr,
    BitShl,
}

impl Builtin {
    pub const COUNT: usize = Self::BitShl as usize + 1;

    /// Source-level method name, used when interning builtin selectors.
    pub const fn name(self) -> &'static str {
        match self {
            Builtin::Eq => "==",
            Builtin::Lt => "<",
            Builtin::Le => "<=",
            Builtin::Gt => ">",
            Builtin::Ge => ">=",
            Builtin::Add => "+",
            Builtin::Sub => "-",
            Builtin::Mod => "%",
            Builtin::Mul => "*",
            Builtin::TruncDiv => "~/",
            Builtin::BitNot => "~",
            Builtin::BitAnd => "&",
            Builtin::BitOr => "|",
            Builtin::BitXor => "^",
            Builtin::BitShr => ">>",
            Builtin::BitShl => "<<",
        }
    }

    /// All builtins are binary except bit-not.
    pub const fn arity(self) -> u8 {
        match self {
            Builtin::BitNot => 0,
            _ => 1,
        }
    }
}

impl Op {
    pub const COUNT: usize = Op::MethodEnd as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub const unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!((byte as usize) < Self::COUNT, "invalid opcode");
        core::mem::transmute::<u8, Op>(byte)
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        if (byte as usize) < Self::COUNT {
            // SAFETY: bounds-checked.
            Some(unsafe { Self::from_u8_unchecked(byte) })
        } else {
            None
        }
    }

    /// Full instruction length in bytes, opcode included.
    pub const fn length(self) -> usize {
        use Op::*;
        match self {
            LoadLocal0 | LoadLocal1 | LoadLocal2 | LoadLiteralNull
            | LoadLiteralTrue | LoadLiteralFalse | LoadLiteral0
            | LoadLiteral1 | Pop | AllocateBoxed | Negate | Throw
            | ProcessYield | CoroutineChange | Identical
            | IdenticalNonNumeric | ExitNoSuchMethod | SubroutineReturn
            | MethodEnd => 1,

            LoadLocal | LoadBoxed | LoadField | StoreLocal | StoreBoxed
            | StoreField | LoadLiteral | BranchBack | BranchBackIfTrue
            | BranchBackIfFalse | EnterNoSuchMethod | FrameSize => 2,

            Return | InvokeNative | InvokeNativeYield => 3,

            LoadLocalWide | LoadStatic | LoadStaticInit | LoadFieldWide
            | LoadConst | LoadConstUnfold | StoreStatic | StoreFieldWide
            | LoadLiteralWide | InvokeStatic | InvokeStaticUnfold
            | InvokeFactory | InvokeFactoryUnfold | BranchWide
            | BranchIfTrueWide | BranchIfFalseWide | BranchBackWide
            | BranchBackIfTrueWide | BranchBackIfFalseWide | Allocate
            | AllocateUnfold | AllocateImmutable | AllocateImmutableUnfold
            | StackOverflowCheck => 5,

            InvokeMethod | InvokeMethodFast | InvokeMethodVtable
            | InvokeSelector | InvokeTest | InvokeTestFast
            | InvokeTestVtable => 5,

            ReturnWide | PopAndBranchWide | PopAndBranchBackWide => 6,

            SubroutineCall => 9,

            // Builtin invoke groups share the general operand layout.
            _ => 5,
        }
    }

    /// The dispatch form of a *method* invoke (test variants excluded).
    pub const fn invoke_form(self) -> Option<InvokeForm> {
        use Op::*;
        let raw = self as u8;
        if raw >= InvokeEq as u8 && raw <= InvokeBitShlVtable as u8 {
            return Some(match (raw - InvokeEq as u8) % 3 {
                0 => InvokeForm::Method,
                1 => InvokeForm::Fast,
                _ => InvokeForm::Vtable,
            });
        }
        match self {
            InvokeMethod => Some(InvokeForm::Method),
            InvokeMethodFast => Some(InvokeForm::Fast),
            InvokeMethodVtable => Some(InvokeForm::Vtable),
            _ => None,
        }
    }

    /// The builtin behind a monomorphized invoke group member.
    pub const fn builtin(self) -> Option<Builtin> {
        let raw = self as u8;
        if raw >= Op::InvokeEq as u8 && raw <= Op::InvokeBitShlVtable as u8 {
            let index = (raw - Op::InvokeEq as u8) / 3;
            // SAFETY: index < Builtin::COUNT by the range check above.
            Some(unsafe { core::mem::transmute::<u8, Builtin>(index) })
        } else {
            None
        }
    }

    /// The general-form opcode of a builtin group, for an `(op, form)` pair.
    pub const fn builtin_op(builtin: Builtin, form: InvokeForm) -> Op {
        let base = Op::InvokeEq as u8 + (builtin as u8) * 3;
        let raw = base
            + match form {
                InvokeForm::Method => 0,
                InvokeForm::Fast => 1,
                InvokeForm::Vtable => 2,
            };
        // SAFETY: stays inside the builtin block.
        unsafe { Op::from_u8_unchecked(raw) }
    }

    pub const fn is_invoke_normal(self) -> bool {
        matches!(self.invoke_form(), Some(InvokeForm::Method))
    }

    pub const fn is_invoke_fast(self) -> bool {
        matches!(self.invoke_form(), Some(InvokeForm::Fast))
    }

    pub const fn is_invoke_vtable(self) -> bool {
        matches!(self.invoke_form(), Some(InvokeForm::Vtable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for byte in 0..Op::COUNT as u8 {
            let op = Op::from_u8(byte).expect("valid opcode");
            assert_eq!(op as u8, byte);
            assert!(op.length() >= 1 && op.length() <= 9);
        }
        assert!(Op::from_u8(Op::COUNT as u8).is_none());
    }

    #[test]
    fn builtin_groups_decompose() {
        assert_eq!(Op::InvokeAdd.builtin(), Some(Builtin::Add));
        assert_eq!(Op::InvokeAdd.invoke_form(), Some(InvokeForm::Method));
        assert_eq!(Op::InvokeAddFast.invoke_form(), Some(InvokeForm::Fast));
        assert_eq!(Op::InvokeAddVtable.invoke_form(), Some(InvokeForm::Vtable));
        assert_eq!(Op::InvokeBitShlVtable.builtin(), Some(Builtin::BitShl));
        assert_eq!(Op::InvokeMethod.builtin(), None);

        for i in 0..Builtin::COUNT as u8 {
            // SAFETY: i < COUNT.
            let builtin = unsafe { core::mem::transmute::<u8, Builtin>(i) };
            for form in [InvokeForm::Method, InvokeForm::Fast, InvokeForm::Vtable] {
                let op = Op::builtin_op(builtin, form);
                assert_eq!(op.builtin(), Some(builtin));
                assert_eq!(op.invoke_form(), Some(form));
                assert_eq!(op.length(), 5);
            }
        }
    }

    #[test]
    fn invoke_predicates() {
        assert!(Op::InvokeMethod.is_invoke_normal());
        assert!(Op::InvokeMethodFast.is_invoke_fast());
        assert!(Op::InvokeMethodVtable.is_invoke_vtable());
        assert!(Op::InvokeEqFast.is_invoke_fast());
        assert!(!Op::InvokeStatic.is_invoke_normal());
    }
}
