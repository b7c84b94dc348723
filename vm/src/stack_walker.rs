use bytecode::{read_i32, Op};
use object::{Array, Class, Function, Selector, Stack, Value};

use crate::program::Program;

/// Where a thrown exception lands.
#[derive(Debug, Clone, Copy)]
pub struct CatchTarget {
    /// Bytecode pointer of the handler.
    pub handler_bcp: *const u8,
    /// Absolute stack index that receives the exception; becomes the new
    /// top of stack.
    pub exception_slot: usize,
}

/// One walked frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub function: Value,
    /// Bytecode pointer saved in this frame (the current instruction for
    /// the topmost frame, the return address for callers).
    pub bcp: *const u8,
    /// Slots pushed above this frame's return address.
    pub frame_size: usize,
    /// Absolute index of the slot holding `bcp`.
    pub bcp_slot: usize,
}

/// Walks the frames of an execution stack whose topmost slot holds the
/// saved bytecode pointer (the interpreter's save-state discipline).
///
/// Frame extents come from simulating per-opcode stack effects from the
/// function entry to the frame's bytecode index; compilers keep heights
/// balanced at joins, so the linear scan is exact.
pub struct StackWalker<'a> {
    program: &'a Program,
    stack: &'a Stack,
    next_slot: Option<usize>,
}

impl<'a> StackWalker<'a> {
    pub fn new(program: &'a Program, stack: &'a Stack) -> Self {
        Self { program, stack, next_slot: Some(stack.top()) }
    }

    /// The next frame, outermost last. `None` once the terminating null
    /// return address is reached.
    pub fn move_next(&mut self) -> Option<Frame> {
        let bcp_slot = self.next_slot?;
        // SAFETY: walking live slots.
        let word = unsafe { self.stack.get(bcp_slot) };
        if word.raw() == 0 {
            self.next_slot = None;
            return None;
        }
        let bcp = word.raw() as *const u8;
        let function = self
            .program
            .function_from_bcp(bcp)
            .expect("return address resolves to a function");
        // SAFETY: resolved function is live.
        let start = unsafe { function.as_ref::<Function>().bytecode_address(0) };
        let pc = bcp as usize - start as usize;
        let first = bcp_slot == self.stack.top();
        let frame_size =
            compute_stack_offset(self.program, function, pc, !first);
        self.next_slot = (bcp_slot >= frame_size + 1)
            .then(|| bcp_slot - frame_size - 1);
        Some(Frame { function, bcp, frame_size, bcp_slot })
    }

    /// Find the innermost catch range covering a frame of this stack.
    pub fn compute_catch_target(program: &Program, stack: &Stack) -> Option<CatchTarget> {
        let mut walker = StackWalker::new(program, stack);
        while let Some(frame) = walker.move_next() {
            // SAFETY: live function.
            let function = unsafe { frame.function.as_ref::<Function>() };
            let start = unsafe { function.bytecode_address(0) };
            let pc = (frame.bcp as usize - start as usize) as u32;
            // SAFETY: catch ranges are part of the function.
            for range in unsafe { function.catch_ranges() } {
                if range.start <= pc && pc < range.end {
                    let base = frame.bcp_slot - frame.frame_size;
                    return Some(CatchTarget {
                        // SAFETY: handler lies within the function.
                        handler_bcp: unsafe {
                            function.bytecode_address(range.handler as usize)
                        },
                        exception_slot: base + range.frame_offset as usize,
                    });
                }
            }
        }
        None
    }
}

/// Simulated stack height at bytecode index `pc`, counting slots above
/// the frame's return address. With `exclude_last`, the instruction
/// ending exactly at `pc` (the pending invoke of a caller frame) is not
/// counted.
pub fn compute_stack_offset(
    program: &Program,
    function: Value,
    pc: usize,
    exclude_last: bool,
) -> usize {
    // SAFETY: live function.
    let f = unsafe { function.as_ref::<Function>() };
    // SAFETY: bytecode section is valid.
    let code = unsafe { f.bytecode() };
    let mut height: i64 = 0;
    let mut p = 0;
    while p < pc {
        let op = Op::from_u8(code[p]).expect("valid bytecode");
        let end = p + op.length();
        if end > pc || (exclude_last && end == pc) {
            break;
        }
        height += stack_diff(program, function, code, op, p);
        p = end;
    }
    debug_assert!(height >= 0, "unbalanced stack simulation");
    height as usize
}

/// Net stack effect of the instruction at `pc`.
fn stack_diff(
    program: &Program,
    function: Value,
    code: &[u8],
    op: Op,
    pc: usize,
) -> i64 {
    use Op::*;

    if let Some(form) = op.invoke_form() {
        // Pops receiver + args, pushes the result.
        let selector = match form {
            bytecode::InvokeForm::Fast => {
                let index = read_i32(code, pc + 1) as usize;
                // SAFETY: dispatch table entry written by folding.
                let table =
                    unsafe { program.dispatch_table().as_ref::<Array>() };
                let raw = unsafe { table.get_unchecked(index + 1).to_smi() };
                Selector::from_raw(raw as u32)
            }
            _ => Selector::from_raw(read_i32(code, pc + 1) as u32),
        };
        return -(selector.arity() as i64);
    }

    match op {
        LoadLocal0 | LoadLocal1 | LoadLocal2 | LoadLocal | LoadLocalWide
        | LoadBoxed | LoadStatic | LoadStaticInit | LoadConst
        | LoadConstUnfold | LoadLiteralNull | LoadLiteralTrue
        | LoadLiteralFalse | LoadLiteral0 | LoadLiteral1 | LoadLiteral
        | LoadLiteralWide => 1,

        LoadField | LoadFieldWide | StoreLocal | StoreBoxed | StoreStatic
        | Negate | StackOverflowCheck | AllocateBoxed | ProcessYield
        | InvokeTest | InvokeTestFast | InvokeTestVtable | FrameSize
        | BranchWide | BranchBack | BranchBackWide => 0,

        StoreField | StoreFieldWide | Pop | Identical | IdenticalNonNumeric
        | CoroutineChange | BranchIfTrueWide | BranchIfFalseWide
        | BranchBackIfTrue | BranchBackIfFalse | BranchBackIfTrueWide
        | BranchBackIfFalseWide | SubroutineReturn => -1,

        PopAndBranchWide | PopAndBranchBackWide => -(code[pc + 1] as i64),

        InvokeStatic | InvokeFactory => {
            let index = read_i32(code, pc + 1) as usize;
            let target = program.static_method_at(index);
            // SAFETY: static method table holds functions.
            1 - unsafe { target.as_ref::<Function>() }.arity() as i64
        }
        InvokeStaticUnfold | InvokeFactoryUnfold => {
            let index = read_i32(code, pc + 1) as usize;
            // SAFETY: literal pool holds the callee.
            let target = unsafe {
                function.as_ref::<Function>().literals()[index]
            };
            // SAFETY: the literal is a function.
            1 - unsafe { target.as_ref::<Function>() }.arity() as i64
        }

        // Success returns from the surrounding function; the fall-through
        // path pushes the reified failure.
        InvokeNative | InvokeNativeYield => 1,

        Allocate | AllocateImmutable => {
            let index = read_i32(code, pc + 1) as usize;
            let class = program.class_at(index);
            // SAFETY: class table holds classes.
            let fields = unsafe { class.as_ref::<Class>() }
                .format()
                .instance_fields();
            1 - fields as i64
        }
        AllocateUnfold | AllocateImmutableUnfold => {
            let index = read_i32(code, pc + 1) as usize;
            // SAFETY: literal pool holds the class.
            let class = unsafe {
                function.as_ref::<Function>().literals()[index]
            };
            // SAFETY: the literal is a class.
            let fields = unsafe { class.as_ref::<Class>() }
                .format()
                .instance_fields();
            1 - fields as i64
        }

        SubroutineCall => 1,

        // Overlay machinery and terminal opcodes; they never sit between
        // a frame's entry and a walked bytecode index in balanced code.
        InvokeSelector | EnterNoSuchMethod | ExitNoSuchMethod | Return
        | ReturnWide | Throw | MethodEnd => 0,

        _ => 0,
    }
}

/// Count the frames (and thus the call depth) of a stack.
pub fn frame_count(program: &Program, stack: &Stack) -> usize {
    let mut walker = StackWalker::new(program, stack);
    let mut count = 0;
    while walker.move_next().is_some() {
        count += 1;
    }
    count
}

/// Validate the frame bookkeeping of a stack: the walked frame extents
/// plus the bottom frame's arguments must account for every live slot.
pub fn validate_stack(program: &Program, stack: &Stack) {
    let mut walker = StackWalker::new(program, stack);
    let mut accounted = 0;
    let mut last: Option<Frame> = None;
    while let Some(frame) = walker.move_next() {
        accounted += frame.frame_size + 1;
        last = Some(frame);
    }
    let entry_args = last.map_or(0, |frame| {
        // SAFETY: live function.
        unsafe { frame.function.as_ref::<Function>() }.arity()
    });
    assert_eq!(
        stack.top(),
        accounted + entry_args,
        "wrong stack height"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corelib::{install_core, set_main};
    use crate::snapshot::{materialize, FunctionDesc, ProgramBuilder};
    use bytecode::BytecodeWriter;
    use heap::HeapSettings;

    #[test]
    fn stack_offsets_follow_per_opcode_effects() {
        let mut builder = ProgramBuilder::empty();
        let _core = install_core(&mut builder);
        let subject = {
            let mut w = BytecodeWriter::new();
            w.op(Op::LoadLiteral0); // 0: +1
            w.op(Op::LoadLiteral1); // 1: +1
            w.op(Op::Pop); // 2: -1
            w.op_u8(Op::LoadLiteral, 9); // 3: +1
            w.op(Op::Identical); // 5: -1
            w.op_u8_u8(Op::Return, 1, 0); // 6
            builder.add_function(FunctionDesc {
                arity: 0,
                literals: Vec::new(),
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        set_main(&mut builder, subject);
        let program =
            materialize(&builder, HeapSettings::default()).expect("load");
        let function = program.functions()[subject];

        assert_eq!(compute_stack_offset(&program, function, 0, false), 0);
        assert_eq!(compute_stack_offset(&program, function, 1, false), 1);
        assert_eq!(compute_stack_offset(&program, function, 2, false), 2);
        assert_eq!(compute_stack_offset(&program, function, 3, false), 1);
        assert_eq!(compute_stack_offset(&program, function, 5, false), 2);
        assert_eq!(compute_stack_offset(&program, function, 6, false), 1);
        // A caller frame excludes the instruction ending at the return
        // address.
        assert_eq!(compute_stack_offset(&program, function, 5, true), 1);
    }
}
