use std::sync::Arc;

use bytecode::{Builtin, InvokeForm, Op};
use object::{
    value_is_immutable, Array, Boxed, Class, Coroutine, Double, Function,
    Initializer, Instance, LargeInteger, Selector, SelectorKind, Value,
};

use crate::interning::CALL_ID;
use crate::natives::{native_function, NativeResult};
use crate::process::{Process, StackCheckResult};
use crate::program::Program;
use crate::stack_walker::StackWalker;

/// Why the interpreter handed its process back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// Never returned; the ready state belongs to the scheduler.
    Ready,
    /// A preemption request arrived through the stack limit.
    Interrupt,
    /// Cooperative yield; sleep when the mailbox is empty.
    Yielded,
    /// A blocking native handed control to the port in the yield value.
    TargetYielded,
    /// The process ran to completion.
    Terminated,
    /// An exception reached the bottom of the coroutine chain.
    UncaughtException,
    /// The immutable heap is exhausted; a rendezvous collection is due.
    ImmutableAllocationFailure,
    /// A breakpoint or step request hit.
    Breakpoint,
}

/// Outcome of one interpreter entry.
pub struct Interpretation {
    pub kind: InterruptKind,
    /// The port value accompanying [`InterruptKind::TargetYielded`].
    pub target_yield: Option<Value>,
}

enum Check {
    Continue,
    Interrupt,
    Overflow,
}

/// The threaded-dispatch engine: a bytecode pointer, a stack pointer and
/// the process, mirrored into registers while the process runs.
struct Engine<'p> {
    process: &'p mut Process,
    program: Arc<Program>,
    bcp: *const u8,
    sp: *mut Value,
}

/// Run `process` until it suspends.
pub fn interpret(process: &mut Process) -> Interpretation {
    // The stack may hold immutable pointers that predate this entry; the
    // store buffer must cover it before the mutator runs.
    process
        .store_buffer
        .insert(process.stack_value().ref_bits() as *mut u8);

    let program = process.program.clone();
    let mut engine = Engine {
        process,
        program,
        bcp: core::ptr::null(),
        sp: core::ptr::null_mut(),
    };
    engine.restore_state();
    let result = engine.run();

    // Compact on the way out so preemption intervals bound the buffer.
    if engine.process.store_buffer.should_deduplicate() {
        // SAFETY: all recorded objects are live in this process's heap.
        unsafe { engine.process.store_buffer.deduplicate() };
    }
    result
}

impl<'p> Engine<'p> {
    // ── Register save/restore ──────────────────────────────────────

    fn restore_state(&mut self) {
        let stack = self.process.stack_mut();
        let top = stack.top();
        // SAFETY: top is a live slot.
        unsafe {
            self.sp = stack.slot_pointer(top);
            self.bcp = (*self.sp).raw() as *const u8;
            self.sp = self.sp.sub(1);
        }
        debug_assert!(!self.bcp.is_null());
    }

    fn save_state(&mut self) {
        self.push(Value::from_raw(self.bcp as u64));
        let stack = self.process.stack_mut();
        // SAFETY: sp points into the stack's slots.
        let top = unsafe { self.sp.offset_from(stack.slot_pointer(0)) };
        stack.set_top(top as usize);
    }

    // ── Stack primitives ───────────────────────────────────────────

    #[inline(always)]
    fn push(&mut self, value: Value) {
        // SAFETY: stack checks keep sp below the limit.
        unsafe {
            self.sp = self.sp.add(1);
            *self.sp = value;
        }
    }

    #[inline(always)]
    fn pop(&mut self) -> Value {
        // SAFETY: the compiler keeps pops balanced with pushes.
        unsafe {
            let value = *self.sp;
            self.sp = self.sp.sub(1);
            value
        }
    }

    #[inline(always)]
    fn drop_slots(&mut self, n: usize) {
        // SAFETY: see pop.
        unsafe { self.sp = self.sp.sub(n) };
    }

    #[inline(always)]
    fn top(&self) -> Value {
        // SAFETY: see pop.
        unsafe { *self.sp }
    }

    #[inline(always)]
    fn set_top(&mut self, value: Value) {
        // SAFETY: see pop.
        unsafe { *self.sp = value };
    }

    #[inline(always)]
    fn local(&self, n: usize) -> Value {
        // SAFETY: see pop.
        unsafe { *self.sp.sub(n) }
    }

    #[inline(always)]
    fn set_local(&mut self, n: usize, value: Value) {
        // SAFETY: see pop.
        unsafe { *self.sp.sub(n) = value };
    }

    // ── Bytecode primitives ────────────────────────────────────────

    #[inline(always)]
    fn read_u8(&self, offset: usize) -> u8 {
        // SAFETY: within the current function's bytecode.
        unsafe { *self.bcp.add(offset) }
    }

    #[inline(always)]
    fn read_i32(&self, offset: usize) -> i32 {
        // SAFETY: within the current function's bytecode.
        unsafe {
            i32::from_le_bytes([
                *self.bcp.add(offset),
                *self.bcp.add(offset + 1),
                *self.bcp.add(offset + 2),
                *self.bcp.add(offset + 3),
            ])
        }
    }

    #[inline(always)]
    fn advance(&mut self, delta: isize) {
        // SAFETY: compiler-produced deltas stay inside the function.
        unsafe { self.bcp = self.bcp.offset(delta) };
    }

    #[inline(always)]
    fn goto(&mut self, bcp: *const u8) {
        debug_assert!(!bcp.is_null());
        self.bcp = bcp;
    }

    fn push_return_address(&mut self, offset: usize) {
        // SAFETY: stays inside the current function.
        let address = unsafe { self.bcp.add(offset) };
        self.push(Value::from_raw(address as u64));
    }

    fn pop_return_address(&mut self) {
        let address = self.pop();
        self.goto(address.raw() as *const u8);
    }

    /// The current function's literal at `index`.
    fn literal(&self, index: usize) -> Value {
        let function = self
            .program
            .function_from_bcp(self.bcp)
            .expect("bcp within a function");
        // SAFETY: live function; the compiler keeps indices in range.
        unsafe { function.as_ref::<Function>().literals()[index] }
    }

    #[inline(always)]
    fn has_stack_space_for(&self, slots: usize) -> bool {
        (self.sp as u64) + (slots as u64 * object::WORD as u64)
            < self.process.stack_limit()
    }

    fn to_bool(&self, value: bool) -> Value {
        self.program.to_boolean(value)
    }

    // ── Checks, GC, throwing ───────────────────────────────────────

    fn stack_overflow_check(&mut self, size: usize) -> Check {
        if self.has_stack_space_for(size) {
            return Check::Continue;
        }
        self.save_state();
        match self.process.handle_stack_overflow(size) {
            StackCheckResult::Continue | StackCheckResult::Grew => {
                self.restore_state();
                Check::Continue
            }
            StackCheckResult::Interrupt => Check::Interrupt,
            StackCheckResult::Overflow => Check::Overflow,
        }
    }

    /// The retry path behind *retry-after-gc*. True means the immutable
    /// heap is exhausted and the scheduler must run a rendezvous GC.
    fn collect_garbage_if_necessary(&mut self) -> bool {
        if self.process.heap.needs_garbage_collection() {
            self.save_state();
            self.process.collect_mutable_garbage();
            self.restore_state();
        }
        if self.process.store_buffer.should_deduplicate() {
            // SAFETY: recorded objects are live.
            unsafe { self.process.store_buffer.deduplicate() };
        }
        self.program.immutable_heap.needs_garbage_collection()
    }

    /// Unwind to a catch block; false when the exception is uncaught.
    /// Expects the state to be saved.
    fn do_throw(&mut self, exception: Value) -> bool {
        loop {
            let stack = self.process.stack();
            if let Some(target) =
                StackWalker::compute_catch_target(&self.program, stack)
            {
                let stack = self.process.stack_mut();
                // SAFETY: the walker returned a live slot index.
                unsafe {
                    stack.set(target.exception_slot, exception);
                    stack.set_top(target.exception_slot);
                    self.sp = stack.slot_pointer(target.exception_slot);
                }
                self.bcp = target.handler_bcp;
                return true;
            }

            // No handler on this coroutine; unwind one level.
            let current = self.process.coroutine();
            // SAFETY: the current coroutine is live.
            let caller = unsafe { current.as_ref::<Coroutine>() }.caller;
            if !caller.is_ref()
                || caller == self.program.specials().null_object
            {
                self.report_uncaught(exception);
                return false;
            }
            self.process.update_coroutine(caller);
            // Mark the unwound coroutine as terminated and release its
            // stack.
            // SAFETY: we own the process; the coroutine is live.
            unsafe {
                let dead = &mut *current.as_mut_ptr::<Coroutine>();
                dead.stack = self.program.specials().null_object;
                dead.caller = current;
            }
            // The caller resumes at its pending coroutine-change; the
            // next round of the loop searches its saved frames.
        }
    }

    fn report_uncaught(&self, exception: Value) {
        self.program.print("Uncaught exception:");
        self.program.print(&short_print(&self.program, exception));
    }

    // ── Dispatch helpers ───────────────────────────────────────────

    /// `invoke-method`: primary-cache dispatch.
    fn invoke_method(&mut self, selector: Selector, length: usize) -> Option<InterruptKind> {
        let receiver = self.local(selector.arity());
        self.push_return_address(length);
        let entry = self.process.lookup_entry(receiver, selector);
        // SAFETY: cache targets are live functions.
        let bcp = unsafe { entry.target.as_ref::<Function>().bytecode_address(0) };
        self.goto(bcp);
        self.check_after_call()
    }

    /// `invoke-method-fast`: range scan over a dispatch-table segment.
    fn invoke_method_fast(&mut self, index: usize, length: usize) -> Option<InterruptKind> {
        // SAFETY: the dispatch table is a live program array.
        let table = unsafe { self.program.dispatch_table().as_ref::<Array>() };
        // SAFETY: folding wrote a valid segment at `index`.
        let selector = unsafe {
            Selector::from_raw(table.get_unchecked(index + 1).to_smi() as u32)
        };
        let receiver = self.local(selector.arity());
        self.push_return_address(length);

        let class = self.program.class_of(receiver);
        // SAFETY: classes are live.
        let class_id = unsafe { class.as_ref::<Class>() }.id();

        let mut offset = 4;
        let target = loop {
            // SAFETY: every segment ends with a catch-all row.
            unsafe {
                let lower = table.get_unchecked(index + offset).to_smi();
                if class_id < lower {
                    offset += 4;
                    continue;
                }
                let upper = table.get_unchecked(index + offset + 1).to_smi();
                if class_id >= upper {
                    offset += 4;
                    continue;
                }
                break table.get_unchecked(index + offset + 3);
            }
        };
        // SAFETY: targets are live functions.
        let bcp = unsafe { target.as_ref::<Function>().bytecode_address(0) };
        self.goto(bcp);
        self.check_after_call()
    }

    /// `invoke-method-vtable`: offset-validated flat table.
    fn invoke_method_vtable(&mut self, selector: Selector, length: usize) -> Option<InterruptKind> {
        let arity = selector.arity();
        let offset = selector.id() as usize;
        let receiver = self.local(arity);
        self.push_return_address(length);

        let class = self.program.class_of(receiver);
        // SAFETY: classes are live.
        let index = unsafe { class.as_ref::<Class>() }.id() as usize + offset;
        // SAFETY: the vtable is a live program array; folding sized it to
        // cover every (class id, offset) sum.
        let entry = unsafe {
            self.program
                .vtable()
                .as_ref::<Array>()
                .get_unchecked(index)
        };
        // SAFETY: entries are 4-element arrays.
        let entry = unsafe { entry.as_ref::<Array>() };
        let entry = unsafe {
            if entry.get_unchecked(0).to_smi() != offset as i64 {
                self.program
                    .vtable()
                    .as_ref::<Array>()
                    .get_unchecked(0)
                    .as_ref::<Array>()
            } else {
                entry
            }
        };
        // SAFETY: the target slot holds a function.
        let target = unsafe { entry.get_unchecked(3) };
        let bcp = unsafe { target.as_ref::<Function>().bytecode_address(0) };
        self.goto(bcp);
        self.check_after_call()
    }

    /// The implicit stack check at every call entry.
    fn check_after_call(&mut self) -> Option<InterruptKind> {
        match self.stack_overflow_check(0) {
            Check::Continue => None,
            Check::Interrupt => Some(InterruptKind::Interrupt),
            Check::Overflow => {
                let exception = self.program.specials().stack_overflow_error;
                if self.do_throw(exception) {
                    None
                } else {
                    Some(InterruptKind::UncaughtException)
                }
            }
        }
    }

    /// The smi fast path of the monomorphized builtin invokes. `None`
    /// falls back to the general dispatch at the same bytecode.
    fn try_builtin_fast(&mut self, builtin: Builtin) -> Option<Value> {
        let arity = builtin.arity() as usize;
        let receiver = self.local(arity);
        if !receiver.is_smi() {
            return None;
        }
        // SAFETY: checked.
        let x = unsafe { receiver.to_smi() };
        let result = if arity == 0 {
            Value::from_smi(!x)
        } else {
            let argument = self.local(0);
            if !argument.is_smi() {
                return None;
            }
            // SAFETY: checked.
            let y = unsafe { argument.to_smi() };
            match builtin {
                Builtin::Eq => self.to_bool(x == y),
                Builtin::Lt => self.to_bool(x < y),
                Builtin::Le => self.to_bool(x <= y),
                Builtin::Gt => self.to_bool(x > y),
                Builtin::Ge => self.to_bool(x >= y),
                Builtin::Add => smi_checked(x.checked_add(y))?,
                Builtin::Sub => smi_checked(x.checked_sub(y))?,
                Builtin::Mul => smi_checked(x.checked_mul(y))?,
                Builtin::Mod => smi_checked(checked_mod(x, y))?,
                Builtin::TruncDiv => smi_checked(checked_div(x, y))?,
                Builtin::BitAnd => Value::from_smi(x & y),
                Builtin::BitOr => Value::from_smi(x | y),
                Builtin::BitXor => Value::from_smi(x ^ y),
                // Shift counts outside 0..64 take the general path.
                Builtin::BitShr => {
                    if !(0..64).contains(&y) {
                        return None;
                    }
                    Value::from_smi(x >> y)
                }
                Builtin::BitShl => {
                    if !(0..64).contains(&y) {
                        return None;
                    }
                    let shifted = x.checked_shl(y as u32)?;
                    if shifted >> y != x || !Value::fits_smi(shifted) {
                        return None;
                    }
                    Value::from_smi(shifted)
                }
                Builtin::BitNot => unreachable!("arity 0"),
            }
        };
        self.drop_slots(arity);
        self.set_top(result);
        Some(result)
    }

    // ── noSuchMethod machinery ─────────────────────────────────────

    /// Prepare the overlay frame that reroutes a failed dispatch, then
    /// jump into the trampoline body.
    fn enter_no_such_method(&mut self) {
        let program = self.program.clone();
        let sentinel = program.specials().sentinel_object;
        let null = program.specials().null_object;

        let return_address = self.local(0).raw() as *const u8;
        // All invoke sites share the 5-byte layout, so the site's opcode
        // and operand sit right before the return address.
        // SAFETY: the return address points just past an invoke.
        let site_op = unsafe {
            Op::from_u8(*return_address.sub(5)).expect("invoke opcode")
        };
        let operand = unsafe {
            i32::from_le_bytes([
                *return_address.sub(4),
                *return_address.sub(3),
                *return_address.sub(2),
                *return_address.sub(1),
            ])
        };

        let selector = if site_op == Op::InvokeSelector {
            // Nested trampolines: find the sentinel, take the selector
            // right above it, and redirect to `call` with the same arity.
            let mut offset = 1;
            while self.local(offset) != sentinel {
                offset += 1;
            }
            // SAFETY: the overlay pushed a selector smi there.
            let below = unsafe { self.local(offset - 1).to_smi() };
            let original = Selector::from_raw(below as u32);
            Selector::method(CALL_ID, original.arity() as u8)
        } else if site_op.is_invoke_fast() || site_op == Op::InvokeTestFast {
            // SAFETY: the dispatch table segment header holds the selector.
            unsafe {
                let table = program.dispatch_table().as_ref::<Array>();
                Selector::from_raw(
                    table.get_unchecked(operand as usize + 1).to_smi() as u32,
                )
            }
        } else if site_op.is_invoke_vtable() || site_op == Op::InvokeTestVtable
        {
            // Recover the original selector from the vtable row.
            let folded = Selector::from_raw(operand as u32);
            let offset = folded.id() as i64;
            // SAFETY: folding guarantees a row with this offset exists.
            unsafe {
                let vtable = program.vtable().as_ref::<Array>();
                let mut index = offset as usize;
                loop {
                    let entry = vtable.get_unchecked(index).as_ref::<Array>();
                    if entry.get_unchecked(0).to_smi() == offset {
                        break Selector::from_raw(
                            entry.get_unchecked(1).to_smi() as u32,
                        );
                    }
                    index += 1;
                }
            }
        } else {
            Selector::from_raw(operand as u32)
        };

        let arity = selector.arity();
        let selector_smi = Value::from_smi(selector.raw() as i64);
        let receiver = self.local(arity + 1);
        let class = program.class_of(receiver);

        self.push(sentinel);
        // exit-no-such-method pops arguments and detects setters with it.
        self.push(selector_smi);

        let get_selector = Selector::getter(selector.id());
        if program.lookup_method(class, get_selector).is_some() {
            // The receiver has a getter for this name: fetch the closure
            // and invoke `call` on it with the original arguments.
            let call_selector = Selector::method(CALL_ID, arity as u8);
            self.push(null);
            for _ in 0..arity {
                self.push(self.local(arity + 3));
            }
            self.push(Value::from_smi(call_selector.raw() as i64));
            self.push(null);
            self.push(Value::from_smi(get_selector.raw() as i64));
            self.push(receiver);
            self.advance(Op::EnterNoSuchMethod.length() as isize);
        } else {
            self.push(receiver);
            self.push(selector_smi);
            let delta = self.read_u8(1) as isize;
            self.advance(delta);
        }
    }

    /// Late-bound send: receiver and selector smi are on the stack.
    fn invoke_selector(&mut self) -> Option<InterruptKind> {
        let receiver = self.pop();
        // SAFETY: the overlay pushed a selector smi.
        let selector =
            Selector::from_raw(unsafe { self.pop().to_smi() } as u32);
        let arity = selector.arity();
        self.set_local(arity, receiver);
        self.push_return_address(Op::InvokeSelector.length());

        let class = self.program.class_of(receiver);
        let target = self
            .program
            .lookup_method(class, selector)
            .unwrap_or(self.program.specials().no_such_method_trampoline);
        // SAFETY: live function.
        let bcp = unsafe { target.as_ref::<Function>().bytecode_address(0) };
        self.goto(bcp);
        self.check_after_call()
    }

    // ── The loop ───────────────────────────────────────────────────

    fn run(&mut self) -> Interpretation {
        let debugging = self.process.debug_info.is_some();
        // When resuming at a breakpoint, do not immediately re-break.
        let mut skip_break = if let Some(info) = self.process.debug_info.as_mut()
        {
            let was = info.is_at_breakpoint;
            info.is_at_breakpoint = false;
            was
        } else {
            false
        };

        macro_rules! check {
            ($engine:expr, $size:expr) => {
                match $engine.stack_overflow_check($size) {
                    Check::Continue => {}
                    Check::Interrupt => {
                        return Interpretation {
                            kind: InterruptKind::Interrupt,
                            target_yield: None,
                        }
                    }
                    Check::Overflow => {
                        let exception =
                            $engine.program.specials().stack_overflow_error;
                        if !$engine.do_throw(exception) {
                            return Interpretation {
                                kind: InterruptKind::UncaughtException,
                                target_yield: None,
                            };
                        }
                    }
                }
            };
        }

        macro_rules! invoke {
            ($engine:expr, $call:expr) => {
                if let Some(kind) = $call {
                    return Interpretation { kind, target_yield: None };
                }
            };
        }

        loop {
            if debugging && !core::mem::take(&mut skip_break) {
                let coroutine = self.process.coroutine();
                let stack_base = unsafe {
                    self.process.stack().slot_pointer(0)
                };
                let height =
                    unsafe { self.sp.offset_from(stack_base) } as usize;
                let program = self.program.clone();
                let bcp = self.bcp;
                let info = self.process.debug_info.as_mut().expect("debugging");
                if info.should_break(&program, bcp, coroutine, height) {
                    info.is_at_breakpoint = true;
                    self.save_state();
                    return Interpretation {
                        kind: InterruptKind::Breakpoint,
                        target_yield: None,
                    };
                }
            }

            // SAFETY: the compiler only emits valid opcodes.
            let mut op = unsafe { Op::from_u8_unchecked(*self.bcp) };

            // Monomorphized builtins: smi fast path, else the general
            // dispatch form at the same bytecode.
            if let Some(builtin) = op.builtin() {
                if self.try_builtin_fast(builtin).is_some() {
                    self.advance(op.length() as isize);
                    continue;
                }
                op = match op.invoke_form().expect("builtin form") {
                    InvokeForm::Method => Op::InvokeMethod,
                    InvokeForm::Fast => Op::InvokeMethodFast,
                    InvokeForm::Vtable => Op::InvokeMethodVtable,
                };
            }

            match op {
                // ── Loads ──────────────────────────────────────────
                Op::LoadLocal0 => {
                    let value = self.local(0);
                    self.push(value);
                    self.advance(1);
                }
                Op::LoadLocal1 => {
                    let value = self.local(1);
                    self.push(value);
                    self.advance(1);
                }
                Op::LoadLocal2 => {
                    let value = self.local(2);
                    self.push(value);
                    self.advance(1);
                }
                Op::LoadLocal => {
                    let value = self.local(self.read_u8(1) as usize);
                    self.push(value);
                    self.advance(2);
                }
                Op::LoadLocalWide => {
                    let value = self.local(self.read_i32(1) as usize);
                    self.push(value);
                    self.advance(5);
                }
                Op::LoadBoxed => {
                    let boxed = self.local(self.read_u8(1) as usize);
                    // SAFETY: the compiler only loads boxed slots here.
                    let value = unsafe { boxed.as_ref::<Boxed>() }.value;
                    self.push(value);
                    self.advance(2);
                }
                Op::LoadStatic => {
                    let index = self.read_i32(1) as usize;
                    // SAFETY: statics indices are compiler-checked.
                    let value = unsafe {
                        self.process.statics_array().get_unchecked(index)
                    };
                    self.push(value);
                    self.advance(5);
                }
                Op::LoadStaticInit => {
                    let index = self.read_i32(1) as usize;
                    // SAFETY: statics indices are compiler-checked.
                    let value = unsafe {
                        self.process.statics_array().get_unchecked(index)
                    };
                    let is_initializer = value.is_ref() && {
                        // SAFETY: live object.
                        let class = unsafe {
                            value.as_ref::<object::HeapHeader>().class_value()
                        };
                        class == self.program.specials().initializer_class
                    };
                    if is_initializer {
                        // SAFETY: checked above.
                        let function =
                            unsafe { value.as_ref::<Initializer>() }.function;
                        self.push_return_address(5);
                        // SAFETY: live function.
                        let bcp = unsafe {
                            function.as_ref::<Function>().bytecode_address(0)
                        };
                        self.goto(bcp);
                        invoke!(self, self.check_after_call());
                    } else {
                        self.push(value);
                        self.advance(5);
                    }
                }
                Op::LoadField => {
                    let instance = self.pop();
                    // SAFETY: the compiler only reads fields of instances.
                    let value = unsafe {
                        instance.as_ref::<Instance>().field(self.read_u8(1) as usize)
                    };
                    self.push(value);
                    self.advance(2);
                }
                Op::LoadFieldWide => {
                    let instance = self.pop();
                    // SAFETY: see LoadField.
                    let value = unsafe {
                        instance
                            .as_ref::<Instance>()
                            .field(self.read_i32(1) as usize)
                    };
                    self.push(value);
                    self.advance(5);
                }
                Op::LoadConst => {
                    let index = self.read_i32(1) as usize;
                    let value = self.program.constant_at(index);
                    self.push(value);
                    self.advance(5);
                }
                Op::LoadConstUnfold => {
                    let value = self.literal(self.read_i32(1) as usize);
                    self.push(value);
                    self.advance(5);
                }

                // ── Stores ─────────────────────────────────────────
                Op::StoreLocal => {
                    let value = self.local(0);
                    self.set_local(self.read_u8(1) as usize, value);
                    self.advance(2);
                }
                Op::StoreBoxed => {
                    let value = self.local(0);
                    let boxed = self.local(self.read_u8(1) as usize);
                    // SAFETY: the compiler only stores into boxed slots.
                    unsafe { (*boxed.as_mut_ptr::<Boxed>()).value = value };
                    self.process.record_store(boxed, value);
                    self.advance(2);
                }
                Op::StoreStatic => {
                    let index = self.read_i32(1) as usize;
                    let value = self.local(0);
                    let statics = self.process.statics();
                    // SAFETY: statics indices are compiler-checked.
                    unsafe {
                        self.process
                            .statics_array()
                            .set_unchecked(index, value)
                    };
                    self.process.record_store(statics, value);
                    self.advance(5);
                }
                Op::StoreField => {
                    let value = self.pop();
                    let instance = self.pop();
                    debug_assert!(
                        // SAFETY: instance is live.
                        !unsafe { instance.as_ref::<Instance>() }.is_immutable()
                    );
                    // SAFETY: field indices are compiler-checked.
                    unsafe {
                        (*instance.as_mut_ptr::<Instance>())
                            .set_field(self.read_u8(1) as usize, value)
                    };
                    self.push(value);
                    self.process.record_store(instance, value);
                    self.advance(2);
                }
                Op::StoreFieldWide => {
                    let value = self.pop();
                    let instance = self.pop();
                    // SAFETY: field indices are compiler-checked.
                    unsafe {
                        (*instance.as_mut_ptr::<Instance>())
                            .set_field(self.read_i32(1) as usize, value)
                    };
                    self.push(value);
                    self.process.record_store(instance, value);
                    self.advance(5);
                }

                // ── Literals ───────────────────────────────────────
                Op::LoadLiteralNull => {
                    let null = self.program.specials().null_object;
                    self.push(null);
                    self.advance(1);
                }
                Op::LoadLiteralTrue => {
                    let value = self.program.specials().true_object;
                    self.push(value);
                    self.advance(1);
                }
                Op::LoadLiteralFalse => {
                    let value = self.program.specials().false_object;
                    self.push(value);
                    self.advance(1);
                }
                Op::LoadLiteral0 => {
                    self.push(Value::from_smi(0));
                    self.advance(1);
                }
                Op::LoadLiteral1 => {
                    self.push(Value::from_smi(1));
                    self.advance(1);
                }
                Op::LoadLiteral => {
                    let value = self.read_u8(1) as i64;
                    self.push(Value::from_smi(value));
                    self.advance(2);
                }
                Op::LoadLiteralWide => {
                    let value = self.read_i32(1) as i64;
                    self.push(Value::from_smi(value));
                    self.advance(5);
                }

                // ── Invocation ─────────────────────────────────────
                Op::InvokeMethod => {
                    let selector =
                        Selector::from_raw(self.read_i32(1) as u32);
                    invoke!(self, self.invoke_method(selector, 5));
                }
                Op::InvokeMethodFast => {
                    let index = self.read_i32(1) as usize;
                    invoke!(self, self.invoke_method_fast(index, 5));
                }
                Op::InvokeMethodVtable => {
                    let selector =
                        Selector::from_raw(self.read_i32(1) as u32);
                    invoke!(self, self.invoke_method_vtable(selector, 5));
                }
                Op::InvokeStatic | Op::InvokeFactory => {
                    let index = self.read_i32(1) as usize;
                    let target = self.program.static_method_at(index);
                    self.push_return_address(5);
                    // SAFETY: static methods are live functions.
                    let bcp = unsafe {
                        target.as_ref::<Function>().bytecode_address(0)
                    };
                    self.goto(bcp);
                    invoke!(self, self.check_after_call());
                }
                Op::InvokeStaticUnfold | Op::InvokeFactoryUnfold => {
                    let target = self.literal(self.read_i32(1) as usize);
                    self.push_return_address(5);
                    // SAFETY: the literal is a function.
                    let bcp = unsafe {
                        target.as_ref::<Function>().bytecode_address(0)
                    };
                    self.goto(bcp);
                    invoke!(self, self.check_after_call());
                }
                Op::InvokeNative => {
                    let arity = self.read_u8(1) as usize;
                    let native = self.read_u8(2);
                    match self.call_native(native, arity) {
                        NativeResult::Value(result) => {
                            self.pop_return_address();
                            self.drop_slots(arity);
                            self.push(result);
                        }
                        NativeResult::Failure(failure) => {
                            if failure == Value::RETRY_AFTER_GC {
                                if self.collect_garbage_if_necessary() {
                                    self.save_state();
                                    return Interpretation {
                                        kind: InterruptKind::ImmutableAllocationFailure,
                                        target_yield: None,
                                    };
                                }
                                continue;
                            }
                            let reified =
                                self.program.object_from_failure(failure);
                            self.push(reified);
                            self.advance(3);
                        }
                    }
                }
                Op::InvokeNativeYield => {
                    let arity = self.read_u8(1) as usize;
                    let native = self.read_u8(2);
                    match self.call_native(native, arity) {
                        NativeResult::Value(result) => {
                            self.pop_return_address();
                            self.drop_slots(arity);
                            let null = self.program.specials().null_object;
                            self.push(null);
                            if result != null {
                                self.save_state();
                                return Interpretation {
                                    kind: InterruptKind::TargetYielded,
                                    target_yield: Some(result),
                                };
                            }
                        }
                        NativeResult::Failure(failure) => {
                            if failure == Value::RETRY_AFTER_GC {
                                if self.collect_garbage_if_necessary() {
                                    self.save_state();
                                    return Interpretation {
                                        kind: InterruptKind::ImmutableAllocationFailure,
                                        target_yield: None,
                                    };
                                }
                                continue;
                            }
                            let reified =
                                self.program.object_from_failure(failure);
                            self.push(reified);
                            self.advance(3);
                        }
                    }
                }
                Op::InvokeSelector => {
                    invoke!(self, self.invoke_selector());
                }
                Op::InvokeTest => {
                    let selector =
                        Selector::from_raw(self.read_i32(1) as u32);
                    let receiver = self.local(0);
                    let entry = self.process.lookup_entry(receiver, selector);
                    let result = self.to_bool(entry.tag != 0);
                    self.set_top(result);
                    self.advance(5);
                }
                Op::InvokeTestFast => {
                    let index = self.read_i32(1) as usize;
                    // SAFETY: live program array.
                    let table = unsafe {
                        self.program.dispatch_table().as_ref::<Array>()
                    };
                    let receiver = self.local(0);
                    let class = self.program.class_of(receiver);
                    // SAFETY: live class.
                    let class_id = unsafe { class.as_ref::<Class>() }.id();
                    let mut offset = 4;
                    let found = loop {
                        // SAFETY: segments end with a catch-all row.
                        unsafe {
                            let lower =
                                table.get_unchecked(index + offset).to_smi();
                            if class_id < lower {
                                offset += 4;
                                continue;
                            }
                            let upper = table
                                .get_unchecked(index + offset + 1)
                                .to_smi();
                            if class_id >= upper {
                                offset += 4;
                                continue;
                            }
                            break upper != crate::program::ABSENT_UPPER;
                        }
                    };
                    let result = self.to_bool(found);
                    self.set_top(result);
                    self.advance(5);
                }
                Op::InvokeTestVtable => {
                    let selector =
                        Selector::from_raw(self.read_i32(1) as u32);
                    let offset = selector.id() as usize;
                    let receiver = self.local(0);
                    let class = self.program.class_of(receiver);
                    // SAFETY: live class; folding sized the vtable.
                    let matches = unsafe {
                        let index =
                            class.as_ref::<Class>().id() as usize + offset;
                        let entry = self
                            .program
                            .vtable()
                            .as_ref::<Array>()
                            .get_unchecked(index);
                        entry.as_ref::<Array>().get_unchecked(0).to_smi()
                            == offset as i64
                    };
                    let result = self.to_bool(matches);
                    self.set_top(result);
                    self.advance(5);
                }

                // ── Control ────────────────────────────────────────
                Op::Pop => {
                    self.drop_slots(1);
                    self.advance(1);
                }
                Op::Return => {
                    let locals = self.read_u8(1) as usize;
                    let arguments = self.read_u8(2) as usize;
                    let result = self.local(0);
                    self.drop_slots(locals);
                    self.pop_return_address();
                    self.drop_slots(arguments);
                    self.push(result);
                }
                Op::ReturnWide => {
                    let locals = self.read_i32(1) as usize;
                    let arguments = self.read_u8(5) as usize;
                    let result = self.local(0);
                    self.drop_slots(locals);
                    self.pop_return_address();
                    self.drop_slots(arguments);
                    self.push(result);
                }
                Op::BranchWide => {
                    let delta = self.read_i32(1) as isize;
                    self.advance(delta);
                }
                Op::BranchIfTrueWide => {
                    let delta = self.read_i32(1) as isize;
                    self.branch(delta, 5);
                }
                Op::BranchIfFalseWide => {
                    let delta = self.read_i32(1) as isize;
                    self.branch(5, delta);
                }
                Op::BranchBack => {
                    check!(self, 0);
                    let delta = self.read_u8(1) as isize;
                    self.advance(-delta);
                }
                Op::BranchBackIfTrue => {
                    check!(self, 0);
                    let delta = -(self.read_u8(1) as isize);
                    self.branch(delta, 2);
                }
                Op::BranchBackIfFalse => {
                    check!(self, 0);
                    let delta = -(self.read_u8(1) as isize);
                    self.branch(2, delta);
                }
                Op::BranchBackWide => {
                    check!(self, 0);
                    let delta = self.read_i32(1) as isize;
                    self.advance(-delta);
                }
                Op::BranchBackIfTrueWide => {
                    check!(self, 0);
                    let delta = -(self.read_i32(1) as isize);
                    self.branch(delta, 5);
                }
                Op::BranchBackIfFalseWide => {
                    check!(self, 0);
                    let delta = -(self.read_i32(1) as isize);
                    self.branch(5, delta);
                }
                Op::PopAndBranchWide => {
                    let count = self.read_u8(1) as usize;
                    let delta = self.read_i32(2) as isize;
                    self.drop_slots(count);
                    self.advance(delta);
                }
                Op::PopAndBranchBackWide => {
                    check!(self, 0);
                    let count = self.read_u8(1) as usize;
                    let delta = self.read_i32(2) as isize;
                    self.drop_slots(count);
                    self.advance(-delta);
                }

                // ── Allocation ─────────────────────────────────────
                Op::Allocate | Op::AllocateUnfold => {
                    let class = if op == Op::Allocate {
                        self.program.class_at(self.read_i32(1) as usize)
                    } else {
                        self.literal(self.read_i32(1) as usize)
                    };
                    let result = self.process.new_instance(class, false);
                    if result.is_failure() {
                        if self.collect_garbage_if_necessary() {
                            self.save_state();
                            return Interpretation {
                                kind: InterruptKind::ImmutableAllocationFailure,
                                target_yield: None,
                            };
                        }
                        continue;
                    }
                    // SAFETY: live class.
                    let fields = unsafe { class.as_ref::<Class>() }
                        .format()
                        .instance_fields();
                    let mut in_store_buffer = false;
                    let mut buffer_full = false;
                    for i in (0..fields).rev() {
                        let value = self.pop();
                        if !in_store_buffer
                            && value.is_ref()
                            && self
                                .program
                                .immutable_heap
                                .includes(value.ref_bits())
                        {
                            in_store_buffer = true;
                            self.process
                                .store_buffer
                                .insert(result.ref_bits() as *mut u8);
                            buffer_full =
                                self.process.store_buffer.should_deduplicate();
                        }
                        // SAFETY: fresh instance with `fields` slots.
                        unsafe {
                            (*result.as_mut_ptr::<Instance>())
                                .set_field(i, value)
                        };
                    }
                    self.push(result);
                    if buffer_full {
                        // SAFETY: recorded objects are live.
                        unsafe { self.process.store_buffer.deduplicate() };
                    }
                    self.advance(5);
                }
                Op::AllocateImmutable | Op::AllocateImmutableUnfold => {
                    let class = if op == Op::AllocateImmutable {
                        self.program.class_at(self.read_i32(1) as usize)
                    } else {
                        self.literal(self.read_i32(1) as usize)
                    };
                    // SAFETY: live class.
                    let fields = unsafe { class.as_ref::<Class>() }
                        .format()
                        .instance_fields();
                    // The immutability decision is deferred: scan the
                    // proposed field values first.
                    let mut immutable = true;
                    let mut has_immutable_pointers = false;
                    for i in 0..fields {
                        let value = self.local(i);
                        // SAFETY: stack slots hold live values.
                        if !unsafe { value_is_immutable(value) } {
                            immutable = false;
                        } else if value.is_ref()
                            && self
                                .program
                                .immutable_heap
                                .includes(value.ref_bits())
                        {
                            has_immutable_pointers = true;
                        }
                    }
                    let result = self.process.new_instance(class, immutable);
                    if result.is_failure() {
                        if self.collect_garbage_if_necessary() {
                            self.save_state();
                            return Interpretation {
                                kind: InterruptKind::ImmutableAllocationFailure,
                                target_yield: None,
                            };
                        }
                        continue;
                    }
                    for i in (0..fields).rev() {
                        let value = self.pop();
                        // SAFETY: fresh instance with `fields` slots.
                        unsafe {
                            (*result.as_mut_ptr::<Instance>())
                                .set_field(i, value)
                        };
                    }
                    self.push(result);
                    if !immutable && has_immutable_pointers {
                        self.process
                            .store_buffer
                            .insert(result.ref_bits() as *mut u8);
                        if self.process.store_buffer.should_deduplicate() {
                            // SAFETY: recorded objects are live.
                            unsafe { self.process.store_buffer.deduplicate() };
                        }
                    }
                    self.advance(5);
                }
                Op::AllocateBoxed => {
                    let value = self.local(0);
                    let boxed = self.process.new_boxed(value);
                    if boxed.is_failure() {
                        if self.collect_garbage_if_necessary() {
                            self.save_state();
                            return Interpretation {
                                kind: InterruptKind::ImmutableAllocationFailure,
                                target_yield: None,
                            };
                        }
                        continue;
                    }
                    self.set_top(boxed);
                    self.advance(1);
                }

                // ── Misc ───────────────────────────────────────────
                Op::Negate => {
                    let condition = self.local(0);
                    let result = self
                        .to_bool(condition != self.program.specials().true_object);
                    self.set_top(result);
                    self.advance(1);
                }
                Op::StackOverflowCheck => {
                    let size = self.read_i32(1) as usize;
                    check!(self, size);
                    self.advance(5);
                }
                Op::Throw => {
                    let exception = self.local(0);
                    self.save_state();
                    if !self.do_throw(exception) {
                        return Interpretation {
                            kind: InterruptKind::UncaughtException,
                            target_yield: None,
                        };
                    }
                }
                Op::ProcessYield => {
                    let value = self.local(0);
                    let null = self.program.specials().null_object;
                    self.set_top(null);
                    self.advance(1);
                    self.save_state();
                    // SAFETY: the compiler passes a smi yield reason.
                    let kind = match unsafe { value.to_smi() } & 0x7fff_ffff {
                        0 => InterruptKind::Yielded,
                        1 => InterruptKind::Interrupt,
                        _ => InterruptKind::Terminated,
                    };
                    return Interpretation { kind, target_yield: None };
                }
                Op::CoroutineChange => {
                    let argument = self.local(0);
                    let null = self.program.specials().null_object;
                    self.set_local(0, null);
                    let coroutine = self.local(1);
                    self.set_local(1, null);

                    self.save_state();
                    self.process.update_coroutine(coroutine);
                    self.restore_state();

                    self.advance(1);
                    self.drop_slots(1);
                    self.set_top(argument);
                }
                Op::Identical => {
                    let result = identical(
                        &self.program,
                        self.local(1),
                        self.local(0),
                    );
                    self.drop_slots(1);
                    self.set_top(result);
                    self.advance(1);
                }
                Op::IdenticalNonNumeric => {
                    let identical = self.local(0) == self.local(1);
                    let result = self.to_bool(identical);
                    self.drop_slots(1);
                    self.set_top(result);
                    self.advance(1);
                }
                Op::EnterNoSuchMethod => {
                    self.enter_no_such_method();
                }
                Op::ExitNoSuchMethod => {
                    let mut result = self.pop();
                    // SAFETY: the overlay pushed a selector smi.
                    let selector = Selector::from_raw(
                        unsafe { self.pop().to_smi() } as u32,
                    );
                    self.drop_slots(1); // sentinel
                    self.pop_return_address();

                    // The result of a setter must be the assigned value,
                    // even through noSuchMethod.
                    if selector.kind() == SelectorKind::Setter {
                        result = self.local(0);
                    }
                    self.drop_slots(selector.arity() + 1);
                    self.push(result);
                }
                Op::SubroutineCall => {
                    let delta = self.read_i32(1) as isize;
                    let return_delta = self.read_i32(5) as i64;
                    self.push(Value::from_smi(return_delta));
                    self.advance(delta);
                }
                Op::SubroutineReturn => {
                    // SAFETY: pushed by subroutine-call.
                    let delta = unsafe { self.pop().to_smi() } as isize;
                    self.advance(-delta);
                }
                Op::FrameSize => {
                    self.advance(2);
                }
                Op::MethodEnd => {
                    unreachable!("cannot interpret method-end")
                }
                _ => unreachable!("builtin invokes are canonicalized above"),
            }
        }
    }

    fn branch(&mut self, true_offset: isize, false_offset: isize) {
        let condition = self.pop();
        let offset = if condition == self.program.specials().true_object {
            true_offset
        } else {
            false_offset
        };
        self.advance(offset);
    }

    fn call_native(&mut self, index: u8, arity: usize) -> NativeResult {
        // The receiver sits at local(arity); the return address above the
        // arguments is not part of the slice.
        // SAFETY: arguments live at local(arity)..local(1).
        let arguments: Vec<Value> = unsafe {
            core::slice::from_raw_parts(self.sp.sub(arity), arity).to_vec()
        };
        let native = native_function(index);
        native(self.process, &arguments)
    }
}

/// `identical`: reference equality plus bit-wise double equality and
/// value equality for large integers. NaNs with equal bits are
/// identical; `-0.0` and `0.0` are not.
pub fn identical(program: &Program, left: Value, right: Value) -> Value {
    let result = if left == right {
        true
    } else if left.is_ref() && right.is_ref() {
        let specials = program.specials();
        // SAFETY: live objects.
        unsafe {
            let left_class = left.as_ref::<object::HeapHeader>().class_value();
            let right_class =
                right.as_ref::<object::HeapHeader>().class_value();
            if left_class != right_class {
                false
            } else if left_class == specials.double_class {
                left.as_ref::<Double>().value().to_bits()
                    == right.as_ref::<Double>().value().to_bits()
            } else if left_class == specials.large_integer_class {
                left.as_ref::<LargeInteger>().value()
                    == right.as_ref::<LargeInteger>().value()
            } else {
                false
            }
        }
    } else {
        false
    };
    program.to_boolean(result)
}

fn smi_checked(value: Option<i64>) -> Option<Value> {
    let value = value?;
    Value::fits_smi(value).then(|| Value::from_smi(value))
}

fn checked_mod(x: i64, y: i64) -> Option<i64> {
    if y == 0 {
        None
    } else {
        Some(x.rem_euclid(y))
    }
}

fn checked_div(x: i64, y: i64) -> Option<i64> {
    if y == 0 {
        None
    } else {
        x.checked_div(y)
    }
}

/// One-line rendering of a value for diagnostics.
pub fn short_print(program: &Program, value: Value) -> String {
    if value.is_smi() {
        // SAFETY: checked.
        return unsafe { value.to_smi() }.to_string();
    }
    if !value.is_ref() {
        return format!("{value:?}");
    }
    let specials = program.specials();
    // SAFETY: live object.
    unsafe {
        let class = value.as_ref::<object::HeapHeader>().class_value();
        if class == specials.double_class {
            format!("{}", value.as_ref::<Double>().value())
        } else if class == specials.large_integer_class {
            format!("{}", value.as_ref::<LargeInteger>().value())
        } else if class == specials.string_class {
            value.as_ref::<object::VmString>().to_rust_string()
        } else if value == specials.null_object {
            "null".to_string()
        } else if value == specials.true_object {
            "true".to_string()
        } else if value == specials.false_object {
            "false".to_string()
        } else {
            let id = class.as_ref::<Class>().id();
            format!("instance of class #{id}")
        }
    }
}
