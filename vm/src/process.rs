use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use heap::{Part, ProcessHeap, StoreBuffer};
use object::{
    value_is_immutable, Array, Boxed, Class, Coroutine, Double, Instance,
    InstanceFlags, LargeInteger, Selector, Stack, Value, VmString,
};
use parking_lot::Mutex;

use crate::lookup::{CacheEntry, LookupCache};
use crate::port::PortHandle;
use crate::program::Program;

/// Scheduler-visible process states; transitions are atomic CAS flips so
/// at most one worker ever owns a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Sleeping = 0,
    Ready,
    Running,
    Yielding,
    Terminated,
    UncaughtException,
    Breakpoint,
}

/// Outcome of a stack-overflow check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackCheckResult {
    /// Enough room; keep going.
    Continue,
    /// The stack was grown (and moved); restore the saved state.
    Grew,
    /// A preemption request was delivered through the stack limit.
    Interrupt,
    /// The stack cap was hit; throw the stack-overflow exception.
    Overflow,
}

/// A mailbox entry. Exit messages are delivered when a linked process
/// terminates.
#[derive(Debug, Clone, Copy)]
pub enum Message {
    Data(Value),
    Exit(Value),
}

impl Message {
    pub fn value(&self) -> Value {
        match *self {
            Message::Data(v) | Message::Exit(v) => v,
        }
    }
}

/// A breakpoint registered by the debug session.
#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    pub id: u32,
    pub function: Value,
    pub bytecode_index: usize,
    pub one_shot: bool,
    pub coroutine: Option<Value>,
    pub stack_height: Option<usize>,
}

/// Per-process debugging state; present only while a session is attached.
#[derive(Default)]
pub struct DebugInfo {
    breakpoints: Vec<Breakpoint>,
    next_id: u32,
    pub is_stepping: bool,
    pub is_at_breakpoint: bool,
}

impl DebugInfo {
    pub fn set_breakpoint(&mut self, breakpoint: Breakpoint) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.breakpoints.push(Breakpoint { id, ..breakpoint });
        id
    }

    pub fn delete_breakpoint(&mut self, id: u32) -> bool {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|b| b.id != id);
        before != self.breakpoints.len()
    }

    /// Whether execution should stop before the bytecode at `bcp`.
    pub fn should_break(
        &mut self,
        program: &Program,
        bcp: *const u8,
        coroutine: Value,
        stack_height: usize,
    ) -> bool {
        if self.is_stepping {
            return true;
        }
        let Some(function) = program.function_from_bcp(bcp) else {
            return false;
        };
        // SAFETY: resolved function is live.
        let start = unsafe {
            function.as_ref::<object::Function>().bytecode_address(0)
        };
        let pc = bcp as usize - start as usize;
        let hit = self.breakpoints.iter().position(|b| {
            b.function == function
                && b.bytecode_index == pc
                && b.coroutine.map_or(true, |c| c == coroutine)
                && b.stack_height.map_or(true, |h| h == stack_height)
        });
        match hit {
            Some(index) => {
                if self.breakpoints[index].one_shot {
                    self.breakpoints.remove(index);
                }
                true
            }
            None => false,
        }
    }
}

/// Default and maximum execution-stack sizes, in slots.
const INITIAL_STACK_SLOTS: usize = 256;
const MAX_STACK_SLOTS: usize = 128 * 1024;
/// Slots kept free above the limit for the state save.
const STACK_HEADROOM: usize = 4;

/// A lightweight process: a single-threaded actor owning its mutable
/// heap, execution stack, coroutine chain, statics, lookup cache, store
/// buffer and mailbox.
pub struct Process {
    pub program: Arc<Program>,
    pub heap: ProcessHeap,
    pub store_buffer: StoreBuffer,
    pub lookup_cache: LookupCache,
    pub debug_info: Option<Box<DebugInfo>>,
    /// The `_gc` native's request/acknowledge flag.
    pub pending_gc_native: bool,

    statics: Value,
    coroutine: Value,
    exit_value: Value,

    stack_limit: AtomicU64,
    state: AtomicU8,
    immutable_part: Option<Part>,

    pub mailbox: Mutex<VecDeque<Message>>,
    links: Mutex<Vec<PortHandle>>,
    owned_ports: Mutex<Vec<PortHandle>>,
}

// SAFETY: a process is owned by at most one worker at a time; the
// cross-thread pieces (mailbox, state, stack limit) are synchronized.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    pub fn new(program: Arc<Program>) -> Self {
        let mut heap = ProcessHeap::new(&program.settings);
        let statics = clone_statics(&program, &mut heap);
        Self {
            program,
            heap,
            store_buffer: StoreBuffer::new(),
            lookup_cache: LookupCache::new(),
            debug_info: None,
            pending_gc_native: false,
            statics,
            coroutine: Value::from_smi(0),
            exit_value: Value::from_smi(0),
            stack_limit: AtomicU64::new(u64::MAX),
            state: AtomicU8::new(ProcessState::Sleeping as u8),
            immutable_part: None,
            mailbox: Mutex::new(VecDeque::new()),
            links: Mutex::new(Vec::new()),
            owned_ports: Mutex::new(Vec::new()),
        }
    }

    // ── State machine ──────────────────────────────────────────────

    pub fn state(&self) -> ProcessState {
        // SAFETY: only written from the enum.
        unsafe { core::mem::transmute::<u8, ProcessState>(self.state.load(Ordering::Acquire)) }
    }

    pub fn change_state(&self, from: ProcessState, to: ProcessState) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // ── Stack and coroutine ────────────────────────────────────────

    pub fn setup_execution_stack(&mut self) {
        debug_assert!(!self.coroutine.is_ref());
        let stack = self.new_stack(INITIAL_STACK_SLOTS);
        assert!(!stack.is_failure(), "initial stack allocation");
        let coroutine = self.new_coroutine(stack);
        assert!(!coroutine.is_failure(), "initial coroutine allocation");
        self.coroutine = coroutine;
        self.update_stack_limit();
        // Stacks may come to hold immutable pointers transparently.
        self.store_buffer.insert(stack.ref_bits() as *mut u8);
    }

    pub fn coroutine(&self) -> Value {
        self.coroutine
    }

    pub fn stack_value(&self) -> Value {
        // SAFETY: the coroutine is live.
        unsafe { self.coroutine.as_ref::<Coroutine>() }.stack
    }

    pub fn stack(&self) -> &Stack {
        // SAFETY: the coroutine's stack is live.
        unsafe { self.stack_value().as_ref::<Stack>() }
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        // SAFETY: the coroutine's stack is live; we own the process.
        unsafe { &mut *self.stack_value().as_mut_ptr::<Stack>() }
    }

    /// Atomic switch of the active coroutine. The caller saves and
    /// restores the bytecode and stack pointers around this.
    pub fn update_coroutine(&mut self, coroutine: Value) {
        debug_assert!({
            // SAFETY: argument validated by the caller.
            unsafe { coroutine.as_ref::<Coroutine>() }.stack.is_ref()
        });
        self.coroutine = coroutine;
        self.update_stack_limit();
        // The incoming stack may hold immutable pointers.
        self.store_buffer.insert(self.stack_value().ref_bits() as *mut u8);
    }

    fn update_stack_limit(&self) {
        let stack = self.stack();
        let len = stack.len();
        // SAFETY: in bounds.
        let limit = unsafe { stack.slot_pointer(len - STACK_HEADROOM) } as u64;
        self.stack_limit.store(limit, Ordering::Release);
    }

    #[inline(always)]
    pub fn stack_limit(&self) -> u64 {
        self.stack_limit.load(Ordering::Acquire)
    }

    /// Deliver an asynchronous interrupt: the next stack check observes a
    /// zero limit and returns [`StackCheckResult::Interrupt`].
    pub fn preempt(&self) {
        self.stack_limit.store(0, Ordering::Release);
    }

    /// React to a failed stack check; the interpreter has saved its state.
    pub fn handle_stack_overflow(&mut self, size: usize) -> StackCheckResult {
        if self.stack_limit.load(Ordering::Acquire) == 0 {
            self.update_stack_limit();
            return StackCheckResult::Interrupt;
        }

        let old_len = self.stack().len();
        let needed = old_len + size + STACK_HEADROOM;
        let mut new_len = (old_len * 2).max(INITIAL_STACK_SLOTS);
        while new_len < needed {
            new_len *= 2;
        }
        if new_len > MAX_STACK_SLOTS {
            return StackCheckResult::Overflow;
        }

        let mut new_stack = self.new_stack(new_len);
        if new_stack.is_failure() {
            self.collect_mutable_garbage();
            new_stack = self.new_stack(new_len);
            if new_stack.is_failure() {
                return StackCheckResult::Overflow;
            }
        }

        // SAFETY: both stacks are live; the old one keeps its saved state.
        unsafe {
            let old = self.stack_value().as_ref::<Stack>();
            let new = &mut *new_stack.as_mut_ptr::<Stack>();
            let top = old.top();
            for i in 0..=top {
                new.set(i, old.get(i));
            }
            new.set_top(top);
            let coroutine = &mut *self.coroutine.as_mut_ptr::<Coroutine>();
            coroutine.stack = new_stack;
        }
        self.record_store(self.coroutine, new_stack);
        self.store_buffer.insert(new_stack.ref_bits() as *mut u8);
        self.update_stack_limit();
        tracing::trace!(target: "interpreter", old_len, new_len, "stack grown");
        StackCheckResult::Grew
    }

    // ── Allocation ─────────────────────────────────────────────────

    fn allocate_mutable(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.heap.allocate(size)
    }

    fn allocate_immutable(&mut self, size: usize) -> Option<NonNull<u8>> {
        let immutable = &self.program.immutable_heap;
        if size > immutable.large_threshold() {
            return immutable.allocate_large(size);
        }
        if let Some(part) = self.immutable_part.as_mut() {
            if let Some(ptr) = part.allocate(size) {
                return Some(ptr);
            }
        }
        // Current part exhausted; carve a new one.
        let part = immutable.acquire_part()?;
        let old = self.immutable_part.replace(part);
        if let Some(old) = old {
            immutable.release_part(old);
        }
        self.immutable_part.as_mut().and_then(|p| p.allocate(size))
    }

    pub fn drop_immutable_part(&mut self) {
        if let Some(part) = self.immutable_part.take() {
            self.program.immutable_heap.release_part(part);
        }
    }

    /// Allocate an instance of `class`; in the immutable heap when
    /// `immutable` is set (the caller has verified the field values).
    pub fn new_instance(&mut self, class: Value, immutable: bool) -> Value {
        // SAFETY: class is a live program object.
        let fields = unsafe { class.as_ref::<Class>() }.format().instance_fields();
        let size = Instance::allocation_size(fields);
        let ptr = if immutable {
            self.allocate_immutable(size)
        } else {
            self.allocate_mutable(size)
        };
        let Some(ptr) = ptr else {
            return Value::RETRY_AFTER_GC;
        };
        let flags = if immutable {
            InstanceFlags::IMMUTABLE
        } else {
            InstanceFlags::empty()
        };
        // SAFETY: freshly allocated with the right size.
        unsafe {
            (*(ptr.as_ptr() as *mut Instance)).init(
                class,
                flags,
                fields,
                self.program.specials().null_object,
            )
        };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn new_array(&mut self, length: usize) -> Value {
        let size = Array::allocation_size(length);
        let Some(ptr) = self.allocate_mutable(size) else {
            return Value::RETRY_AFTER_GC;
        };
        let class = self.program.specials().array_class;
        let null = self.program.specials().null_object;
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Array)).init(class, length, null) };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn new_boxed(&mut self, value: Value) -> Value {
        let Some(ptr) = self.allocate_mutable(Boxed::SIZE) else {
            return Value::RETRY_AFTER_GC;
        };
        let class = self.program.specials().boxed_class;
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Boxed)).init(class, value) };
        let boxed = Value::from_ptr(ptr.as_ptr());
        self.record_store(boxed, value);
        boxed
    }

    pub fn new_double(&mut self, value: f64) -> Value {
        let Some(ptr) = self.allocate_immutable(Double::SIZE) else {
            return Value::RETRY_AFTER_GC;
        };
        let class = self.program.specials().double_class;
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Double)).init(class, value) };
        Value::from_ptr(ptr.as_ptr())
    }

    /// Box an integer: a smi when it fits, a LargeInteger otherwise.
    pub fn new_integer(&mut self, value: i64) -> Value {
        if Value::fits_smi(value) {
            return Value::from_smi(value);
        }
        let Some(ptr) = self.allocate_immutable(LargeInteger::SIZE) else {
            return Value::RETRY_AFTER_GC;
        };
        let class = self.program.specials().large_integer_class;
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut LargeInteger)).init(class, value) };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn new_string(&mut self, units: usize) -> Value {
        let size = VmString::allocation_size(units);
        let Some(ptr) = self.allocate_immutable(size) else {
            return Value::RETRY_AFTER_GC;
        };
        let class = self.program.specials().string_class;
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut VmString)).init(class, units) };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn new_string_from_units(&mut self, units: &[u16]) -> Value {
        let value = self.new_string(units.len());
        if value.is_failure() {
            return value;
        }
        // SAFETY: fresh string of the right length.
        unsafe {
            (*value.as_mut_ptr::<VmString>())
                .code_units_mut()
                .copy_from_slice(units)
        };
        value
    }

    pub fn new_stack(&mut self, slots: usize) -> Value {
        let size = Stack::allocation_size(slots);
        let Some(ptr) = self.allocate_mutable(size) else {
            return Value::RETRY_AFTER_GC;
        };
        let class = self.program.specials().stack_class;
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Stack)).init(class, slots) };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn new_coroutine(&mut self, stack: Value) -> Value {
        let Some(ptr) = self.allocate_mutable(Coroutine::SIZE) else {
            return Value::RETRY_AFTER_GC;
        };
        let class = self.program.specials().coroutine_class;
        let null = self.program.specials().null_object;
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Coroutine)).init(class, stack, null) };
        Value::from_ptr(ptr.as_ptr())
    }

    // ── Write barrier ──────────────────────────────────────────────

    /// Record a store of `value` into the mutable container `target`.
    /// Only pointers into the immutable heap need remembering.
    #[inline]
    pub fn record_store(&mut self, target: Value, value: Value) {
        if value.is_ref()
            && self.program.immutable_heap.includes(value.ref_bits())
        {
            debug_assert!(unsafe { value_is_immutable(value) });
            self.store_buffer.insert(target.ref_bits() as *mut u8);
        }
    }

    // ── Dispatch ───────────────────────────────────────────────────

    #[inline]
    pub fn lookup_entry(&mut self, receiver: Value, selector: Selector) -> CacheEntry {
        let class = self.program.class_of(receiver);
        let program = self.program.clone();
        self.lookup_cache.lookup(&program, class, selector)
    }

    // ── Garbage collection ─────────────────────────────────────────

    /// Scavenge the mutable heap, rebuild the store buffer and re-insert
    /// the current stack.
    pub fn collect_mutable_garbage(&mut self) {
        let _span = tracing::debug_span!("mutable_gc").entered();
        let program = self.program.clone();
        let statics = &mut self.statics;
        let coroutine = &mut self.coroutine;
        let exit_value = &mut self.exit_value;
        let mailbox = &mut self.mailbox;
        // SAFETY: we own the process; roots cover every process-held slot.
        unsafe {
            self.heap.scavenge(
                &mut |visit| {
                    visit(statics);
                    visit(coroutine);
                    visit(exit_value);
                    for message in mailbox.lock().iter_mut() {
                        match message {
                            Message::Data(v) | Message::Exit(v) => visit(v),
                        }
                    }
                },
                &|address| program.immutable_heap.includes(address),
                &mut self.store_buffer,
            );
        }
        self.store_buffer.insert(self.stack_value().ref_bits() as *mut u8);
        self.update_stack_limit();
    }

    /// Feed every root slot to `visit`; used by both collectors.
    pub fn visit_roots(&mut self, visit: &mut dyn FnMut(&mut Value)) {
        visit(&mut self.statics);
        visit(&mut self.coroutine);
        visit(&mut self.exit_value);
        for message in self.mailbox.lock().iter_mut() {
            match message {
                Message::Data(v) | Message::Exit(v) => visit(v),
            }
        }
        // The coroutine chain and stacks hang off `coroutine` for the
        // mutable collector; for the immutable collector their slots are
        // covered through the store buffer, which always holds the
        // stacks of entered interpreters.
    }

    pub fn statics(&self) -> Value {
        self.statics
    }

    pub fn statics_array(&mut self) -> &mut Array {
        // SAFETY: statics is a live mutable-heap array owned by us.
        unsafe { &mut *self.statics.as_mut_ptr::<Array>() }
    }

    // ── Mailbox / links ────────────────────────────────────────────

    pub fn enqueue_message(&self, message: Message) {
        self.mailbox.lock().push_back(message);
    }

    pub fn dequeue_message(&self) -> Option<Message> {
        self.mailbox.lock().pop_front()
    }

    pub fn mailbox_is_empty(&self) -> bool {
        self.mailbox.lock().is_empty()
    }

    pub fn add_link(&self, port: PortHandle) {
        self.links.lock().push(port);
    }

    pub fn set_exit_value(&mut self, value: Value) {
        self.exit_value = value;
    }

    pub fn exit_value(&self) -> Value {
        self.exit_value
    }

    /// Track a port owned (received on) by this process.
    pub fn register_port(&self, port: PortHandle) {
        self.owned_ports.lock().push(port);
    }

    /// Deliver exit messages to every linked port and detach the owned
    /// ones. Called by the scheduler right before the process is
    /// destroyed.
    pub fn notify_linked_ports(&mut self) {
        let links = core::mem::take(&mut *self.links.lock());
        for port in links {
            port.send_exit(self.exit_value);
        }
        let owned = core::mem::take(&mut *self.owned_ports.lock());
        for port in owned {
            port.detach();
        }
    }
}

/// Copy the program's statics template into a fresh process heap.
fn clone_statics(program: &Arc<Program>, heap: &mut ProcessHeap) -> Value {
    let template = program.statics_template();
    // SAFETY: the template is a live program array.
    let template = unsafe { template.as_ref::<Array>() };
    let size = Array::allocation_size(template.len());
    let ptr = heap
        .allocate(size)
        .expect("statics allocation in a fresh heap");
    let class = program.specials().array_class;
    let null = program.specials().null_object;
    // SAFETY: freshly allocated with the right size.
    unsafe {
        let array = &mut *(ptr.as_ptr() as *mut Array);
        array.init(class, template.len(), null);
        for i in 0..template.len() {
            array.set_unchecked(i, template.get_unchecked(i));
        }
    }
    Value::from_ptr(ptr.as_ptr())
}
