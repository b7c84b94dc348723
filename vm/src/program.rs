use std::cell::UnsafeCell;
use std::ptr::NonNull;

use heap::{HeapSettings, ImmutableHeap, Space};
use object::{
    Array, ByteArray, CatchRange, Class, Double, Function, HeapHeader,
    Initializer, Instance, InstanceFlags, InstanceFormat, LargeInteger,
    Selector, Value, VmString,
};
use parking_lot::{Mutex, RwLock};

use crate::interning::Names;
use crate::process::Process;
use crate::scheduler::Scheduler;
use bytecode::{read_i32, InvokeForm, Op};

/// Upper bound for dispatch-table ranges that mark an absent selector;
/// `invoke-test-fast` keys off it.
pub const ABSENT_UPPER: i64 = (1 << 62) - 1;

/// The immortal objects and classes every program carries.
pub struct Specials {
    pub null_object: Value,
    pub true_object: Value,
    pub false_object: Value,
    pub sentinel_object: Value,
    pub stack_overflow_error: Value,
    pub wrong_argument_type_error: Value,
    pub index_out_of_bounds_error: Value,

    pub meta_class: Value,
    pub null_class: Value,
    pub bool_class: Value,
    pub smi_class: Value,
    pub large_integer_class: Value,
    pub double_class: Value,
    pub string_class: Value,
    pub array_class: Value,
    pub byte_array_class: Value,
    pub boxed_class: Value,
    pub stack_class: Value,
    pub coroutine_class: Value,
    pub function_class: Value,
    pub initializer_class: Value,
    pub port_class: Value,

    pub no_such_method_trampoline: Value,
}

struct Tables {
    classes: Value,
    constants: Value,
    static_methods: Value,
    statics_template: Value,
    dispatch_table: Value,
    vtable: Value,
    entry: Value,
    main_arity: usize,
    specials: Option<Specials>,
    /// Every function the snapshot materialized, for bcp resolution.
    functions: Vec<Value>,
    /// Sorted (start, end, function) bytecode ranges.
    function_ranges: Vec<(u64, u64, Value)>,
    /// Invoke sites rewritten by folding, with their original selectors,
    /// so a re-fold after session changes starts from pristine operands.
    fold_sites: Vec<FoldSite>,
    /// How many of `functions` have been scanned for fold sites.
    scanned_functions: usize,
}

#[derive(Clone, Copy)]
struct FoldSite {
    function: Value,
    pc: usize,
    selector: Selector,
    fast: bool,
}

/// The loaded program: classes, functions, constants, statics template,
/// dispatch tables and special objects, all in an immortal program space
/// addressed through dense index tables.
///
/// Read-only in the steady state; mutated only by the snapshot reader,
/// the folding pass, and debug-session changes applied while every
/// process is stopped.
pub struct Program {
    space: Mutex<Space>,
    pub immutable_heap: ImmutableHeap,
    pub settings: HeapSettings,
    pub names: Names,
    tables: UnsafeCell<Tables>,
    process_list: Mutex<Vec<NonNull<Process>>>,
    scheduler: RwLock<Option<Scheduler>>,
    print_interceptor:
        RwLock<Option<Box<dyn Fn(&str) + Send + Sync + 'static>>>,
    stdout_enabled: std::sync::atomic::AtomicBool,
    start: std::time::Instant,
}

// SAFETY: table mutation only happens while all processes are stopped;
// everything else is internally synchronized.
unsafe impl Send for Program {}
unsafe impl Sync for Program {}

impl Program {
    pub fn new(settings: HeapSettings) -> Self {
        let space_size = 4 << 20;
        Self {
            space: Mutex::new(Space::new(space_size)),
            immutable_heap: ImmutableHeap::new(&settings),
            settings,
            names: Names::new(),
            tables: UnsafeCell::new(Tables {
                classes: Value::from_smi(0),
                constants: Value::from_smi(0),
                static_methods: Value::from_smi(0),
                statics_template: Value::from_smi(0),
                dispatch_table: Value::from_smi(0),
                vtable: Value::from_smi(0),
                entry: Value::from_smi(0),
                main_arity: 0,
                specials: None,
                functions: Vec::new(),
                function_ranges: Vec::new(),
                fold_sites: Vec::new(),
                scanned_functions: 0,
            }),
            process_list: Mutex::new(Vec::new()),
            scheduler: RwLock::new(None),
            print_interceptor: RwLock::new(None),
            stdout_enabled: std::sync::atomic::AtomicBool::new(true),
            start: std::time::Instant::now(),
        }
    }

    /// Monotonic microseconds since program creation (the stopwatch
    /// natives).
    pub fn elapsed_micros(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }

    fn tables(&self) -> &Tables {
        // SAFETY: mutation is confined to load/fold/session windows during
        // which no reader runs.
        unsafe { &*self.tables.get() }
    }

    // ── Program space allocation ───────────────────────────────────

    fn allocate_raw(&self, size: usize) -> NonNull<u8> {
        self.space
            .lock()
            .allocate(object::align_size(size))
            .expect("program space exhausted")
    }

    pub fn space_includes(&self, address: u64) -> bool {
        self.space.lock().includes(address)
    }

    pub fn create_array(&self, length: usize, fill: Value) -> Value {
        let class = self.specials().array_class;
        let ptr = self.allocate_raw(Array::allocation_size(length));
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Array)).init(class, length, fill) };
        Value::from_ptr(ptr.as_ptr())
    }

    /// Arrays allocated before the class skeleton exists (the class table
    /// itself) get their class word patched later by the loader.
    pub(crate) fn create_array_with_class(
        &self,
        class: Value,
        length: usize,
        fill: Value,
    ) -> Value {
        let ptr = self.allocate_raw(Array::allocation_size(length));
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Array)).init(class, length, fill) };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn create_class(
        &self,
        meta: Value,
        format: InstanceFormat,
        superclass: Value,
        methods: Value,
        id: i64,
    ) -> Value {
        let ptr = self.allocate_raw(Class::SIZE);
        // SAFETY: freshly allocated with the right size.
        unsafe {
            (*(ptr.as_ptr() as *mut Class)).init(meta, format, superclass, methods, id)
        };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn create_function(
        &self,
        arity: usize,
        literals: &[Value],
        catch_ranges: &[CatchRange],
        code: &[u8],
    ) -> Value {
        let class = self.specials().function_class;
        self.create_function_with_class(class, arity, literals, catch_ranges, code)
    }

    pub(crate) fn create_function_with_class(
        &self,
        class: Value,
        arity: usize,
        literals: &[Value],
        catch_ranges: &[CatchRange],
        code: &[u8],
    ) -> Value {
        let size = Function::allocation_size(literals.len(), catch_ranges.len(), code.len());
        let ptr = self.allocate_raw(size);
        // SAFETY: freshly allocated with the right size.
        unsafe {
            (*(ptr.as_ptr() as *mut Function)).init(
                class,
                arity,
                literals,
                catch_ranges,
                code,
            )
        };
        let value = Value::from_ptr(ptr.as_ptr());
        // SAFETY: load window.
        unsafe { (*self.tables.get()).functions.push(value) };
        value
    }

    pub fn create_instance(
        &self,
        class: Value,
        flags: InstanceFlags,
        fill: Value,
    ) -> Value {
        // SAFETY: class is a live class.
        let fields = unsafe { class.as_ref::<Class>() }.format().instance_fields();
        let ptr = self.allocate_raw(Instance::allocation_size(fields));
        // SAFETY: freshly allocated with the right size.
        unsafe {
            (*(ptr.as_ptr() as *mut Instance)).init(class, flags, fields, fill)
        };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn create_string(&self, units: &[u16]) -> Value {
        let class = self.specials().string_class;
        let ptr = self.allocate_raw(VmString::allocation_size(units.len()));
        // SAFETY: freshly allocated with the right size.
        unsafe {
            let s = &mut *(ptr.as_ptr() as *mut VmString);
            s.init(class, units.len());
            s.code_units_mut().copy_from_slice(units);
        }
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn create_byte_array(&self, data: &[u8]) -> Value {
        let class = self.specials().byte_array_class;
        let ptr = self.allocate_raw(ByteArray::allocation_size(data.len()));
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut ByteArray)).init(class, data) };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn create_large_integer(&self, value: i64) -> Value {
        let class = self.specials().large_integer_class;
        let ptr = self.allocate_raw(LargeInteger::SIZE);
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut LargeInteger)).init(class, value) };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn create_double(&self, value: f64) -> Value {
        let class = self.specials().double_class;
        let ptr = self.allocate_raw(Double::SIZE);
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Double)).init(class, value) };
        Value::from_ptr(ptr.as_ptr())
    }

    pub fn create_initializer(&self, function: Value) -> Value {
        let class = self.specials().initializer_class;
        let ptr = self.allocate_raw(Initializer::SIZE);
        // SAFETY: freshly allocated with the right size.
        unsafe { (*(ptr.as_ptr() as *mut Initializer)).init(class, function) };
        Value::from_ptr(ptr.as_ptr())
    }

    // ── Table access ───────────────────────────────────────────────

    pub fn specials(&self) -> &Specials {
        self.tables().specials.as_ref().expect("program not loaded")
    }

    pub fn entry(&self) -> Value {
        self.tables().entry
    }

    pub fn main_arity(&self) -> usize {
        self.tables().main_arity
    }

    pub fn classes(&self) -> Value {
        self.tables().classes
    }

    pub fn class_count(&self) -> usize {
        // SAFETY: classes is an array after load.
        unsafe { self.tables().classes.as_ref::<Array>() }.len()
    }

    pub fn class_at(&self, index: usize) -> Value {
        // SAFETY: classes is an array after load; index checked by caller.
        unsafe { self.tables().classes.as_ref::<Array>().get_unchecked(index) }
    }

    pub fn constant_at(&self, index: usize) -> Value {
        // SAFETY: constants is an array after load.
        unsafe { self.tables().constants.as_ref::<Array>().get_unchecked(index) }
    }

    pub fn constants(&self) -> Value {
        self.tables().constants
    }

    pub fn static_method_at(&self, index: usize) -> Value {
        // SAFETY: static_methods is an array after load.
        unsafe {
            self.tables()
                .static_methods
                .as_ref::<Array>()
                .get_unchecked(index)
        }
    }

    pub fn static_methods(&self) -> Value {
        self.tables().static_methods
    }

    pub fn statics_template(&self) -> Value {
        self.tables().statics_template
    }

    pub fn dispatch_table(&self) -> Value {
        self.tables().dispatch_table
    }

    pub fn vtable(&self) -> Value {
        self.tables().vtable
    }

    pub fn functions(&self) -> &[Value] {
        &self.tables().functions
    }

    /// Install the special objects. Load-window only; some fields (the
    /// trampoline, the error objects) may be patched later in the load
    /// through [`Program::patch_specials`].
    pub(crate) fn install_specials(&self, specials: Specials) {
        // SAFETY: load window.
        let tables = unsafe { &mut *self.tables.get() };
        tables.specials = Some(specials);
    }

    /// # Safety
    ///
    /// Only during the load window.
    pub(crate) unsafe fn patch_specials(&self, f: impl FnOnce(&mut Specials)) {
        let tables = &mut *self.tables.get();
        f(tables.specials.as_mut().expect("specials installed"));
    }

    /// Install the loader's results. Load-window only.
    pub(crate) fn install_tables(
        &self,
        classes: Value,
        constants: Value,
        static_methods: Value,
        statics_template: Value,
        entry: Value,
        main_arity: usize,
    ) {
        // SAFETY: load window.
        let tables = unsafe { &mut *self.tables.get() };
        tables.classes = classes;
        tables.constants = constants;
        tables.static_methods = static_methods;
        tables.statics_template = statics_template;
        tables.entry = entry;
        tables.main_arity = main_arity;
    }

    /// Replace the statics template (session `change-statics`).
    ///
    /// # Safety
    ///
    /// Only while the program is stopped.
    pub unsafe fn replace_statics_template(&self, statics: Value) {
        (*self.tables.get()).statics_template = statics;
    }

    /// The class of a receiver value: smis dispatch through the program's
    /// smi class, failures never reach dispatch.
    #[inline]
    pub fn class_of(&self, receiver: Value) -> Value {
        if receiver.is_smi() {
            self.specials().smi_class
        } else {
            // SAFETY: non-smi receivers on the stack are valid objects.
            unsafe { receiver.as_ref::<HeapHeader>().class_value() }
        }
    }

    // ── Method lookup (slow path machinery) ────────────────────────

    /// Walk the class hierarchy for `selector`, honoring method-table
    /// overrides. Returns the target function.
    pub fn lookup_method(&self, class: Value, selector: Selector) -> Option<Value> {
        let mut current = class;
        let selector_smi = Value::from_smi(selector.raw() as i64);
        loop {
            // SAFETY: classes are live program objects.
            let class_ref = unsafe { current.as_ref::<Class>() };
            let methods = class_ref.methods();
            if methods.is_ref() {
                // SAFETY: methods is an array of (selector, function) pairs.
                let methods = unsafe { methods.as_ref::<Array>() };
                let mut i = 0;
                while i + 1 < methods.len() {
                    // SAFETY: in bounds.
                    let sel = unsafe { methods.get_unchecked(i) };
                    if sel == selector_smi {
                        // SAFETY: in bounds.
                        return Some(unsafe { methods.get_unchecked(i + 1) });
                    }
                    i += 2;
                }
            }
            let superclass = class_ref.superclass();
            if !superclass.is_ref() {
                return None;
            }
            current = superclass;
        }
    }

    // ── Folding ────────────────────────────────────────────────────

    /// Install dispatch tables: build the range segments behind every
    /// `invoke-*-fast` site, assign vtable offsets and fill the vtable,
    /// rewriting the affected bytecode operands in place. Also records
    /// the bytecode ranges used to resolve return addresses.
    ///
    /// Runs after load and again after a session commits method-table
    /// changes.
    pub fn fold(&self) {
        let _span = tracing::info_span!("program_fold").entered();
        // SAFETY: fold window, no process running.
        let tables = unsafe { &mut *self.tables.get() };

        tables.function_ranges.clear();
        for &function in &tables.functions {
            // SAFETY: functions are live program objects.
            let f = unsafe { function.as_ref::<Function>() };
            let start = unsafe { f.bytecode_address(0) } as u64;
            tables
                .function_ranges
                .push((start, start + f.bytecode_size() as u64, function));
        }
        tables.function_ranges.sort_by_key(|&(start, _, _)| start);

        // Record invoke sites for functions not scanned before. Later
        // folds reuse the recorded original selectors, so re-folding
        // after session changes never misreads a rewritten operand.
        let mut new_sites = Vec::new();
        for &function in &tables.functions[tables.scanned_functions..] {
            // SAFETY: live function.
            let f = unsafe { function.as_ref::<Function>() };
            // SAFETY: bytecode section is valid.
            let code = unsafe { f.bytecode() };
            scan_bytecode(code, |op, pc| {
                let fast = matches!(op.invoke_form(), Some(InvokeForm::Fast))
                    || op == Op::InvokeTestFast;
                let vtable =
                    matches!(op.invoke_form(), Some(InvokeForm::Vtable))
                        || op == Op::InvokeTestVtable;
                if fast || vtable {
                    let selector =
                        Selector::from_raw(read_i32(code, pc + 1) as u32);
                    new_sites.push(FoldSite { function, pc, selector, fast });
                }
            });
        }
        tables.fold_sites.extend(new_sites);
        tables.scanned_functions = tables.functions.len();

        let mut fast_selectors: Vec<Selector> = Vec::new();
        let mut vtable_selectors: Vec<Selector> = Vec::new();
        for site in &tables.fold_sites {
            let list = if site.fast {
                &mut fast_selectors
            } else {
                &mut vtable_selectors
            };
            if !list.contains(&site.selector) {
                list.push(site.selector);
            }
        }

        let dispatch = self.build_dispatch_table(&fast_selectors);
        let (vtable, offsets) = self.build_vtable(&vtable_selectors);

        // Rewrite operands: fast sites get their segment index, vtable
        // sites get the selector id replaced by the assigned offset.
        for site in &tables.fold_sites {
            // SAFETY: fold window; functions mutated in place.
            unsafe {
                let f = site.function.as_mut_ptr::<Function>();
                let code = core::slice::from_raw_parts_mut(
                    (*f).bytecode_address(0) as *mut u8,
                    (*f).bytecode_size(),
                );
                let operand = if site.fast {
                    dispatch.segments[&site.selector.raw()] as i32
                } else {
                    Selector::encode(
                        offsets[&site.selector.raw()],
                        site.selector.kind(),
                        site.selector.arity() as u8,
                    )
                    .raw() as i32
                };
                code[site.pc + 1..site.pc + 5]
                    .copy_from_slice(&operand.to_le_bytes());
            }
        }

        tables.dispatch_table = dispatch.table;
        tables.vtable = vtable;
    }

    fn build_dispatch_table(&self, selectors: &[Selector]) -> DispatchBuild {
        let class_count = self.class_count();
        let trampoline = self.specials().no_such_method_trampoline;

        let mut words: Vec<Value> = Vec::new();
        let mut segments = ahash::AHashMap::new();

        for &selector in selectors {
            let index = words.len();
            segments.insert(selector.raw(), index);
            // Segment header: arity, selector, two pad words.
            words.push(Value::from_smi(selector.arity() as i64));
            words.push(Value::from_smi(selector.raw() as i64));
            words.push(Value::from_smi(0));
            words.push(Value::from_smi(0));

            // Resolve each class id, then coalesce equal neighbors.
            let mut targets: Vec<Option<Value>> = Vec::with_capacity(class_count);
            for id in 0..class_count {
                targets.push(self.lookup_method(self.class_at(id), selector));
            }
            let mut id = 0;
            while id < class_count {
                match targets[id] {
                    Some(target) => {
                        let lower = id;
                        while id < class_count && targets[id] == Some(target) {
                            id += 1;
                        }
                        words.push(Value::from_smi(lower as i64));
                        words.push(Value::from_smi(id as i64));
                        words.push(self.specials().null_object);
                        words.push(target);
                    }
                    None => id += 1,
                }
            }
            // Catch-all row: absent classes route to the trampoline.
            words.push(Value::from_smi(0));
            words.push(Value::from_smi(ABSENT_UPPER));
            words.push(self.specials().null_object);
            words.push(trampoline);
        }

        let table = self.create_array(words.len(), self.specials().null_object);
        // SAFETY: fresh program array.
        let array = unsafe { table.as_mut_ptr::<Array>() };
        for (i, word) in words.into_iter().enumerate() {
            unsafe { (*array).set_unchecked(i, word) };
        }
        DispatchBuild { table, segments }
    }

    fn build_vtable(
        &self,
        selectors: &[Selector],
    ) -> (Value, ahash::AHashMap<u32, u32>) {
        let class_count = self.class_count();
        let null = self.specials().null_object;
        let trampoline = self.specials().no_such_method_trampoline;

        // Resolve implementers per selector.
        let mut rows: Vec<(Selector, Vec<(usize, Value)>)> = selectors
            .iter()
            .map(|&selector| {
                let mut implementers = Vec::new();
                for id in 0..class_count {
                    if let Some(target) =
                        self.lookup_method(self.class_at(id), selector)
                    {
                        implementers.push((id, target));
                    }
                }
                (selector, implementers)
            })
            .collect();
        // Pack densest rows first.
        rows.sort_by_key(|(_, implementers)| usize::MAX - implementers.len());

        // First-fit offset assignment; offset 0 is the trampoline entry.
        let mut used: ahash::AHashSet<usize> = ahash::AHashSet::new();
        let mut offsets: ahash::AHashMap<u32, u32> = ahash::AHashMap::new();
        let mut limit = 1;
        for (selector, implementers) in &rows {
            let mut offset = 1;
            loop {
                if implementers
                    .iter()
                    .all(|&(id, _)| !used.contains(&(id + offset)))
                {
                    break;
                }
                offset += 1;
            }
            offsets.insert(selector.raw(), offset as u32);
            for &(id, _) in implementers {
                used.insert(id + offset);
                limit = limit.max(id + offset + 1);
            }
        }

        let vtable = self.create_array(limit, null);
        // SAFETY: fresh program array.
        let vtable_array = unsafe { vtable.as_mut_ptr::<Array>() };

        // Entry 0: the shared miss entry. Its recorded offset can never
        // match a real one.
        let miss = self.make_vtable_entry(-1, Value::from_smi(0), trampoline);
        for i in 0..limit {
            unsafe { (*vtable_array).set_unchecked(i, miss) };
        }

        for (selector, implementers) in &rows {
            let offset = offsets[&selector.raw()] as i64;
            let selector_smi = Value::from_smi(selector.raw() as i64);
            for &(id, target) in implementers {
                let entry =
                    self.make_vtable_entry(offset, selector_smi, target);
                unsafe {
                    (*vtable_array).set_unchecked(id + offset as usize, entry)
                };
            }
        }
        (vtable, offsets)
    }

    fn make_vtable_entry(
        &self,
        recorded_offset: i64,
        selector: Value,
        target: Value,
    ) -> Value {
        let null = self.specials().null_object;
        let entry = self.create_array(4, null);
        // SAFETY: fresh program array.
        let array = unsafe { entry.as_mut_ptr::<Array>() };
        unsafe {
            (*array).set_unchecked(0, Value::from_smi(recorded_offset));
            (*array).set_unchecked(1, selector);
            (*array).set_unchecked(2, null);
            (*array).set_unchecked(3, target);
        }
        entry
    }

    /// A function's bytecode with folding undone: every rewritten invoke
    /// site carries its original selector again. The snapshot writer
    /// serializes this form so a re-load folds cleanly.
    pub fn unfolded_bytecode(&self, function: Value) -> Vec<u8> {
        // SAFETY: live function.
        let mut code = unsafe { function.as_ref::<Function>().bytecode() }.to_vec();
        for site in &self.tables().fold_sites {
            if site.function == function {
                code[site.pc + 1..site.pc + 5]
                    .copy_from_slice(&(site.selector.raw() as i32).to_le_bytes());
            }
        }
        code
    }

    /// Resolve a raw bytecode pointer back to its function.
    pub fn function_from_bcp(&self, bcp: *const u8) -> Option<Value> {
        let address = bcp as u64;
        let ranges = &self.tables().function_ranges;
        let index = ranges.partition_point(|&(start, _, _)| start <= address);
        if index == 0 {
            return None;
        }
        let (start, end, function) = ranges[index - 1];
        (address >= start && address <= end).then_some(function)
    }

    // ── Failure reification ────────────────────────────────────────

    /// Turn an interpreter failure into its user-visible error object.
    pub fn object_from_failure(&self, failure: Value) -> Value {
        debug_assert!(failure.is_failure());
        // SAFETY: checked.
        match unsafe { failure.failure_kind() } {
            object::FailureKind::WrongArgumentType => {
                self.specials().wrong_argument_type_error
            }
            object::FailureKind::IndexOutOfBounds => {
                self.specials().index_out_of_bounds_error
            }
            object::FailureKind::RetryAfterGc => {
                unreachable!("retry-after-gc is consumed by the gc path")
            }
        }
    }

    pub fn to_boolean(&self, value: bool) -> Value {
        if value {
            self.specials().true_object
        } else {
            self.specials().false_object
        }
    }

    /// Box an integer: smi when it fits, LargeInteger in program space
    /// otherwise (used by the loader; processes box into their heaps).
    pub fn to_integer(&self, value: i64) -> Value {
        if Value::fits_smi(value) {
            Value::from_smi(value)
        } else {
            self.create_large_integer(value)
        }
    }

    // ── Processes ──────────────────────────────────────────────────

    pub fn spawn_process(self: &std::sync::Arc<Self>) -> NonNull<Process> {
        let process = Box::new(Process::new(self.clone()));
        let ptr = NonNull::from(Box::leak(process));
        self.process_list.lock().push(ptr);
        ptr
    }

    /// Spawn the root process with a pending call of the program entry.
    pub fn spawn_process_for_main(self: &std::sync::Arc<Self>) -> NonNull<Process> {
        let process = self.spawn_process();
        // SAFETY: freshly spawned, not yet shared.
        unsafe {
            let p = &mut *process.as_ptr();
            p.setup_execution_stack();
            let entry = self.entry();
            let bcp = entry.as_ref::<Function>().bytecode_address(0);
            let stack = p.stack_mut();
            stack.set(0, Value::from_smi(self.main_arity() as i64));
            stack.set(1, Value::from_raw(0)); // terminating return address
            stack.set(2, Value::from_raw(bcp as u64));
            stack.set_top(2);
        }
        process
    }

    pub fn delete_process(&self, process: NonNull<Process>) {
        self.process_list.lock().retain(|&p| p != process);
        // SAFETY: removed from the list; nothing references it anymore.
        drop(unsafe { Box::from_raw(process.as_ptr()) });
    }

    pub fn process_count(&self) -> usize {
        self.process_list.lock().len()
    }

    /// Run `f` for every live process. The caller must guarantee the set
    /// is stable (stopped world or startup).
    pub fn each_process(&self, f: &mut dyn FnMut(&mut Process)) {
        let list = self.process_list.lock();
        for &ptr in list.iter() {
            // SAFETY: stopped world per contract.
            f(unsafe { &mut *ptr.as_ptr() });
        }
    }

    // ── Scheduler / console plumbing ───────────────────────────────

    pub fn set_scheduler(&self, scheduler: Option<Scheduler>) {
        *self.scheduler.write() = scheduler;
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        self.scheduler.read().clone()
    }

    pub fn set_print_interceptor(
        &self,
        interceptor: Option<Box<dyn Fn(&str) + Send + Sync + 'static>>,
    ) {
        *self.print_interceptor.write() = interceptor;
    }

    pub fn set_stdout_enabled(&self, enabled: bool) {
        self.stdout_enabled
            .store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    /// Print through the interceptor chain; stdout unless disabled.
    pub fn print(&self, text: &str) {
        if let Some(interceptor) = self.print_interceptor.read().as_ref() {
            interceptor(text);
            return;
        }
        if self.stdout_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            println!("{text}");
        }
    }

    // ── Immutable GC ───────────────────────────────────────────────

    /// Collect the immutable heap. Stop-the-world: every worker must be
    /// parked at the rendezvous.
    ///
    /// # Safety
    ///
    /// No mutator may run and no immutable-heap part may be outstanding.
    pub unsafe fn collect_immutable_garbage(&self) {
        let _span = tracing::info_span!("immutable_gc").entered();
        let list = self.process_list.lock();
        self.immutable_heap.scavenge(&mut |visit| {
            for &ptr in list.iter() {
                let process = &mut *ptr.as_ptr();
                process.visit_roots(visit);
                process.store_buffer.iterate_pointers(visit);
            }
        });
    }
}

struct DispatchBuild {
    table: Value,
    segments: ahash::AHashMap<u32, usize>,
}

/// Iterate opcodes of a function body, stopping at `MethodEnd`.
pub fn scan_bytecode(code: &[u8], mut f: impl FnMut(Op, usize)) {
    let mut pc = 0;
    while pc < code.len() {
        let op = Op::from_u8(code[pc]).expect("valid bytecode");
        if op == Op::MethodEnd {
            break;
        }
        f(op, pc);
        pc += op.length();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corelib::{install_core, set_main};
    use crate::snapshot::{materialize, Literal, ProgramBuilder};
    use bytecode::BytecodeWriter;
    use heap::HeapSettings;

    fn test_program() -> std::sync::Arc<Program> {
        let mut builder = ProgramBuilder::empty();
        let core = install_core(&mut builder);
        let main = {
            let mut w = BytecodeWriter::new();
            w.op(Op::LoadLiteral0);
            w.op_u8_u8(Op::Return, 1, 0);
            builder.add_function(crate::snapshot::FunctionDesc {
                arity: 0,
                literals: vec![Literal::Null],
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        set_main(&mut builder, main);
        materialize(&builder, HeapSettings::default()).expect("materialize")
    }

    #[test]
    fn class_of_smis_is_the_smi_class() {
        let program = test_program();
        assert_eq!(
            program.class_of(Value::from_smi(3)),
            program.specials().smi_class
        );
        let null = program.specials().null_object;
        assert_eq!(program.class_of(null), program.specials().null_class);
    }

    #[test]
    fn method_lookup_walks_the_hierarchy() {
        let program = test_program();
        let plus_id = program.names.lookup("+").expect("interned");
        let plus = Selector::method(plus_id, 1);
        let smi_class = program.specials().smi_class;

        // Defined directly on the smi class.
        assert!(program.lookup_method(smi_class, plus).is_some());
        // noSuchMethod is inherited from the root class.
        let nsm = Selector::method(crate::interning::NO_SUCH_METHOD_ID, 1);
        assert!(program.lookup_method(smi_class, nsm).is_some());
        // Unknown selectors miss everywhere.
        let bogus = Selector::method(9999, 1);
        assert!(program.lookup_method(smi_class, bogus).is_none());
    }

    #[test]
    fn primary_cache_agrees_with_slow_lookup() {
        let program = test_program();
        let mut cache = crate::lookup::LookupCache::new();
        let plus_id = program.names.lookup("+").expect("interned");
        let plus = Selector::method(plus_id, 1);
        let smi_class = program.specials().smi_class;

        let first = cache.lookup(&program, smi_class, plus);
        assert_eq!(first.tag, 1);
        assert_eq!(
            Some(first.target),
            program.lookup_method(smi_class, plus)
        );
        // The cached line answers the same.
        let second = cache.lookup(&program, smi_class, plus);
        assert_eq!(second.target, first.target);

        // Misses install the trampoline with tag zero.
        let bogus = Selector::method(4242, 0);
        let miss = cache.lookup(&program, smi_class, bogus);
        assert_eq!(miss.tag, 0);
        assert_eq!(miss.target, program.specials().no_such_method_trampoline);

        cache.clear();
        let after_clear = cache.lookup(&program, smi_class, plus);
        assert_eq!(after_clear.target, first.target);
    }

    #[test]
    fn function_ranges_resolve_bytecode_pointers() {
        let program = test_program();
        for &function in program.functions() {
            // SAFETY: live function.
            let f = unsafe { function.as_ref::<Function>() };
            let start = unsafe { f.bytecode_address(0) };
            let inside = unsafe { f.bytecode_address(f.bytecode_size() / 2) };
            assert_eq!(program.function_from_bcp(start), Some(function));
            assert_eq!(program.function_from_bcp(inside), Some(function));
        }
        assert_eq!(program.function_from_bcp(core::ptr::null()), None);
    }

    #[test]
    fn folding_builds_trampoline_backed_vtable() {
        let program = test_program();
        // Entry 0 of the vtable is the shared miss entry pointing at the
        // noSuchMethod trampoline with an unmatchable offset.
        // SAFETY: folded program arrays are live.
        unsafe {
            let vtable = program.vtable().as_ref::<Array>();
            assert!(!vtable.is_empty());
            let miss = vtable.get_unchecked(0).as_ref::<Array>();
            assert_eq!(miss.get_unchecked(0).to_smi(), -1);
            assert_eq!(
                miss.get_unchecked(3),
                program.specials().no_such_method_trampoline
            );
        }
    }

    #[test]
    fn method_swap_refold_updates_embedded_dispatch_tables() {
        let mut builder = ProgramBuilder::empty();
        let core = install_core(&mut builder);
        let f_selector = Selector::method(builder.intern("f"), 0);
        let class_a = builder.add_class(crate::snapshot::ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let old_target = {
            let mut w = BytecodeWriter::new();
            w.op(Op::LoadLiteral1);
            w.op_u8_u8(Op::Return, 1, 1);
            builder.add_function(crate::snapshot::FunctionDesc {
                arity: 1,
                literals: Vec::new(),
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        let new_target = {
            let mut w = BytecodeWriter::new();
            w.op_u8(Op::LoadLiteral, 2);
            w.op_u8_u8(Op::Return, 1, 1);
            builder.add_function(crate::snapshot::FunctionDesc {
                arity: 1,
                literals: Vec::new(),
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        builder.add_method(class_a, f_selector, old_target);
        let main = {
            let mut w = BytecodeWriter::new();
            w.op_i32(Op::LoadConstUnfold, 0);
            w.op_i32(Op::InvokeMethodFast, f_selector.raw() as i32);
            w.op_u8_u8(Op::Return, 1, 0);
            builder.add_function(crate::snapshot::FunctionDesc {
                arity: 0,
                literals: vec![Literal::Instance {
                    class: class_a,
                    immutable: false,
                    fields: Vec::new(),
                }],
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        set_main(&mut builder, main);
        let program =
            materialize(&builder, HeapSettings::default()).expect("load");

        let segment_target = |program: &Program| {
            // Read the fast site's segment and resolve class_a's row.
            let function = program.functions()[main];
            // SAFETY: live function and tables.
            unsafe {
                let code = function.as_ref::<Function>().bytecode();
                let index = read_i32(code, 5 + 1) as usize; // after LoadConstUnfold
                let table = program.dispatch_table().as_ref::<Array>();
                let mut offset = 4;
                loop {
                    let lower = table.get_unchecked(index + offset).to_smi();
                    let upper =
                        table.get_unchecked(index + offset + 1).to_smi();
                    if (class_a as i64) >= lower && (class_a as i64) < upper {
                        break table.get_unchecked(index + offset + 3);
                    }
                    offset += 4;
                }
            }
        };
        assert_eq!(segment_target(&program), program.functions()[old_target]);

        // Swap the method table the way a session commit does, then
        // re-fold: the embedded table must name the new target.
        let class_value = program.class_at(class_a);
        let table = program.create_array(2, program.specials().null_object);
        // SAFETY: fresh program array; stopped world.
        unsafe {
            let array = table.as_mut_ptr::<Array>();
            (*array).set_unchecked(
                0,
                Value::from_smi(f_selector.raw() as i64),
            );
            (*array).set_unchecked(1, program.functions()[new_target]);
            (*class_value.as_mut_ptr::<Class>()).set_methods(table);
        }
        program.fold();
        assert_eq!(segment_target(&program), program.functions()[new_target]);
        assert_eq!(
            program.lookup_method(class_value, f_selector),
            Some(program.functions()[new_target])
        );
    }

    #[test]
    fn unfolded_bytecode_restores_original_operands() {
        let mut builder = ProgramBuilder::empty();
        let core = install_core(&mut builder);
        let f_selector = Selector::method(builder.intern("f"), 0);
        let class_a = builder.add_class(crate::snapshot::ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let target = {
            let mut w = BytecodeWriter::new();
            w.op(Op::LoadLiteral1);
            w.op_u8_u8(Op::Return, 1, 1);
            builder.add_function(crate::snapshot::FunctionDesc {
                arity: 1,
                literals: Vec::new(),
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        builder.add_method(class_a, f_selector, target);
        let main = {
            let mut w = BytecodeWriter::new();
            w.op_i32(Op::LoadConstUnfold, 0);
            w.op_i32(Op::InvokeMethodFast, f_selector.raw() as i32);
            w.op_u8_u8(Op::Return, 1, 0);
            builder.add_function(crate::snapshot::FunctionDesc {
                arity: 0,
                literals: vec![Literal::Instance {
                    class: class_a,
                    immutable: false,
                    fields: Vec::new(),
                }],
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        let original_code = builder.functions[main].code.clone();
        set_main(&mut builder, main);
        let program =
            materialize(&builder, HeapSettings::default()).expect("load");

        let function = program.functions()[main];
        // Folding rewrote the fast operand in place...
        // SAFETY: live function.
        let folded = unsafe { function.as_ref::<Function>().bytecode() };
        assert_ne!(folded, &original_code[..]);
        // ...and the unfolded view restores the selector.
        assert_eq!(program.unfolded_bytecode(function), original_code);
    }
}
