use crate::format::{InstanceFormat, TypeTag};
use crate::Value;

/// Round an allocation size up to word alignment.
#[inline(always)]
pub const fn align_size(size: usize) -> usize {
    (size + 7) & !7
}

pub const WORD: usize = core::mem::size_of::<Value>();

// ── Generic header view ────────────────────────────────────────────

/// Every heap object starts with a tagged class pointer. During scavenge
/// the word is replaced by a forwarding word (failure-tagged address);
/// during store-buffer deduplication its ref bit is borrowed as a mark.
#[repr(C)]
pub struct HeapHeader {
    class_word: Value,
}

const _: () = assert!(core::mem::size_of::<HeapHeader>() == 8);

impl HeapHeader {
    #[inline(always)]
    pub fn class_value(&self) -> Value {
        self.class_word
    }

    #[inline(always)]
    pub fn set_class_value(&mut self, class: Value) {
        self.class_word = class;
    }

    /// # Safety
    ///
    /// The class word must hold a live class pointer (not a forwarding word
    /// or a dedup mark).
    #[inline(always)]
    pub unsafe fn class(&self) -> &Class {
        self.class_word.as_ref::<Class>()
    }

    /// # Safety
    ///
    /// See [`HeapHeader::class`].
    #[inline(always)]
    pub unsafe fn format(&self) -> InstanceFormat {
        self.class().format()
    }

    // Forwarding support for the scavenger. A forwarded object's first word
    // holds the destination address with the failure tag.

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.class_word.is_failure()
    }

    #[inline(always)]
    pub fn forwarding_target(&self) -> u64 {
        debug_assert!(self.is_forwarded());
        self.class_word.raw() & !0b11
    }

    #[inline(always)]
    pub fn set_forwarding(&mut self, target: u64) {
        debug_assert_eq!(target & 0b11, 0);
        self.class_word = Value::from_raw(target | 0b11);
    }

    // Mark support for store-buffer deduplication. Clearing the ref bit
    // turns the class word into something smi-shaped; the buffer restores
    // it before anyone else looks.

    #[inline(always)]
    pub fn is_dedup_marked(&self) -> bool {
        !self.class_word.is_ref()
    }

    #[inline(always)]
    pub fn set_dedup_mark(&mut self) {
        debug_assert!(self.class_word.is_ref());
        self.class_word = Value::from_raw(self.class_word.raw() & !0b01);
    }

    #[inline(always)]
    pub fn clear_dedup_mark(&mut self) {
        debug_assert!(self.is_dedup_marked());
        self.class_word = Value::from_raw(self.class_word.raw() | 0b01);
    }
}

// ── Class ──────────────────────────────────────────────────────────

/// ```text
/// [class 8B] [format: smi] [superclass: ref|null] [methods: ref Array] [id: smi]
/// ```
///
/// `methods` is an array of `(selector smi, function)` pairs sorted by
/// selector. `id` is the dense class index used by the vtable and the
/// dispatch tables. Immutable after program folding.
#[repr(C)]
pub struct Class {
    pub header: HeapHeader,
    format: Value,
    superclass: Value,
    methods: Value,
    id: Value,
}

const _: () = assert!(core::mem::size_of::<Class>() == 5 * 8);

impl Class {
    pub const SIZE: usize = core::mem::size_of::<Class>();

    /// # Safety
    ///
    /// `self` must be freshly allocated with room for [`Class::SIZE`] bytes.
    pub unsafe fn init(
        &mut self,
        meta: Value,
        format: InstanceFormat,
        superclass: Value,
        methods: Value,
        id: i64,
    ) {
        self.header.set_class_value(meta);
        self.format = format.as_value();
        self.superclass = superclass;
        self.methods = methods;
        self.id = Value::from_smi(id);
    }

    #[inline(always)]
    pub fn format(&self) -> InstanceFormat {
        // SAFETY: written as a format smi at init.
        unsafe { InstanceFormat::from_value(self.format) }
    }

    #[inline(always)]
    pub fn superclass(&self) -> Value {
        self.superclass
    }

    #[inline(always)]
    pub fn methods(&self) -> Value {
        self.methods
    }

    pub fn set_methods(&mut self, methods: Value) {
        self.methods = methods;
    }

    pub fn set_superclass(&mut self, superclass: Value) {
        self.superclass = superclass;
    }

    #[inline(always)]
    pub fn id(&self) -> i64 {
        // SAFETY: written as a smi at init.
        unsafe { self.id.to_smi() }
    }

    pub fn set_id(&mut self, id: i64) {
        self.id = Value::from_smi(id);
    }

    pub(crate) fn field_refs(&mut self) -> [&mut Value; 3] {
        [&mut self.superclass, &mut self.methods, &mut self.id]
    }
}

// ── Function ───────────────────────────────────────────────────────

/// A try/catch range recorded at compile time.
///
/// Covers bytecode indices `start..end`; when a throw unwinds into a frame
/// whose pc lies in the range, execution resumes at `handler` with the
/// frame's value stack cut back to `frame_offset` slots (plus the pushed
/// exception).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CatchRange {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub frame_offset: u32,
}

const _: () = assert!(core::mem::size_of::<CatchRange>() == 16);

/// ```text
/// [class 8B] [arity: smi] [literal_count: smi] [bytecode_size: smi] [catch_count: smi]
/// [literal_0] ... [catch_range_0] ... [bytecode bytes, padded to 8]
/// ```
///
/// Immutable; lives in program space, so raw pointers into the bytecode
/// stay valid for the program's lifetime.
#[repr(C)]
pub struct Function {
    pub header: HeapHeader,
    arity: Value,
    literal_count: Value,
    bytecode_size: Value,
    catch_count: Value,
}

const _: () = assert!(core::mem::size_of::<Function>() == 5 * 8);

impl Function {
    pub fn allocation_size(
        literal_count: usize,
        catch_count: usize,
        bytecode_size: usize,
    ) -> usize {
        align_size(
            core::mem::size_of::<Function>()
                + literal_count * WORD
                + catch_count * core::mem::size_of::<CatchRange>()
                + bytecode_size,
        )
    }

    /// # Safety
    ///
    /// `self` must be freshly allocated with
    /// [`Function::allocation_size`] bytes; trailing sections are copied in.
    pub unsafe fn init(
        &mut self,
        class: Value,
        arity: usize,
        literals: &[Value],
        catch_ranges: &[CatchRange],
        bytecode: &[u8],
    ) {
        self.header.set_class_value(class);
        self.arity = Value::from_smi(arity as i64);
        self.literal_count = Value::from_smi(literals.len() as i64);
        self.bytecode_size = Value::from_smi(bytecode.len() as i64);
        self.catch_count = Value::from_smi(catch_ranges.len() as i64);

        let base = (self as *mut Function).add(1) as *mut u8;
        core::ptr::copy_nonoverlapping(
            literals.as_ptr(),
            base as *mut Value,
            literals.len(),
        );
        let ranges = base.add(literals.len() * WORD) as *mut CatchRange;
        core::ptr::copy_nonoverlapping(
            catch_ranges.as_ptr(),
            ranges,
            catch_ranges.len(),
        );
        let code = ranges.add(catch_ranges.len()) as *mut u8;
        core::ptr::copy_nonoverlapping(bytecode.as_ptr(), code, bytecode.len());
    }

    #[inline(always)]
    pub fn arity(&self) -> usize {
        // SAFETY: written as a smi at init.
        unsafe { self.arity.to_smi() as usize }
    }

    #[inline(always)]
    pub fn literal_count(&self) -> usize {
        // SAFETY: written as a smi at init.
        unsafe { self.literal_count.to_smi() as usize }
    }

    #[inline(always)]
    pub fn bytecode_size(&self) -> usize {
        // SAFETY: written as a smi at init.
        unsafe { self.bytecode_size.to_smi() as usize }
    }

    #[inline(always)]
    pub fn catch_count(&self) -> usize {
        // SAFETY: written as a smi at init.
        unsafe { self.catch_count.to_smi() as usize }
    }

    /// # Safety
    ///
    /// The trailing memory must be the sections written by `init`.
    #[inline(always)]
    pub unsafe fn literals(&self) -> &[Value] {
        let base = (self as *const Function).add(1) as *const Value;
        core::slice::from_raw_parts(base, self.literal_count())
    }

    /// # Safety
    ///
    /// See [`Function::literals`].
    pub unsafe fn literals_mut(&mut self) -> &mut [Value] {
        let base = (self as *mut Function).add(1) as *mut Value;
        core::slice::from_raw_parts_mut(base, self.literal_count())
    }

    /// # Safety
    ///
    /// See [`Function::literals`].
    #[inline(always)]
    pub unsafe fn catch_ranges(&self) -> &[CatchRange] {
        let base = (self as *const Function).add(1) as *const u8;
        let ranges = base.add(self.literal_count() * WORD) as *const CatchRange;
        core::slice::from_raw_parts(ranges, self.catch_count())
    }

    /// # Safety
    ///
    /// See [`Function::literals`].
    #[inline(always)]
    pub unsafe fn bytecode(&self) -> &[u8] {
        core::slice::from_raw_parts(
            self.bytecode_address(0),
            self.bytecode_size(),
        )
    }

    /// Raw pointer to the bytecode at `pc`. Valid for the program's
    /// lifetime; pushed on the stack as a return address.
    ///
    /// # Safety
    ///
    /// See [`Function::literals`]; `pc` must be within the function.
    #[inline(always)]
    pub unsafe fn bytecode_address(&self, pc: usize) -> *const u8 {
        let base = (self as *const Function).add(1) as *const u8;
        base.add(self.literal_count() * WORD)
            .add(self.catch_count() * core::mem::size_of::<CatchRange>())
            .add(pc)
    }

    pub fn byte_size(&self) -> usize {
        Self::allocation_size(
            self.literal_count(),
            self.catch_count(),
            self.bytecode_size(),
        )
    }
}

// ── Array / ByteArray / String ─────────────────────────────────────

/// ```text
/// [class 8B] [length: smi] [slot_0] [slot_1] ...
/// ```
#[repr(C)]
pub struct Array {
    pub header: HeapHeader,
    length: Value,
}

const _: () = assert!(core::mem::size_of::<Array>() == 16);

impl Array {
    pub fn allocation_size(length: usize) -> usize {
        core::mem::size_of::<Array>() + length * WORD
    }

    /// # Safety
    ///
    /// `self` must be freshly allocated with room for `length` slots, all
    /// of which are initialized to `fill`.
    pub unsafe fn init(&mut self, class: Value, length: usize, fill: Value) {
        self.header.set_class_value(class);
        self.length = Value::from_smi(length as i64);
        let base = (self as *mut Array).add(1) as *mut Value;
        for i in 0..length {
            base.add(i).write(fill);
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        // SAFETY: written as a smi at init.
        unsafe { self.length.to_smi() as usize }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// The trailing memory must contain `len()` initialized slots.
    #[inline(always)]
    pub unsafe fn slots(&self) -> &[Value] {
        let base = (self as *const Array).add(1) as *const Value;
        core::slice::from_raw_parts(base, self.len())
    }

    /// # Safety
    ///
    /// See [`Array::slots`].
    #[inline(always)]
    pub unsafe fn slots_mut(&mut self) -> &mut [Value] {
        let base = (self as *mut Array).add(1) as *mut Value;
        core::slice::from_raw_parts_mut(base, self.len())
    }

    /// # Safety
    ///
    /// `index < len()`.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, index: usize) -> Value {
        debug_assert!(index < self.len());
        let base = (self as *const Array).add(1) as *const Value;
        base.add(index).read()
    }

    /// # Safety
    ///
    /// `index < len()`.
    #[inline(always)]
    pub unsafe fn set_unchecked(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.len());
        let base = (self as *mut Array).add(1) as *mut Value;
        base.add(index).write(value);
    }
}

/// ```text
/// [class 8B] [length: smi] [byte_0] [byte_1] ... (padded to 8)
/// ```
#[repr(C)]
pub struct ByteArray {
    pub header: HeapHeader,
    length: Value,
}

const _: () = assert!(core::mem::size_of::<ByteArray>() == 16);

impl ByteArray {
    pub fn allocation_size(length: usize) -> usize {
        align_size(core::mem::size_of::<ByteArray>() + length)
    }

    /// # Safety
    ///
    /// `self` must be freshly allocated with room for `data.len()` bytes.
    pub unsafe fn init(&mut self, class: Value, data: &[u8]) {
        self.header.set_class_value(class);
        self.length = Value::from_smi(data.len() as i64);
        let base = (self as *mut ByteArray).add(1) as *mut u8;
        core::ptr::copy_nonoverlapping(data.as_ptr(), base, data.len());
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        // SAFETY: written as a smi at init.
        unsafe { self.length.to_smi() as usize }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// The trailing memory must contain `len()` bytes.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        let base = (self as *const ByteArray).add(1) as *const u8;
        core::slice::from_raw_parts(base, self.len())
    }

    /// # Safety
    ///
    /// See [`ByteArray::bytes`].
    #[inline(always)]
    pub unsafe fn bytes_mut(&mut self) -> &mut [u8] {
        let base = (self as *mut ByteArray).add(1) as *mut u8;
        core::slice::from_raw_parts_mut(base, self.len())
    }
}

/// ```text
/// [class 8B] [length: smi] [unit_0: u16] [unit_1: u16] ... (padded to 8)
/// ```
///
/// UTF-16 code units. Effectively immutable after creation; allocated in
/// the immutable heap.
#[repr(C)]
pub struct VmString {
    pub header: HeapHeader,
    length: Value,
}

const _: () = assert!(core::mem::size_of::<VmString>() == 16);

impl VmString {
    pub fn allocation_size(units: usize) -> usize {
        align_size(core::mem::size_of::<VmString>() + units * 2)
    }

    /// # Safety
    ///
    /// `self` must be freshly allocated with room for `units` code units,
    /// which are zeroed.
    pub unsafe fn init(&mut self, class: Value, units: usize) {
        self.header.set_class_value(class);
        self.length = Value::from_smi(units as i64);
        let base = (self as *mut VmString).add(1) as *mut u16;
        core::ptr::write_bytes(base, 0, units);
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        // SAFETY: written as a smi at init.
        unsafe { self.length.to_smi() as usize }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// The trailing memory must contain `len()` code units.
    #[inline(always)]
    pub unsafe fn code_units(&self) -> &[u16] {
        let base = (self as *const VmString).add(1) as *const u16;
        core::slice::from_raw_parts(base, self.len())
    }

    /// # Safety
    ///
    /// See [`VmString::code_units`].
    #[inline(always)]
    pub unsafe fn code_units_mut(&mut self) -> &mut [u16] {
        let base = (self as *mut VmString).add(1) as *mut u16;
        core::slice::from_raw_parts_mut(base, self.len())
    }

    /// Lossy conversion for diagnostics and the debug session.
    ///
    /// # Safety
    ///
    /// See [`VmString::code_units`].
    pub unsafe fn to_rust_string(&self) -> String {
        String::from_utf16_lossy(self.code_units())
    }
}

// ── Instance ───────────────────────────────────────────────────────

bitflags::bitflags! {
    /// Per-instance flag bits, stored as a smi in the flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstanceFlags: u64 {
        /// Runtime immutability: all field values are themselves immutable.
        const IMMUTABLE = 1 << 0;
    }
}

/// ```text
/// [class 8B] [flags: smi] [field_0] [field_1] ...
/// ```
///
/// The field count comes from the class format.
#[repr(C)]
pub struct Instance {
    pub header: HeapHeader,
    flags: Value,
}

const _: () = assert!(core::mem::size_of::<Instance>() == 16);

impl Instance {
    pub fn allocation_size(fields: usize) -> usize {
        core::mem::size_of::<Instance>() + fields * WORD
    }

    /// # Safety
    ///
    /// `self` must be freshly allocated with room for `fields` slots, all
    /// of which are initialized to `fill`.
    pub unsafe fn init(
        &mut self,
        class: Value,
        flags: InstanceFlags,
        fields: usize,
        fill: Value,
    ) {
        self.header.set_class_value(class);
        self.flags = Value::from_smi(flags.bits() as i64);
        let base = (self as *mut Instance).add(1) as *mut Value;
        for i in 0..fields {
            base.add(i).write(fill);
        }
    }

    #[inline(always)]
    pub fn flags(&self) -> InstanceFlags {
        // SAFETY: written as a smi at init.
        InstanceFlags::from_bits_truncate(unsafe { self.flags.to_smi() } as u64)
    }

    #[inline(always)]
    pub fn is_immutable(&self) -> bool {
        self.flags().contains(InstanceFlags::IMMUTABLE)
    }

    /// Field count, read through the class format.
    ///
    /// # Safety
    ///
    /// The class word must hold a live class pointer.
    #[inline(always)]
    pub unsafe fn field_count(&self) -> usize {
        self.header.format().instance_fields()
    }

    /// # Safety
    ///
    /// `index` must be a valid field index for this instance's class.
    #[inline(always)]
    pub unsafe fn field(&self, index: usize) -> Value {
        let base = (self as *const Instance).add(1) as *const Value;
        base.add(index).read()
    }

    /// # Safety
    ///
    /// See [`Instance::field`].
    #[inline(always)]
    pub unsafe fn set_field(&mut self, index: usize, value: Value) {
        let base = (self as *mut Instance).add(1) as *mut Value;
        base.add(index).write(value);
    }

    /// # Safety
    ///
    /// The class word must hold a live class pointer.
    #[inline(always)]
    pub unsafe fn fields(&self) -> &[Value] {
        let base = (self as *const Instance).add(1) as *const Value;
        core::slice::from_raw_parts(base, self.field_count())
    }
}

// ── Boxed ──────────────────────────────────────────────────────────

/// A single mutable cell, used for captured variables.
///
/// ```text
/// [class 8B] [value 8B]
/// ```
#[repr(C)]
pub struct Boxed {
    pub header: HeapHeader,
    pub value: Value,
}

const _: () = assert!(core::mem::size_of::<Boxed>() == 16);

impl Boxed {
    pub const SIZE: usize = core::mem::size_of::<Boxed>();

    /// # Safety
    ///
    /// `self` must be freshly allocated with [`Boxed::SIZE`] bytes.
    pub unsafe fn init(&mut self, class: Value, value: Value) {
        self.header.set_class_value(class);
        self.value = value;
    }
}

// ── Stack ──────────────────────────────────────────────────────────

/// An execution stack owned by a coroutine.
///
/// ```text
/// [class 8B] [top: smi] [length: smi] [slot_0] [slot_1] ...
/// ```
///
/// `top` is the index of the topmost live slot; slots above it are
/// untyped scratch and never scanned. Live slots may contain raw return
/// addresses into program-space bytecode, which the collectors filter by
/// address range.
#[repr(C)]
pub struct Stack {
    pub header: HeapHeader,
    top: Value,
    length: Value,
}

const _: () = assert!(core::mem::size_of::<Stack>() == 24);

impl Stack {
    pub fn allocation_size(length: usize) -> usize {
        core::mem::size_of::<Stack>() + length * WORD
    }

    /// # Safety
    ///
    /// `self` must be freshly allocated with room for `length` slots.
    pub unsafe fn init(&mut self, class: Value, length: usize) {
        self.header.set_class_value(class);
        self.top = Value::from_smi(0);
        self.length = Value::from_smi(length as i64);
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        // SAFETY: written as a smi.
        unsafe { self.top.to_smi() as usize }
    }

    #[inline(always)]
    pub fn set_top(&mut self, top: usize) {
        debug_assert!(top < self.len());
        self.top = Value::from_smi(top as i64);
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        // SAFETY: written as a smi at init.
        unsafe { self.length.to_smi() as usize }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.top() == 0
    }

    /// # Safety
    ///
    /// `index < len()`.
    #[inline(always)]
    pub unsafe fn get(&self, index: usize) -> Value {
        debug_assert!(index < self.len());
        let base = (self as *const Stack).add(1) as *const Value;
        base.add(index).read()
    }

    /// # Safety
    ///
    /// `index < len()`.
    #[inline(always)]
    pub unsafe fn set(&mut self, index: usize, value: Value) {
        debug_assert!(index < self.len());
        let base = (self as *mut Stack).add(1) as *mut Value;
        base.add(index).write(value);
    }

    /// Raw pointer to slot `index`, for the interpreter's stack-pointer
    /// register.
    ///
    /// # Safety
    ///
    /// `index < len()`.
    #[inline(always)]
    pub unsafe fn slot_pointer(&self, index: usize) -> *mut Value {
        let base = (self as *const Stack).add(1) as *mut Value;
        base.add(index)
    }

    /// The live slots `0..=top`.
    ///
    /// # Safety
    ///
    /// The trailing memory must contain `len()` slots.
    #[inline(always)]
    pub unsafe fn live_slots_mut(&mut self) -> &mut [Value] {
        let base = (self as *mut Stack).add(1) as *mut Value;
        core::slice::from_raw_parts_mut(base, self.top() + 1)
    }
}

// ── Coroutine ──────────────────────────────────────────────────────

/// ```text
/// [class 8B] [flags: smi] [stack: ref|null] [caller: ref|self|null]
/// ```
///
/// `caller == self` marks a terminated coroutine whose stack has been
/// released.
#[repr(C)]
pub struct Coroutine {
    pub header: HeapHeader,
    flags: Value,
    pub stack: Value,
    pub caller: Value,
}

const _: () = assert!(core::mem::size_of::<Coroutine>() == 32);

impl Coroutine {
    pub const SIZE: usize = core::mem::size_of::<Coroutine>();

    /// # Safety
    ///
    /// `self` must be freshly allocated with [`Coroutine::SIZE`] bytes.
    pub unsafe fn init(&mut self, class: Value, stack: Value, caller: Value) {
        self.header.set_class_value(class);
        self.flags = Value::from_smi(0);
        self.stack = stack;
        self.caller = caller;
    }

    /// Whether this coroutine has terminated (`caller == self`).
    #[inline(always)]
    pub fn is_done(&self, self_value: Value) -> bool {
        self.caller == self_value
    }
}

// ── LargeInteger / Double ──────────────────────────────────────────

/// A boxed 64-bit integer outside the smi range. Immutable.
#[repr(C)]
pub struct LargeInteger {
    pub header: HeapHeader,
    value: i64,
}

const _: () = assert!(core::mem::size_of::<LargeInteger>() == 16);

impl LargeInteger {
    pub const SIZE: usize = core::mem::size_of::<LargeInteger>();

    /// # Safety
    ///
    /// `self` must be freshly allocated with [`LargeInteger::SIZE`] bytes.
    pub unsafe fn init(&mut self, class: Value, value: i64) {
        self.header.set_class_value(class);
        self.value = value;
    }

    #[inline(always)]
    pub fn value(&self) -> i64 {
        self.value
    }
}

/// A boxed IEEE double. Immutable.
#[repr(C)]
pub struct Double {
    pub header: HeapHeader,
    value: f64,
}

const _: () = assert!(core::mem::size_of::<Double>() == 16);

impl Double {
    pub const SIZE: usize = core::mem::size_of::<Double>();

    /// # Safety
    ///
    /// `self` must be freshly allocated with [`Double::SIZE`] bytes.
    pub unsafe fn init(&mut self, class: Value, value: f64) {
        self.header.set_class_value(class);
        self.value = value;
    }

    #[inline(always)]
    pub fn value(&self) -> f64 {
        self.value
    }
}

// ── Initializer ────────────────────────────────────────────────────

/// A lazy static initializer: the statics array holds one of these until
/// `load-static-init` runs the function and replaces the slot.
#[repr(C)]
pub struct Initializer {
    pub header: HeapHeader,
    pub function: Value,
}

const _: () = assert!(core::mem::size_of::<Initializer>() == 16);

impl Initializer {
    pub const SIZE: usize = core::mem::size_of::<Initializer>();

    /// # Safety
    ///
    /// `self` must be freshly allocated with [`Initializer::SIZE`] bytes.
    pub unsafe fn init(&mut self, class: Value, function: Value) {
        self.header.set_class_value(class);
        self.function = function;
    }
}

// ── Immutability ───────────────────────────────────────────────────

/// Whether `value` is immutable: smis and failure sentinels trivially,
/// heap objects by format (strings, doubles, large integers, functions,
/// classes, initializers) or by the per-instance flag.
///
/// # Safety
///
/// If `value` is a ref it must point to a live object with a valid class
/// word.
pub unsafe fn value_is_immutable(value: Value) -> bool {
    if !value.is_ref() {
        return true;
    }
    let header = value.as_ref::<HeapHeader>();
    let format = header.format();
    if format.is_immutable() {
        return true;
    }
    match format.type_tag() {
        TypeTag::Instance => value.as_ref::<Instance>().is_immutable(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::InstanceFormat;

    // Build a standalone class in a word-aligned buffer; enough for
    // layout-level tests that never touch a real heap.
    fn make_class(buf: &mut Vec<u64>, format: InstanceFormat, id: i64) -> Value {
        let offset = buf.len();
        buf.resize(offset + Class::SIZE / WORD, 0);
        let ptr = buf[offset..].as_mut_ptr() as *mut Class;
        let value = Value::from_ptr(ptr);
        unsafe {
            (*ptr).init(value, format, Value::from_smi(0), Value::from_smi(0), id)
        };
        value
    }

    #[test]
    fn class_round_trips_format_and_id() {
        let mut buf = Vec::new();
        let class = make_class(&mut buf, InstanceFormat::instance(2), 7);
        let c = unsafe { class.as_ref::<Class>() };
        assert_eq!(c.format().instance_fields(), 2);
        assert_eq!(c.id(), 7);
    }

    #[test]
    fn forwarding_word_round_trips() {
        let mut buf = Vec::new();
        let class = make_class(&mut buf, InstanceFormat::boxed(), 0);
        let mut storage = [0u64; 2];
        let boxed = storage.as_mut_ptr() as *mut Boxed;
        unsafe { (*boxed).init(class, Value::from_smi(3)) };

        let header = unsafe { &mut (*boxed).header };
        assert!(!header.is_forwarded());
        header.set_forwarding(0x1000);
        assert!(header.is_forwarded());
        assert_eq!(header.forwarding_target(), 0x1000);
    }

    #[test]
    fn dedup_mark_borrows_and_restores_class_word() {
        let mut buf = Vec::new();
        let class = make_class(&mut buf, InstanceFormat::boxed(), 0);
        let mut storage = [0u64; 2];
        let boxed = storage.as_mut_ptr() as *mut Boxed;
        unsafe { (*boxed).init(class, Value::from_smi(3)) };

        let header = unsafe { &mut (*boxed).header };
        let original = header.class_value();
        assert!(!header.is_dedup_marked());
        header.set_dedup_mark();
        assert!(header.is_dedup_marked());
        header.clear_dedup_mark();
        assert_eq!(header.class_value(), original);
    }

    #[test]
    fn function_sections_are_addressable() {
        let mut buf = Vec::new();
        let class = make_class(&mut buf, InstanceFormat::function(), 0);

        let literals = [Value::from_smi(10), Value::from_smi(20)];
        let ranges = [CatchRange { start: 2, end: 9, handler: 12, frame_offset: 1 }];
        let code = [1u8, 2, 3, 4, 5];

        let size = Function::allocation_size(literals.len(), ranges.len(), code.len());
        let mut storage = vec![0u64; size / WORD];
        let f = storage.as_mut_ptr() as *mut Function;
        unsafe { (*f).init(class, 2, &literals, &ranges, &code) };

        let f = unsafe { &*f };
        assert_eq!(f.arity(), 2);
        assert_eq!(unsafe { f.literals() }, &literals);
        assert_eq!(unsafe { f.catch_ranges() }, &ranges);
        assert_eq!(unsafe { f.bytecode() }, &code);
        assert_eq!(unsafe { *f.bytecode_address(3) }, 4);
        assert_eq!(f.byte_size(), size);
    }

    #[test]
    fn instance_immutability_flag() {
        let mut buf = Vec::new();
        let class = make_class(&mut buf, InstanceFormat::instance(1), 1);

        let size = Instance::allocation_size(1);
        let mut storage = vec![0u64; size / WORD];
        let i = storage.as_mut_ptr() as *mut Instance;
        unsafe {
            (*i).init(class, InstanceFlags::IMMUTABLE, 1, Value::from_smi(0))
        };
        let inst = unsafe { &*i };
        assert!(inst.is_immutable());
        assert!(unsafe { value_is_immutable(Value::from_ptr(i)) });

        let mut storage2 = vec![0u64; size / WORD];
        let j = storage2.as_mut_ptr() as *mut Instance;
        unsafe {
            (*j).init(class, InstanceFlags::empty(), 1, Value::from_smi(0))
        };
        assert!(!unsafe { value_is_immutable(Value::from_ptr(j)) });
    }

    #[test]
    fn stack_top_discipline() {
        let mut buf = Vec::new();
        let class = make_class(&mut buf, InstanceFormat::stack(), 2);

        let size = Stack::allocation_size(8);
        let mut storage = vec![0u64; size / WORD];
        let s = storage.as_mut_ptr() as *mut Stack;
        unsafe { (*s).init(class, 8) };
        let stack = unsafe { &mut *s };
        assert_eq!(stack.len(), 8);
        unsafe { stack.set(3, Value::from_smi(99)) };
        stack.set_top(3);
        assert_eq!(stack.top(), 3);
        assert_eq!(unsafe { stack.get(3).to_smi() }, 99);
    }
}
