use std::ptr::NonNull;

use object::{value_is_immutable, Value};
use parking_lot::Mutex;

use crate::space::{Scavenger, Space};
use crate::store_buffer::StoreBuffer;

/// Sizing knobs for the per-process and program-global heaps.
#[derive(Debug, Clone, Copy)]
pub struct HeapSettings {
    /// Size of each mutable semispace.
    pub semispace_size: usize,
    /// Size of each immutable-heap semispace (program global).
    pub immutable_size: usize,
    /// Size of the bump parts carved out for worker threads.
    pub immutable_part_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            semispace_size: 1 << 20,
            immutable_size: 8 << 20,
            immutable_part_size: 64 << 10,
        }
    }
}

/// A closure feeding every root slot of one heap to the collector.
pub type RootVisitor<'a> = dyn FnMut(&mut dyn FnMut(&mut Value)) + 'a;

// ── Process (mutable) heap ─────────────────────────────────────────

/// The two-semispace mutable heap owned by a single process.
pub struct ProcessHeap {
    to_space: Space,
    from_space: Space,
    gc_requested: bool,
}

impl ProcessHeap {
    pub fn new(settings: &HeapSettings) -> Self {
        Self {
            to_space: Space::new(settings.semispace_size),
            from_space: Space::new(settings.semispace_size),
            gc_requested: false,
        }
    }

    /// Ask for a collection at the next allocation boundary (the `_gc`
    /// native).
    pub fn request_gc(&mut self) {
        self.gc_requested = true;
    }

    /// Bump-allocate; `None` becomes *retry-after-gc* at the caller.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.to_space.allocate(size)
    }

    #[inline]
    pub fn includes(&self, address: u64) -> bool {
        self.to_space.includes(address)
    }

    pub fn used(&self) -> usize {
        self.to_space.used()
    }

    /// The allocation budget is three quarters of a semispace.
    pub fn needs_garbage_collection(&self) -> bool {
        self.gc_requested
            || self.to_space.used() * 4 > self.to_space.size() * 3
    }

    /// Scavenge the mutable heap.
    ///
    /// `roots` must feed every root slot of the owning process (stack,
    /// statics, coroutine chain, mailbox). The objects recorded in the
    /// store buffer are treated as additional roots, and the buffer is
    /// rebuilt with the surviving objects that still hold immutable-heap
    /// pointers. The caller re-inserts the current stack afterwards.
    ///
    /// # Safety
    ///
    /// Exclusive access to the process; all root slots and store-buffer
    /// entries must reference valid objects.
    pub unsafe fn scavenge(
        &mut self,
        roots: &mut RootVisitor,
        immutable_includes: &dyn Fn(u64) -> bool,
        store_buffer: &mut StoreBuffer,
    ) {
        self.gc_requested = false;
        core::mem::swap(&mut self.to_space, &mut self.from_space);
        self.to_space.reset();

        let mut rebuilt = StoreBuffer::new();
        {
            let mut scavenger = Scavenger::new(&self.from_space, &mut self.to_space);

            roots(&mut |slot| scavenger.visit_slot(slot));

            // Remembered objects are roots too: they are reachable from the
            // immutable heap's point of view even when the mutator dropped
            // its last direct reference this cycle.
            store_buffer.iterate_objects(&mut |obj| {
                let mut slot = Value::from_ptr(obj);
                scavenger.visit_slot(&mut slot);
            });

            scavenger.process_queue(&mut |obj| {
                if object_holds_immutable_pointer(obj, immutable_includes) {
                    rebuilt.insert(obj);
                }
            });
        }

        store_buffer.replace_after_gc(rebuilt);
        self.from_space.reset();
    }
}

/// Whether any pointer slot of `obj` refers into the immutable heap.
///
/// # Safety
///
/// `obj` must be a valid object with a live class word.
unsafe fn object_holds_immutable_pointer(
    obj: *mut u8,
    immutable_includes: &dyn Fn(u64) -> bool,
) -> bool {
    let mut found = false;
    object::visit_pointers(obj, &mut |slot| {
        if !found && slot.is_ref() && immutable_includes(slot.ref_bits()) {
            debug_assert!(value_is_immutable(*slot));
            found = true;
        }
    });
    found
}

// ── Immutable heap ─────────────────────────────────────────────────

/// A bump buffer carved from the immutable heap for one running process.
pub struct Part {
    top: u64,
    limit: u64,
    base: u64,
}

impl Part {
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(size % 8, 0);
        let result = self.top;
        let new_top = result + size as u64;
        if new_top > self.limit {
            return None;
        }
        self.top = new_top;
        // SAFETY: within the carved region.
        Some(unsafe { NonNull::new_unchecked(result as *mut u8) })
    }

    pub fn used(&self) -> usize {
        (self.top - self.base) as usize
    }

    pub fn capacity(&self) -> usize {
        (self.limit - self.base) as usize
    }
}

struct ImmutableSpaces {
    to_space: Space,
    from_space: Space,
}

/// The program-global heap for immutable objects.
///
/// Worker threads allocate through [`Part`]s so the steady state takes no
/// lock. Collection is a semispace scavenge run at a stop-the-world
/// rendezvous with roots drawn from every process.
pub struct ImmutableHeap {
    spaces: Mutex<ImmutableSpaces>,
    // Both semispace ranges, fixed at construction, so the write barrier
    // can test membership without the lock.
    ranges: [(u64, u64); 2],
    part_size: usize,
    size: usize,
}

impl ImmutableHeap {
    pub fn new(settings: &HeapSettings) -> Self {
        let to_space = Space::new(settings.immutable_size);
        let from_space = Space::new(settings.immutable_size);
        let ranges = [
            (to_space.base(), to_space.limit()),
            (from_space.base(), from_space.limit()),
        ];
        Self {
            spaces: Mutex::new(ImmutableSpaces { to_space, from_space }),
            ranges,
            part_size: settings.immutable_part_size,
            size: settings.immutable_size,
        }
    }

    /// Membership test for the write barrier. Covers both semispaces; the
    /// from-space is empty between collections, so the answer is precise
    /// whenever a mutator can ask.
    #[inline]
    pub fn includes(&self, address: u64) -> bool {
        self.ranges
            .iter()
            .any(|&(base, limit)| address >= base && address < limit)
    }

    /// Carve a fresh bump part. `None` means the heap is exhausted and a
    /// collection rendezvous is required.
    pub fn acquire_part(&self) -> Option<Part> {
        let mut spaces = self.spaces.lock();
        let ptr = spaces.to_space.allocate(self.part_size)?;
        let base = ptr.as_ptr() as u64;
        Some(Part { top: base, limit: base + self.part_size as u64, base })
    }

    /// Return a part. The unused tail is surrendered (the scavenger
    /// compacts). Returns true when the heap wants a collection.
    pub fn release_part(&self, part: Part) -> bool {
        drop(part);
        self.needs_garbage_collection()
    }

    /// Allocations larger than half a part bypass the part machinery.
    pub fn allocate_large(&self, size: usize) -> Option<NonNull<u8>> {
        self.spaces.lock().to_space.allocate(size)
    }

    pub fn large_threshold(&self) -> usize {
        self.part_size / 2
    }

    pub fn needs_garbage_collection(&self) -> bool {
        let spaces = self.spaces.lock();
        spaces.to_space.used() * 4 > self.size * 3
    }

    pub fn used(&self) -> usize {
        self.spaces.lock().to_space.used()
    }

    /// Scavenge the immutable heap.
    ///
    /// `roots` must feed every slot that can refer into this heap: the
    /// program's roots plus, for every process, its stacks, statics,
    /// coroutines, mailbox and store-buffer pointer sets.
    ///
    /// # Safety
    ///
    /// All workers must be at the rendezvous (no outstanding [`Part`]s,
    /// no mutator running).
    pub unsafe fn scavenge(&self, roots: &mut RootVisitor) {
        let mut spaces = self.spaces.lock();
        let spaces = &mut *spaces;
        core::mem::swap(&mut spaces.to_space, &mut spaces.from_space);
        spaces.to_space.reset();

        let mut scavenger = Scavenger::new(&spaces.from_space, &mut spaces.to_space);
        roots(&mut |slot| scavenger.visit_slot(slot));
        scavenger.process_queue(&mut |_| {});

        spaces.from_space.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Boxed, Class, InstanceFormat, WORD};

    fn settings() -> HeapSettings {
        HeapSettings {
            semispace_size: 64 << 10,
            immutable_size: 64 << 10,
            immutable_part_size: 8 << 10,
        }
    }

    fn make_class(buf: &mut Vec<u64>, format: InstanceFormat) -> Value {
        let offset = buf.len();
        buf.resize(offset + Class::SIZE / WORD, 0);
        let ptr = buf[offset..].as_mut_ptr() as *mut Class;
        let value = Value::from_ptr(ptr);
        unsafe {
            (*ptr).init(value, format, Value::from_smi(0), Value::from_smi(0), 0)
        };
        value
    }

    #[test]
    fn mutable_scavenge_rebuilds_store_buffer() {
        let mut class_buf = Vec::new();
        let boxed_class = make_class(&mut class_buf, InstanceFormat::boxed());

        let settings = settings();
        let mut heap = ProcessHeap::new(&settings);
        let immutable = ImmutableHeap::new(&settings);
        let mut part = immutable.acquire_part().expect("part");

        // An immutable cell and a mutable cell pointing at it.
        let imm_ptr = part.allocate(Boxed::SIZE).unwrap().as_ptr() as *mut Boxed;
        unsafe { (*imm_ptr).init(boxed_class, Value::from_smi(1)) };
        let imm_val = Value::from_ptr(imm_ptr);

        let mut_ptr =
            heap.allocate(Boxed::SIZE).unwrap().as_ptr() as *mut Boxed;
        unsafe { (*mut_ptr).init(boxed_class, imm_val) };
        let mut root = Value::from_ptr(mut_ptr);

        let mut store_buffer = StoreBuffer::new();
        store_buffer.insert(mut_ptr as *mut u8);

        unsafe {
            heap.scavenge(
                &mut |visit| visit(&mut root),
                &|addr| immutable.includes(addr),
                &mut store_buffer,
            );
        }

        // The cell moved; the rebuilt buffer records the new address.
        assert!(heap.includes(root.ref_bits()));
        let mut entries = Vec::new();
        store_buffer.iterate_objects(&mut |o| entries.push(o));
        assert_eq!(entries, vec![root.ref_bits() as *mut u8]);
        // And the immutable referent stayed put.
        let moved = unsafe { root.as_ref::<Boxed>() };
        assert_eq!(moved.value, imm_val);
    }

    #[test]
    fn immutable_parts_exhaust_and_scavenge_compacts() {
        let mut class_buf = Vec::new();
        let boxed_class = make_class(&mut class_buf, InstanceFormat::boxed());

        let settings = settings();
        let immutable = ImmutableHeap::new(&settings);

        // Exhaust the heap with parts.
        let mut parts = Vec::new();
        while let Some(part) = immutable.acquire_part() {
            parts.push(part);
        }
        assert!(immutable.acquire_part().is_none());
        assert!(immutable.needs_garbage_collection());

        // Keep one object alive in the first part; drop all parts.
        let live_ptr =
            parts[0].allocate(Boxed::SIZE).unwrap().as_ptr() as *mut Boxed;
        unsafe { (*live_ptr).init(boxed_class, Value::from_smi(9)) };
        let mut root = Value::from_ptr(live_ptr);
        parts.clear();

        unsafe {
            immutable.scavenge(&mut |visit| visit(&mut root));
        }
        assert!(immutable.includes(root.ref_bits()));
        assert_eq!(immutable.used(), Boxed::SIZE);
        assert!(immutable.acquire_part().is_some());
    }

    #[test]
    fn large_allocations_bypass_parts() {
        let settings = settings();
        let immutable = ImmutableHeap::new(&settings);
        let size = settings.immutable_part_size;
        assert!(size > immutable.large_threshold());
        assert!(immutable.allocate_large(size).is_some());
    }
}
