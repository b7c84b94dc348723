use std::ptr::NonNull;

use object::{object_size, visit_pointers, HeapHeader, Value};

use crate::system::{map_memory, unmap_memory, OS_PAGE_SIZE};

/// A bump-allocated region backed by one mmap'd chunk.
///
/// Objects are laid out back to back starting at `base`; `top` is the
/// allocation frontier. A space in the from role keeps its mapping until
/// the scavenge that empties it completes.
pub struct Space {
    base: NonNull<u8>,
    limit: u64,
    top: u64,
    size: usize,
}

// SAFETY: a space is only touched by its owning process, or by a single
// worker during a stop-the-world collection.
unsafe impl Send for Space {}

impl Space {
    pub fn new(size: usize) -> Self {
        let size = (size + OS_PAGE_SIZE - 1) & !(OS_PAGE_SIZE - 1);
        let base = map_memory(size).expect("space mapping");
        let base_addr = base.as_ptr() as u64;
        Self {
            base,
            limit: base_addr + size as u64,
            top: base_addr,
            size,
        }
    }

    #[inline(always)]
    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    #[inline(always)]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[inline(always)]
    pub fn top(&self) -> u64 {
        self.top
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        (self.top - self.base()) as usize
    }

    #[inline(always)]
    pub fn includes(&self, address: u64) -> bool {
        address >= self.base() && address < self.limit
    }

    /// Bump-allocate `size` bytes (word-aligned). `None` means exhausted;
    /// the caller turns that into a *retry-after-gc* failure.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(size % 8, 0);
        let result = self.top;
        let new_top = result + size as u64;
        if new_top > self.limit {
            return None;
        }
        self.top = new_top;
        // SAFETY: within the mapping.
        Some(unsafe { NonNull::new_unchecked(result as *mut u8) })
    }

    /// Forget all objects. The memory stays mapped (and dirty); fine for
    /// a from-space about to be reused.
    pub fn reset(&mut self) {
        self.top = self.base();
    }

    /// Walk all objects currently in the space.
    ///
    /// # Safety
    ///
    /// Every object in `base..top` must be valid with a live class word.
    pub unsafe fn iterate_objects(&self, f: &mut dyn FnMut(*mut u8)) {
        let mut current = self.base();
        while current < self.top {
            let obj = current as *mut u8;
            let size = object_size(obj);
            f(obj);
            current += size as u64;
        }
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        // SAFETY: we own the mapping.
        unsafe { unmap_memory(self.base, self.size) };
    }
}

/// Cheney-style copying collector over a from/to space pair.
///
/// `visit_slot` copies the referent on first sight, installing a
/// forwarding word over the old class word; `process_queue` completes the
/// transitive closure by scanning to-space linearly.
pub struct Scavenger<'a> {
    from: &'a Space,
    to: &'a mut Space,
    scan: u64,
}

impl<'a> Scavenger<'a> {
    pub fn new(from: &'a Space, to: &'a mut Space) -> Self {
        let scan = to.top();
        Self { from, to, scan }
    }

    /// Copy-or-forward one slot. Slots that are not refs into from-space
    /// are left alone, which also filters raw return addresses and
    /// pointers into program or immutable space.
    pub fn visit_slot(&mut self, slot: &mut Value) {
        let value = *slot;
        if !value.is_ref() {
            return;
        }
        let address = value.ref_bits();
        if !self.from.includes(address) {
            return;
        }
        // SAFETY: from-space objects are valid until the space is reset.
        unsafe {
            let header = &mut *(address as *mut HeapHeader);
            if header.is_forwarded() {
                *slot = Value::from_raw(header.forwarding_target() | 0b01);
                return;
            }
            let size = object_size(address as *const u8);
            let target = self
                .to
                .allocate(size)
                .expect("to-space exhausted during scavenge");
            core::ptr::copy_nonoverlapping(
                address as *const u8,
                target.as_ptr(),
                size,
            );
            let target_addr = target.as_ptr() as u64;
            header.set_forwarding(target_addr);
            *slot = Value::from_raw(target_addr | 0b01);
        }
    }

    /// Drain the scan queue. `each` runs on every copied object after its
    /// edges were processed; the mutable-heap collector uses it to rebuild
    /// the store buffer.
    ///
    /// # Safety
    ///
    /// Must only run after the roots were fed through [`visit_slot`].
    pub unsafe fn process_queue(&mut self, each: &mut dyn FnMut(*mut u8)) {
        while self.scan < self.to.top() {
            let obj = self.scan as *mut u8;
            let size = object_size(obj);
            // Raw re-borrow: visit_slot only touches from-space and the
            // allocation frontier, never the object being scanned.
            let this = self as *mut Self;
            visit_pointers(obj, &mut |slot| (*this).visit_slot(slot));
            each(obj);
            self.scan += size as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Array, Boxed, Class, InstanceFormat, WORD};

    // Leaked fixed storage: class addresses must stay stable for the
    // duration of the test.
    fn make_class(format: InstanceFormat) -> Value {
        let storage = Box::leak(Box::new([0u64; Class::SIZE / WORD]));
        let ptr = storage.as_mut_ptr() as *mut Class;
        let value = Value::from_ptr(ptr);
        unsafe {
            (*ptr).init(value, format, Value::from_smi(0), Value::from_smi(0), 0)
        };
        value
    }

    #[test]
    fn bump_allocation_and_exhaustion() {
        let mut space = Space::new(OS_PAGE_SIZE);
        let mut count = 0;
        while space.allocate(64).is_some() {
            count += 1;
        }
        assert_eq!(count, OS_PAGE_SIZE / 64);
        space.reset();
        assert!(space.allocate(64).is_some());
    }

    #[test]
    fn scavenge_copies_live_graph_and_forwards_shared_objects() {
        let boxed_class = make_class(InstanceFormat::boxed());
        let array_class = make_class(InstanceFormat::array());

        let mut from = Space::new(OS_PAGE_SIZE);
        let mut to = Space::new(OS_PAGE_SIZE);

        // boxed <- array[0], array[1] (shared), dead boxed object
        let boxed_ptr = from.allocate(Boxed::SIZE).unwrap().as_ptr() as *mut Boxed;
        unsafe { (*boxed_ptr).init(boxed_class, Value::from_smi(7)) };
        let boxed_val = Value::from_ptr(boxed_ptr);

        let dead_ptr = from.allocate(Boxed::SIZE).unwrap().as_ptr() as *mut Boxed;
        unsafe { (*dead_ptr).init(boxed_class, Value::from_smi(13)) };

        let array_size = Array::allocation_size(2);
        let array_ptr = from.allocate(array_size).unwrap().as_ptr() as *mut Array;
        unsafe {
            (*array_ptr).init(array_class, 2, boxed_val);
        }
        let mut root = Value::from_ptr(array_ptr);

        let used_before = from.used();
        {
            let mut scavenger = Scavenger::new(&from, &mut to);
            scavenger.visit_slot(&mut root);
            unsafe { scavenger.process_queue(&mut |_| {}) };
        }

        // Live: array + one boxed. Dead boxed not copied.
        assert_eq!(to.used(), used_before - Boxed::SIZE);
        assert!(to.includes(root.ref_bits()));
        let new_array = unsafe { root.as_ref::<Array>() };
        let s0 = unsafe { new_array.get_unchecked(0) };
        let s1 = unsafe { new_array.get_unchecked(1) };
        assert_eq!(s0, s1, "shared referent must forward to one copy");
        assert!(to.includes(s0.ref_bits()));
        assert_eq!(unsafe { s0.as_ref::<Boxed>() }.value, Value::from_smi(7));
    }

    #[test]
    fn scavenge_ignores_external_and_non_ref_slots() {
        let boxed_class = make_class(InstanceFormat::boxed());

        let from = Space::new(OS_PAGE_SIZE);
        let mut to = Space::new(OS_PAGE_SIZE);

        let mut smi = Value::from_smi(11);
        let mut external = boxed_class; // points into the class buffer
        let mut scavenger = Scavenger::new(&from, &mut to);
        scavenger.visit_slot(&mut smi);
        scavenger.visit_slot(&mut external);
        assert_eq!(smi, Value::from_smi(11));
        assert_eq!(external, boxed_class);
        assert_eq!(to.used(), 0);
    }
}
