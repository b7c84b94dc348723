use object::{visit_pointers, HeapHeader, Value};

const CHUNK_SIZE: usize = 1024;

/// One block of the remembered set.
struct Chunk {
    objects: Vec<*mut u8>,
}

impl Chunk {
    fn new() -> Self {
        Self { objects: Vec::with_capacity(CHUNK_SIZE) }
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.objects.len() == CHUNK_SIZE
    }
}

/// Per-process remembered set: mutable-heap objects that may hold
/// pointers into the immutable heap.
///
/// Entries are appended blindly (the write barrier stays cheap) and the
/// set is deduplicated when the chunk count has doubled since the last
/// GC. Deduplication borrows a mark bit from each object's class word
/// and restores it before returning.
pub struct StoreBuffer {
    chunks: Vec<Chunk>,
    chunks_at_last_gc: usize,
}

// SAFETY: owned by one process; only the stop-the-world collector reads
// it from another thread.
unsafe impl Send for StoreBuffer {}

impl Default for StoreBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuffer {
    pub fn new() -> Self {
        Self { chunks: vec![Chunk::new()], chunks_at_last_gc: 1 }
    }

    #[inline]
    pub fn insert(&mut self, object: *mut u8) {
        debug_assert!(!object.is_null());
        let chunk = self.chunks.last_mut().expect("store buffer chunk");
        chunk.objects.push(object);
        if chunk.is_full() {
            self.chunks.push(Chunk::new());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.len() == 1 && self.chunks[0].objects.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.chunks.iter().map(|c| c.objects.len()).sum()
    }

    /// The references from mutable to immutable heap have doubled since
    /// the last GC; time to compact.
    pub fn should_deduplicate(&self) -> bool {
        self.chunks.len() > 2 * self.chunks_at_last_gc
    }

    /// Drop duplicate entries. Two successive runs produce equal sets.
    ///
    /// # Safety
    ///
    /// Every recorded object must still be live with a valid class word,
    /// and no other thread may look at these objects while the marks are
    /// set.
    pub unsafe fn deduplicate(&mut self) {
        let mut kept: Vec<*mut u8> = Vec::new();
        for chunk in &self.chunks {
            for &obj in &chunk.objects {
                let header = &mut *(obj as *mut HeapHeader);
                if !header.is_dedup_marked() {
                    header.set_dedup_mark();
                    kept.push(obj);
                }
            }
        }
        for &obj in &kept {
            (*(obj as *mut HeapHeader)).clear_dedup_mark();
        }

        self.chunks.clear();
        self.chunks.push(Chunk::new());
        for obj in kept {
            self.insert(obj);
        }
        self.chunks_at_last_gc = self.chunks.len();
    }

    /// Visit every recorded object.
    pub fn iterate_objects(&self, f: &mut dyn FnMut(*mut u8)) {
        for chunk in &self.chunks {
            for &obj in &chunk.objects {
                f(obj);
            }
        }
    }

    /// Visit the pointer slots of every recorded object; the root set for
    /// an immutable-heap collection.
    ///
    /// # Safety
    ///
    /// Every recorded object must be live with a valid class word.
    pub unsafe fn iterate_pointers(&self, visitor: &mut dyn FnMut(&mut Value)) {
        for chunk in &self.chunks {
            for &obj in &chunk.objects {
                visit_pointers(obj, visitor);
            }
        }
    }

    /// Install the set rebuilt during a mutable GC.
    pub fn replace_after_gc(&mut self, new_buffer: StoreBuffer) {
        self.chunks = new_buffer.chunks;
        self.chunks_at_last_gc = self.chunks.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Boxed, Class, InstanceFormat, WORD};

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

    fn make_boxed(class: Value, storage: &mut Vec<[u64; 2]>) -> *mut u8 {
        storage.push([0; 2]);
        let ptr = storage.last_mut().unwrap().as_mut_ptr() as *mut Boxed;
        unsafe { (*ptr).init(class, Value::from_smi(0)) };
        ptr as *mut u8
    }

    #[test]
    fn dedup_removes_duplicates_and_is_idempotent() {
        let mut class_buf = Vec::new();
        let class = make_class(&mut class_buf, InstanceFormat::boxed());
        let mut storage = Vec::with_capacity(3);
        let a = make_boxed(class, &mut storage);
        let b = make_boxed(class, &mut storage);
        let c = make_boxed(class, &mut storage);

        let mut buffer = StoreBuffer::new();
        for obj in [a, b, a, c, b, a, a] {
            buffer.insert(obj);
        }
        assert_eq!(buffer.entry_count(), 7);

        unsafe { buffer.deduplicate() };
        let mut first: Vec<*mut u8> = Vec::new();
        buffer.iterate_objects(&mut |o| first.push(o));
        assert_eq!(first.len(), 3);

        unsafe { buffer.deduplicate() };
        let mut second: Vec<*mut u8> = Vec::new();
        buffer.iterate_objects(&mut |o| second.push(o));
        assert_eq!(first, second);

        // Class words restored.
        for &obj in &first {
            let header = unsafe { &*(obj as *const HeapHeader) };
            assert!(!header.is_dedup_marked());
        }
    }

    #[test]
    fn should_deduplicate_after_chunk_doubling() {
        let mut class_buf = Vec::new();
        let class = make_class(&mut class_buf, InstanceFormat::boxed());
        let mut storage = Vec::with_capacity(1);
        let obj = make_boxed(class, &mut storage);

        let mut buffer = StoreBuffer::new();
        assert!(!buffer.should_deduplicate());
        // Fill past two chunks of duplicates.
        for _ in 0..(2 * CHUNK_SIZE + 1) {
            buffer.insert(obj);
        }
        assert!(buffer.should_deduplicate());
        unsafe { buffer.deduplicate() };
        assert_eq!(buffer.entry_count(), 1);
        assert!(!buffer.should_deduplicate());
    }
}
