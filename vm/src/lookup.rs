use object::{Selector, Value};

use crate::program::Program;

/// Power-of-two size of the direct-mapped primary cache.
pub const PRIMARY_SIZE: usize = 256;

/// One primary-cache line. `tag == 0` marks "no such method" (the target
/// is the noSuchMethod trampoline); `tag == 1` an ordinary method; higher
/// tags are reserved for intrinsic code pointers in native interpreter
/// variants.
#[derive(Debug, Clone, Copy)]
pub struct CacheEntry {
    pub class: u64,
    pub selector: u32,
    pub tag: u32,
    pub target: Value,
}

const EMPTY: CacheEntry = CacheEntry {
    class: 0,
    selector: 0,
    tag: 0,
    target: Value::from_raw(0),
};

/// The per-process primary lookup cache for `invoke-method` sites.
///
/// Invalidated wholesale on any class or method change committed by the
/// debug session.
pub struct LookupCache {
    entries: Box<[CacheEntry; PRIMARY_SIZE]>,
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LookupCache {
    pub fn new() -> Self {
        Self { entries: Box::new([EMPTY; PRIMARY_SIZE]) }
    }

    #[inline(always)]
    fn index(class: Value, selector: Selector) -> usize {
        ((class.raw() ^ selector.raw() as u64) as usize) & (PRIMARY_SIZE - 1)
    }

    /// Primary-cache lookup; fills the line from the slow path on a miss.
    #[inline]
    pub fn lookup(
        &mut self,
        program: &Program,
        class: Value,
        selector: Selector,
    ) -> CacheEntry {
        let index = Self::index(class, selector);
        let entry = self.entries[index];
        if entry.class == class.raw() && entry.selector == selector.raw() {
            return entry;
        }
        self.lookup_slow(program, index, class, selector)
    }

    #[inline(never)]
    fn lookup_slow(
        &mut self,
        program: &Program,
        index: usize,
        class: Value,
        selector: Selector,
    ) -> CacheEntry {
        let entry = match program.lookup_method(class, selector) {
            Some(target) => CacheEntry {
                class: class.raw(),
                selector: selector.raw(),
                tag: 1,
                target,
            },
            None => CacheEntry {
                class: class.raw(),
                selector: selector.raw(),
                tag: 0,
                target: program.specials().no_such_method_trampoline,
            },
        };
        self.entries[index] = entry;
        entry
    }

    pub fn clear(&mut self) {
        *self.entries = [EMPTY; PRIMARY_SIZE];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_masked() {
        let class = Value::from_raw(0xdead_beef_0001);
        let selector = Selector::method(77, 1);
        let index = LookupCache::index(class, selector);
        assert!(index < PRIMARY_SIZE);
    }
}
