use ahash::AHashMap;
use parking_lot::RwLock;

/// Interned method names. Ids are dense, stable for the run, and double
/// as the selector id field. A handful of names the runtime itself
/// dispatches on get fixed ids.
pub struct Names {
    by_name: RwLock<AHashMap<String, u32>>,
    by_id: RwLock<Vec<String>>,
}

/// `noSuchMethod`, invoked by the trampoline after a failed dispatch.
pub const NO_SUCH_METHOD_ID: u32 = 0;
/// `call`, the closure invocation method.
pub const CALL_ID: u32 = 1;
/// `coroutineStart`, the seeded entry of a fresh coroutine stack.
pub const COROUTINE_START_ID: u32 = 2;

const RESERVED: [&str; 3] = ["noSuchMethod", "call", "coroutineStart"];

impl Default for Names {
    fn default() -> Self {
        Self::new()
    }
}

impl Names {
    pub fn new() -> Self {
        let names = Self {
            by_name: RwLock::new(AHashMap::new()),
            by_id: RwLock::new(Vec::new()),
        };
        for name in RESERVED {
            names.intern(name);
        }
        names
    }

    pub fn intern(&self, name: &str) -> u32 {
        if let Some(&id) = self.by_name.read().get(name) {
            return id;
        }
        let mut by_name = self.by_name.write();
        if let Some(&id) = by_name.get(name) {
            return id;
        }
        let mut by_id = self.by_id.write();
        let id = by_id.len() as u32;
        by_id.push(name.to_string());
        by_name.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name.read().get(name).copied()
    }

    pub fn name_of(&self, id: u32) -> Option<String> {
        self.by_id.read().get(id as usize).cloned()
    }

    pub fn count(&self) -> usize {
        self.by_id.read().len()
    }

    /// All names in id order, for the snapshot writer.
    pub fn all(&self) -> Vec<String> {
        self.by_id.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_fixed() {
        let names = Names::new();
        assert_eq!(names.lookup("noSuchMethod"), Some(NO_SUCH_METHOD_ID));
        assert_eq!(names.lookup("call"), Some(CALL_ID));
        assert_eq!(names.lookup("coroutineStart"), Some(COROUTINE_START_ID));
    }

    #[test]
    fn interning_is_stable() {
        let names = Names::new();
        let a = names.intern("+");
        let b = names.intern("-");
        assert_ne!(a, b);
        assert_eq!(names.intern("+"), a);
        assert_eq!(names.name_of(a).as_deref(), Some("+"));
    }
}
