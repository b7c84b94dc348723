use parking_lot::RwLock;

/// The foreign-function surface the engine exposes. Loading and
/// marshalling live outside the core; the registry only records which
/// libraries the embedder asked for and answers symbol queries through
/// an installable resolver.
pub trait SymbolResolver: Send + Sync {
    /// Resolve `symbol` in `library` to a raw address, if the platform
    /// glue loaded it.
    fn resolve(&self, library: &str, symbol: &str) -> Option<usize>;
}

#[derive(Default)]
pub struct SharedLibraryRegistry {
    libraries: RwLock<Vec<String>>,
    resolver: RwLock<Option<Box<dyn SymbolResolver>>>,
}

impl SharedLibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `AddDefaultSharedLibrary`: remember a library name for symbol
    /// resolution.
    pub fn add_default(&self, name: &str) {
        let mut libraries = self.libraries.write();
        if !libraries.iter().any(|existing| existing == name) {
            libraries.push(name.to_string());
        }
    }

    pub fn libraries(&self) -> Vec<String> {
        self.libraries.read().clone()
    }

    pub fn set_resolver(&self, resolver: Option<Box<dyn SymbolResolver>>) {
        *self.resolver.write() = resolver;
    }

    /// Search the registered libraries in order.
    pub fn resolve(&self, symbol: &str) -> Option<usize> {
        let resolver = self.resolver.read();
        let resolver = resolver.as_ref()?;
        for library in self.libraries.read().iter() {
            if let Some(address) = resolver.resolve(library, symbol) {
                return Some(address);
            }
        }
        tracing::debug!(target: "ffi", symbol, "unresolved symbol");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl SymbolResolver for Fixed {
        fn resolve(&self, library: &str, symbol: &str) -> Option<usize> {
            (library == "libfoo" && symbol == "answer").then_some(42)
        }
    }

    #[test]
    fn registry_resolves_through_registered_libraries() {
        let registry = SharedLibraryRegistry::new();
        registry.add_default("libbar");
        registry.add_default("libfoo");
        registry.add_default("libfoo"); // deduplicated
        assert_eq!(registry.libraries().len(), 2);

        assert_eq!(registry.resolve("answer"), None);
        registry.set_resolver(Some(Box::new(Fixed)));
        assert_eq!(registry.resolve("answer"), Some(42));
        assert_eq!(registry.resolve("missing"), None);
    }
}
