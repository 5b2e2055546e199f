//! Global symbol table with speculative-emission dirty tracking.
//!
//! Size estimation "emits" code into a throwaway stream, which defines block labels and
//! registers branch targets in this shared table. When several workers estimate concurrently,
//! symbols can be left in a defined or registered state that does not correspond to any real
//! emission; the cleanup pass resets those flags before the actual rewrite.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

/// Stable handle to an entry in the [`SymbolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    /// Creates a handle from a raw index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        SymbolId(index as u32)
    }

    /// Returns the raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A named program symbol.
#[derive(Debug)]
pub struct Symbol {
    /// Symbol name as it appears in the binary.
    pub name: String,
    /// Address of the symbol, when known.
    pub address: Option<u64>,
    /// Set when a speculative emission defined this symbol.
    defined: AtomicBool,
    /// Set when a speculative emission registered this symbol.
    registered: AtomicBool,
}

impl Symbol {
    /// Returns `true` if a speculative emission left this symbol defined.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.defined.load(Ordering::Relaxed)
    }

    /// Returns `true` if a speculative emission left this symbol registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    /// Marks the symbol defined (called by size estimation).
    pub fn set_defined(&self, defined: bool) {
        self.defined.store(defined, Ordering::Relaxed);
    }

    /// Marks the symbol registered (called by size estimation).
    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Relaxed);
    }
}

/// Append-only, thread-safe symbol registry.
///
/// Symbols are interned once and never removed; concurrent interning of the same name yields
/// the same handle.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: boxcar::Vec<Symbol>,
    by_name: DashMap<String, SymbolId>,
}

impl SymbolTable {
    /// Creates an empty symbol table.
    #[must_use]
    pub fn new() -> Self {
        SymbolTable {
            symbols: boxcar::Vec::new(),
            by_name: DashMap::new(),
        }
    }

    /// Interns a symbol by name, creating it on first use.
    ///
    /// A later intern with a known address fills in a previously unknown one.
    ///
    /// # Arguments
    ///
    /// * `name` - Symbol name
    /// * `address` - Address of the symbol, when known
    pub fn intern(&self, name: &str, address: Option<u64>) -> SymbolId {
        if let Some(existing) = self.by_name.get(name) {
            return *existing;
        }
        let entry = self.by_name.entry(name.to_string()).or_insert_with(|| {
            let idx = self.symbols.push(Symbol {
                name: name.to_string(),
                address,
                defined: AtomicBool::new(false),
                registered: AtomicBool::new(false),
            });
            SymbolId::new(idx)
        });
        *entry
    }

    /// Looks up a symbol by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).map(|entry| *entry)
    }

    /// Returns the symbol behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this table.
    #[must_use]
    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    /// Returns the name of a symbol.
    #[must_use]
    pub fn name(&self, id: SymbolId) -> &str {
        &self.symbols[id.index()].name
    }

    /// Returns the address of a symbol, when known.
    #[must_use]
    pub fn address(&self, id: SymbolId) -> Option<u64> {
        self.symbols[id.index()].address
    }

    /// Returns the number of interned symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.count()
    }

    /// Returns `true` if no symbols have been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.count() == 0
    }

    /// Iterates over all interned symbols.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().map(|(_, sym)| sym)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let table = SymbolTable::new();
        let a = table.intern("memcpy", Some(0x4000));
        let b = table.intern("memcpy", None);
        assert_eq!(a, b);
        assert_eq!(table.address(a), Some(0x4000));
        assert_eq!(table.name(a), "memcpy");
    }

    #[test]
    fn test_lookup_unknown() {
        let table = SymbolTable::new();
        assert!(table.lookup("missing").is_none());
    }

    #[test]
    fn test_dirty_flags() {
        let table = SymbolTable::new();
        let id = table.intern(".Lfoo.0", None);
        assert!(!table.get(id).is_defined());
        table.get(id).set_defined(true);
        table.get(id).set_registered(true);
        assert!(table.get(id).is_defined());
        assert!(table.get(id).is_registered());
    }
}
