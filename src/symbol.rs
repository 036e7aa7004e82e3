// File: src/symbol.rs
//
// Symbol table machinery: nested scopes, slot allocation, and free-variable
// resolution tying the compiler (§4.4) to the VM's closure model (§4.6).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::errors::{find_closest_match, SourceLocation};

/// The unreadable sentinel name given to blank-identifier (`_`) slots.
/// Not a legal identifier the lexer can ever produce, so it can never collide
/// with a real name while still occupying a normal slot.
pub const BLANK_NAME: &str = "\0_blank";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    Function,
    Block,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub index: u32,
    pub is_constant: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Local,
    Free,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub symbol: Symbol,
    pub scope: Scope,
    /// Number of function-scope boundaries crossed to reach the defining frame.
    /// Zero for `Global`/`Local` resolutions.
    pub depth: u32,
    /// Slot in the *referencing* function's free-variable list, for `Free` only.
    pub free_index: Option<u32>,
}

#[derive(Debug)]
pub struct RedefinitionError {
    pub name: String,
}

/// One lexical scope. Function-kind scopes own a slot counter and the free-variable
/// bookkeeping; block-kind scopes delegate slot allocation to their nearest
/// enclosing function scope so block locals still live in the function's flat
/// local array (and are `LoadFast`-able, not stack-nested).
pub struct SymbolTable {
    kind: ScopeKind,
    parent: Option<Rc<RefCell<SymbolTable>>>,
    symbols: HashMap<String, Symbol>,
    insertion_order: Vec<String>,
    next_index: u32,
    /// Free variables captured by this function, in first-mention order:
    /// `(name, free_index, owner_slot, depth)`. `owner_slot`/`depth` describe
    /// where the compiler found the definition when the capture was first
    /// recorded (see `record_free_capture`), and are exactly what `MakeCell`
    /// needs at the capture site in the enclosing function.
    /// Only meaningful for `Function`/`Root` scopes.
    free_vars: Vec<(String, u32, u32, u32)>,
}

impl SymbolTable {
    pub fn new_root() -> Rc<RefCell<SymbolTable>> {
        Rc::new(RefCell::new(SymbolTable {
            kind: ScopeKind::Root,
            parent: None,
            symbols: HashMap::new(),
            insertion_order: Vec::new(),
            next_index: 0,
            free_vars: Vec::new(),
        }))
    }

    pub fn new_child(parent: &Rc<RefCell<SymbolTable>>, kind: ScopeKind) -> Rc<RefCell<SymbolTable>> {
        assert!(kind != ScopeKind::Root, "only the compiler's initial table is root-kind");
        Rc::new(RefCell::new(SymbolTable {
            kind,
            parent: Some(parent.clone()),
            symbols: HashMap::new(),
            insertion_order: Vec::new(),
            next_index: 0,
            free_vars: Vec::new(),
        }))
    }

    pub fn kind(&self) -> &ScopeKind {
        &self.kind
    }

    pub fn is_root(&self) -> bool {
        self.kind == ScopeKind::Root
    }

    /// The nearest enclosing table that owns a slot space (Root or Function).
    fn owning_table(this: &Rc<RefCell<SymbolTable>>) -> Rc<RefCell<SymbolTable>> {
        let kind = this.borrow().kind.clone();
        match kind {
            ScopeKind::Root | ScopeKind::Function => this.clone(),
            ScopeKind::Block => {
                let parent = this.borrow().parent.clone().expect("block scope has a parent");
                Self::owning_table(&parent)
            }
        }
    }

    pub fn insert_variable(
        this: &Rc<RefCell<SymbolTable>>,
        name: &str,
    ) -> Result<Symbol, RedefinitionError> {
        Self::insert(this, name, false)
    }

    pub fn insert_constant(
        this: &Rc<RefCell<SymbolTable>>,
        name: &str,
    ) -> Result<Symbol, RedefinitionError> {
        Self::insert(this, name, true)
    }

    fn insert(
        this: &Rc<RefCell<SymbolTable>>,
        name: &str,
        is_constant: bool,
    ) -> Result<Symbol, RedefinitionError> {
        if this.borrow().symbols.contains_key(name) {
            return Err(RedefinitionError { name: name.to_string() });
        }
        let owner = Self::owning_table(this);
        let index = {
            let mut owner_mut = owner.borrow_mut();
            let idx = owner_mut.next_index;
            owner_mut.next_index += 1;
            idx
        };
        let symbol = Symbol { name: name.to_string(), index, is_constant };
        let mut this_mut = this.borrow_mut();
        this_mut.symbols.insert(name.to_string(), symbol.clone());
        this_mut.insertion_order.push(name.to_string());
        Ok(symbol)
    }

    /// Allocates a write-only slot for the blank identifier. Each call allocates a
    /// fresh slot (blank bindings never alias each other); loads are rejected at
    /// the resolve site, not here.
    pub fn insert_blank(this: &Rc<RefCell<SymbolTable>>) -> Symbol {
        let owner = Self::owning_table(this);
        let mut owner_mut = owner.borrow_mut();
        let idx = owner_mut.next_index;
        owner_mut.next_index += 1;
        Symbol { name: BLANK_NAME.to_string(), index: idx, is_constant: true }
    }

    /// Resolves `name` starting at `this`, walking outward. Idempotent: resolving
    /// the same free variable twice from the same function returns the same
    /// `free_index` because the first mention's slot is cached in `free_vars`.
    pub fn resolve(this: &Rc<RefCell<SymbolTable>>, name: &str) -> Option<Resolution> {
        Self::resolve_inner(this, name, 0)
    }

    fn resolve_inner(this: &Rc<RefCell<SymbolTable>>, name: &str, fn_crossings: u32) -> Option<Resolution> {
        let this_ref = this.borrow();
        if let Some(sym) = this_ref.symbols.get(name) {
            let scope = match this_ref.kind {
                ScopeKind::Root => Scope::Global,
                ScopeKind::Function | ScopeKind::Block => {
                    if fn_crossings == 0 {
                        Scope::Local
                    } else {
                        Scope::Free
                    }
                }
            };
            if scope == Scope::Free {
                // `this` is an outer function frame relative to the call site; the
                // capture must be registered on the *originating* function's table,
                // which the caller (Compiler) does via `record_free_capture`. Here
                // we only report the found symbol; depth/free_index are finalized
                // by the caller which walks hand-in-hand with the compiler's
                // function-nesting stack.
                return Some(Resolution {
                    symbol: sym.clone(),
                    scope,
                    depth: fn_crossings,
                    free_index: None,
                });
            }
            return Some(Resolution { symbol: sym.clone(), scope, depth: 0, free_index: None });
        }
        let parent = this_ref.parent.clone()?;
        let crosses_function = this_ref.kind == ScopeKind::Function;
        drop(this_ref);
        Self::resolve_inner(&parent, name, fn_crossings + if crosses_function { 1 } else { 0 })
    }

    /// Registers (or reuses) a free-variable slot on `this` function's table for
    /// `name`, returning its index in this function's free list. Called by the
    /// compiler once a `Free` resolution crosses into `this`'s frame.
    /// `owner_slot`/`depth` are the defining symbol's slot and the number of
    /// function frames up from `this`'s own frame where it lives — the values
    /// `MakeCell` needs at the enclosing capture site.
    pub fn record_free_capture(
        this: &Rc<RefCell<SymbolTable>>,
        name: &str,
        owner_slot: u32,
        depth: u32,
    ) -> u32 {
        let mut this_mut = this.borrow_mut();
        if let Some((_, idx, _, _)) = this_mut.free_vars.iter().find(|(n, ..)| n == name) {
            return *idx;
        }
        let idx = this_mut.free_vars.len() as u32;
        this_mut.free_vars.push((name.to_string(), idx, owner_slot, depth));
        idx
    }

    pub fn free_vars(this: &Rc<RefCell<SymbolTable>>) -> Vec<String> {
        this.borrow().free_vars.iter().map(|(n, ..)| n.clone()).collect()
    }

    /// `(owner_slot, depth)` for each free variable, in `free_index` order —
    /// exactly the operands the compiler needs to emit `MakeCell` at the
    /// enclosing function's capture site.
    pub fn free_var_capture_sites(this: &Rc<RefCell<SymbolTable>>) -> Vec<(u32, u32)> {
        this.borrow().free_vars.iter().map(|(_, _, slot, depth)| (*slot, *depth)).collect()
    }

    pub fn local_count(this: &Rc<RefCell<SymbolTable>>) -> u32 {
        Self::owning_table(this).borrow().next_index
    }

    /// Whether a fresh binding inserted at `this` point lands in the root
    /// (global) slot space rather than some enclosing function's locals.
    pub fn owner_is_root(this: &Rc<RefCell<SymbolTable>>) -> bool {
        Self::owning_table(this).borrow().kind == ScopeKind::Root
    }

    /// Names declared directly in this table, insertion order, not walking
    /// to parents. Used to populate `Code::global_names`/`local_names`.
    pub fn own_names(this: &Rc<RefCell<SymbolTable>>) -> Vec<String> {
        this.borrow().insertion_order.clone()
    }

    pub fn all_names(this: &Rc<RefCell<SymbolTable>>) -> Vec<String> {
        let mut names = Vec::new();
        let mut cur = Some(this.clone());
        while let Some(table) = cur {
            let table_ref = table.borrow();
            names.extend(table_ref.insertion_order.iter().cloned());
            cur = table_ref.parent.clone();
        }
        names
    }

    pub fn suggest(this: &Rc<RefCell<SymbolTable>>, name: &str) -> Option<String> {
        let names = Self::all_names(this);
        find_closest_match(name, &names).map(|s| s.to_string())
    }

    pub fn parent(this: &Rc<RefCell<SymbolTable>>) -> Option<Rc<RefCell<SymbolTable>>> {
        this.borrow().parent.clone()
    }
}

/// Non-owning handle used so leaf `Code` objects can walk up to a root without
/// the tree owning a cycle (see SPEC_FULL.md / §9 "Cyclic references").
pub type ParentLink<T> = Weak<T>;

#[allow(dead_code)]
fn _assert_location_type_is_in_scope(_: SourceLocation) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_resolution() {
        let root = SymbolTable::new_root();
        SymbolTable::insert_variable(&root, "x").unwrap();
        let res = SymbolTable::resolve(&root, "x").unwrap();
        assert_eq!(res.scope, Scope::Global);
    }

    #[test]
    fn redefinition_in_same_scope_is_rejected() {
        let root = SymbolTable::new_root();
        SymbolTable::insert_variable(&root, "x").unwrap();
        let err = SymbolTable::insert_variable(&root, "x").unwrap_err();
        assert_eq!(err.name, "x");
    }

    #[test]
    fn block_scope_shares_function_slot_space() {
        let root = SymbolTable::new_root();
        let func = SymbolTable::new_child(&root, ScopeKind::Function);
        SymbolTable::insert_variable(&func, "a").unwrap();
        let block = SymbolTable::new_child(&func, ScopeKind::Block);
        let b = SymbolTable::insert_variable(&block, "b").unwrap();
        // `b` shares the function's counter, so its index continues from `a`'s.
        assert_eq!(b.index, 1);
        assert_eq!(SymbolTable::local_count(&func), 2);
    }

    #[test]
    fn free_capture_is_idempotent() {
        let root = SymbolTable::new_root();
        let func = SymbolTable::new_child(&root, ScopeKind::Function);
        let idx1 = SymbolTable::record_free_capture(&func, "c", 0, 1);
        let idx2 = SymbolTable::record_free_capture(&func, "c", 0, 1);
        assert_eq!(idx1, idx2);
    }

    #[test]
    fn resolve_free_reports_function_crossing() {
        let root = SymbolTable::new_root();
        let outer = SymbolTable::new_child(&root, ScopeKind::Function);
        SymbolTable::insert_variable(&outer, "v").unwrap();
        let inner = SymbolTable::new_child(&outer, ScopeKind::Function);
        let res = SymbolTable::resolve(&inner, "v").unwrap();
        assert_eq!(res.scope, Scope::Free);
        assert_eq!(res.depth, 1);
    }

    #[test]
    fn blank_allocates_fresh_unreadable_slot() {
        let root = SymbolTable::new_root();
        let a = SymbolTable::insert_blank(&root);
        let b = SymbolTable::insert_blank(&root);
        assert_ne!(a.index, b.index);
        assert_eq!(a.name, BLANK_NAME);
    }
}
