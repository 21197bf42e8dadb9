// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Symbol registry: a tree of modules, each with symbol/struct/macro maps
//! and a stack of local scopes.
//!
//! The module tree is an arena indexed by `usize`; nodes hold a parent
//! index instead of shared references. All keys compare
//! case-insensitively. Lookup walks the current module's scopes innermost
//! outward, then the module's own symbols, then the parent chain up to the
//! root. `@`-prefixed names stop at the current module, `::` starts at the
//! root, backtick names only ever live in temporary scopes.

use std::collections::HashMap;

use crate::core::fixup::Fixup;
use crate::core::parser::{NamePath, SourceLine};
use crate::core::text_utils::to_upper;
use crate::core::value::Value;

pub const ROOT_MODULE: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Label,
    Variable,
    StructName,
    Field,
    MacroArg,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: Value,
    pub kind: SymbolKind,
    pub usage_count: u32,
    pub def_file: usize,
    pub def_line: u32,
}

impl Symbol {
    pub fn new(
        name: impl Into<String>,
        value: Value,
        kind: SymbolKind,
        def_file: usize,
        def_line: u32,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            usage_count: 0,
            def_file,
            def_line,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub offset: u16,
    pub size: u16,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    /// The parsed body lines, replayed to emit the default pattern.
    pub body: Vec<SourceLine>,
    /// Fields in body order; offsets are strictly monotonic.
    pub fields: Vec<StructField>,
    pub size: u16,
    pub def_file: usize,
    pub def_line: u32,
}

impl StructDef {
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
    }
}

/// One raw macro body line, kept as source text for argument
/// substitution and re-parsing at invocation.
#[derive(Debug, Clone)]
pub struct MacroBodyLine {
    pub file_index: usize,
    pub line: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<MacroBodyLine>,
    pub end_label: Option<String>,
    pub def_file: usize,
    pub def_line: u32,
}

#[derive(Debug, Default)]
pub struct LocalScope {
    symbols: HashMap<String, Symbol>,
    pub fixups: Vec<Fixup>,
    pub is_loop_scope: bool,
    pub is_proc_scope: bool,
    pub is_temporary_scope: bool,
    pub is_macro_context: bool,
    pub loop_counter: u32,
    pub break_requested: bool,
    pub continue_requested: bool,
    /// Names declared LOCAL; they shadow outer definitions even before
    /// they are bound.
    pub local_bookings: Vec<String>,
    pub error_count: usize,
}

impl LocalScope {
    pub fn loop_scope(counter: u32) -> Self {
        Self {
            is_loop_scope: true,
            is_temporary_scope: true,
            loop_counter: counter,
            ..Self::default()
        }
    }

    pub fn proc_scope() -> Self {
        Self {
            is_proc_scope: true,
            ..Self::default()
        }
    }

    pub fn macro_scope() -> Self {
        Self {
            is_macro_context: true,
            is_temporary_scope: true,
            ..Self::default()
        }
    }

    pub fn temporary() -> Self {
        Self {
            is_temporary_scope: true,
            ..Self::default()
        }
    }

    pub fn books(&self, name: &str) -> bool {
        self.local_bookings
            .iter()
            .any(|booked| booked.eq_ignore_ascii_case(name))
    }

    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(&to_upper(name))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }
}

#[derive(Debug)]
pub struct ModuleNode {
    pub name: String,
    pub parent: Option<usize>,
    children: HashMap<String, usize>,
    symbols: HashMap<String, Symbol>,
    pub structs: HashMap<String, StructDef>,
    pub macros: HashMap<String, MacroDef>,
    pub scopes: Vec<LocalScope>,
    pub fixups: Vec<Fixup>,
}

impl ModuleNode {
    fn new(name: String, parent: Option<usize>) -> Self {
        Self {
            name,
            parent,
            children: HashMap::new(),
            symbols: HashMap::new(),
            structs: HashMap::new(),
            macros: HashMap::new(),
            scopes: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum DefineOutcome {
    Ok,
    Duplicate,
}

#[derive(Debug)]
pub struct SymbolTable {
    modules: Vec<ModuleNode>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            modules: vec![ModuleNode::new(String::new(), None)],
        }
    }

    pub fn module(&self, index: usize) -> &ModuleNode {
        &self.modules[index]
    }

    pub fn module_mut(&mut self, index: usize) -> &mut ModuleNode {
        &mut self.modules[index]
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Dotted path of a module, empty for the root.
    pub fn module_path(&self, index: usize) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(index);
        while let Some(ix) = cur {
            let node = &self.modules[ix];
            if !node.name.is_empty() {
                parts.push(node.name.clone());
            }
            cur = node.parent;
        }
        parts.reverse();
        parts.join(".")
    }

    /// Child module by name, created on first use.
    pub fn ensure_child(&mut self, parent: usize, name: &str) -> usize {
        let key = to_upper(name);
        if let Some(&child) = self.modules[parent].children.get(&key) {
            return child;
        }
        let child = self.modules.len();
        self.modules
            .push(ModuleNode::new(name.to_string(), Some(parent)));
        self.modules[parent].children.insert(key, child);
        child
    }

    pub fn child_of(&self, parent: usize, name: &str) -> Option<usize> {
        self.modules[parent].children.get(&to_upper(name)).copied()
    }

    // ---- scopes --------------------------------------------------------

    pub fn push_scope(&mut self, module: usize, scope: LocalScope) {
        self.modules[module].scopes.push(scope);
    }

    pub fn pop_scope(&mut self, module: usize) -> Option<LocalScope> {
        self.modules[module].scopes.pop()
    }

    pub fn innermost_scope(&self, module: usize) -> Option<&LocalScope> {
        self.modules[module].scopes.last()
    }

    pub fn innermost_scope_mut(&mut self, module: usize) -> Option<&mut LocalScope> {
        self.modules[module].scopes.last_mut()
    }

    /// Innermost loop scope, for BREAK/CONTINUE and `$cnt`.
    pub fn innermost_loop_scope_mut(&mut self, module: usize) -> Option<&mut LocalScope> {
        self.modules[module]
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.is_loop_scope)
    }

    /// Attach a fixup to the innermost scope, or the module itself when no
    /// scope is active.
    pub fn record_fixup(&mut self, module: usize, fixup: Fixup) {
        match self.modules[module].scopes.last_mut() {
            Some(scope) => scope.fixups.push(fixup),
            None => self.modules[module].fixups.push(fixup),
        }
    }

    // ---- definition ----------------------------------------------------

    /// Define a symbol following the scope rules: backtick names go to the
    /// innermost temporary scope, LOCAL-booked names to their booking
    /// scope, everything else to the innermost scope or the module map.
    pub fn define(&mut self, module: usize, symbol: Symbol) -> DefineOutcome {
        if symbol.name.starts_with('`') {
            if self
                .modules[module]
                .scopes
                .iter()
                .all(|scope| !scope.is_temporary_scope)
            {
                self.push_scope(module, LocalScope::temporary());
            }
            let scope = self
                .modules[module]
                .scopes
                .iter_mut()
                .rev()
                .find(|scope| scope.is_temporary_scope)
                .expect("temporary scope exists");
            return insert_symbol(&mut scope.symbols, symbol);
        }

        let node = &mut self.modules[module];
        if let Some(scope) = node
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.books(&symbol.name))
        {
            return insert_symbol(&mut scope.symbols, symbol);
        }
        match node.scopes.last_mut() {
            Some(scope) => insert_symbol(&mut scope.symbols, symbol),
            None => insert_symbol(&mut node.symbols, symbol),
        }
    }

    /// Assign a variable: update it where it already lives, or define it
    /// fresh when unknown. A non-variable symbol of the same name is a
    /// duplicate.
    pub fn assign_variable(&mut self, module: usize, symbol: Symbol) -> DefineOutcome {
        let path = NamePath::simple(&symbol.name, crate::core::tokenizer::Span::default());
        if let Some(located) = self.locate(module, &path) {
            let existing = match located {
                Located::Scoped(m, s, key) => self.modules[m].scopes[s].symbols.get_mut(&key),
                Located::InModule(m, key) => self.modules[m].symbols.get_mut(&key),
                Located::StructSize(..) | Located::FieldOffset(..) => None,
            };
            return match existing {
                Some(entry) if entry.kind == SymbolKind::Variable => {
                    entry.value = symbol.value;
                    DefineOutcome::Ok
                }
                _ => DefineOutcome::Duplicate,
            };
        }
        self.define(module, symbol)
    }

    /// Define directly in a module's own map, bypassing scopes. Used for
    /// deferred EQU resolution after its scope is gone.
    pub fn define_in_module(&mut self, module: usize, symbol: Symbol) -> DefineOutcome {
        insert_symbol(&mut self.modules[module].symbols, symbol)
    }

    pub fn define_struct(&mut self, module: usize, def: StructDef) -> DefineOutcome {
        let key = to_upper(&def.name);
        let node = &mut self.modules[module];
        if node.structs.contains_key(&key) || node.symbols.contains_key(&key) {
            return DefineOutcome::Duplicate;
        }
        node.structs.insert(key, def);
        DefineOutcome::Ok
    }

    pub fn define_macro(&mut self, module: usize, def: MacroDef) -> DefineOutcome {
        let key = to_upper(&def.name);
        let node = &mut self.modules[module];
        if node.macros.contains_key(&key) || node.symbols.contains_key(&key) {
            return DefineOutcome::Duplicate;
        }
        node.macros.insert(key, def);
        DefineOutcome::Ok
    }

    // ---- lookup --------------------------------------------------------

    /// Resolve a name path from `module`, incrementing the usage count of
    /// the found symbol.
    pub fn lookup(&mut self, module: usize, path: &NamePath) -> Option<Value> {
        self.resolve(module, path, true)
    }

    /// Usage count of a symbol without touching it; `None` when the name
    /// does not resolve.
    pub fn usage_count(&mut self, module: usize, path: &NamePath) -> Option<u32> {
        self.locate(module, path)
            .map(|located| match located {
                Located::Scoped(m, s, key) => self.modules[m].scopes[s].symbols[&key].usage_count,
                Located::InModule(m, key) => self.modules[m].symbols[&key].usage_count,
                Located::StructSize(..) | Located::FieldOffset(..) => 0,
            })
    }

    fn resolve(&mut self, module: usize, path: &NamePath, count_usage: bool) -> Option<Value> {
        let located = self.locate(module, path)?;
        Some(match located {
            Located::Scoped(m, s, key) => {
                let symbol = self.modules[m].scopes[s]
                    .symbols
                    .get_mut(&key)
                    .expect("located symbol");
                if count_usage {
                    symbol.usage_count += 1;
                }
                symbol.value.clone()
            }
            Located::InModule(m, key) => {
                let symbol = self.modules[m]
                    .symbols
                    .get_mut(&key)
                    .expect("located symbol");
                if count_usage {
                    symbol.usage_count += 1;
                }
                symbol.value.clone()
            }
            Located::StructSize(size) => Value::Int(i64::from(size)),
            Located::FieldOffset(offset) => Value::Int(i64::from(offset)),
        })
    }

    fn locate(&self, module: usize, path: &NamePath) -> Option<Located> {
        let first = &path.segments[0];

        if first.starts_with('`') {
            // Temporary names: enclosing temporary scopes only.
            let key = to_upper(first);
            for (ix, scope) in self.modules[module].scopes.iter().enumerate().rev() {
                if scope.is_temporary_scope && scope.symbols.contains_key(&key) {
                    return Some(Located::Scoped(module, ix, key));
                }
            }
            return None;
        }

        if path.segments.len() > 1 {
            return self.locate_qualified(module, path);
        }

        if path.local {
            // `@name`: current module's scopes and symbols only.
            return self.locate_in_module(module, first);
        }
        if path.rooted {
            return self.locate_in_module(ROOT_MODULE, first);
        }

        // Simple name: walk the module chain outward.
        let mut cur = Some(module);
        while let Some(ix) = cur {
            if let Some(found) = self.locate_in_module(ix, first) {
                return Some(found);
            }
            if self.blocked_by_booking(ix, first) {
                return None;
            }
            cur = self.modules[ix].parent;
        }
        None
    }

    /// A LOCAL booking without a binding hides outer definitions.
    fn blocked_by_booking(&self, module: usize, name: &str) -> bool {
        self.modules[module]
            .scopes
            .iter()
            .rev()
            .any(|scope| scope.books(name) && scope.symbol(name).is_none())
    }

    fn locate_in_module(&self, module: usize, name: &str) -> Option<Located> {
        let key = to_upper(name);
        let node = &self.modules[module];
        for (ix, scope) in node.scopes.iter().enumerate().rev() {
            if scope.symbols.contains_key(&key) {
                return Some(Located::Scoped(module, ix, key));
            }
            if scope.books(name) {
                return None;
            }
        }
        if node.symbols.contains_key(&key) {
            return Some(Located::InModule(module, key));
        }
        if let Some(def) = node.structs.get(&key) {
            return Some(Located::StructSize(def.size));
        }
        None
    }

    fn locate_qualified(&self, module: usize, path: &NamePath) -> Option<Located> {
        let bases: Vec<usize> = if path.rooted {
            vec![ROOT_MODULE]
        } else {
            let mut bases = Vec::new();
            let mut cur = Some(module);
            while let Some(ix) = cur {
                bases.push(ix);
                cur = self.modules[ix].parent;
            }
            bases
        };

        let segments = &path.segments;
        for base in bases {
            let mut cur = base;
            let mut matched = true;
            for (ix, seg) in segments[..segments.len() - 1].iter().enumerate() {
                if let Some(child) = self.child_of(cur, seg) {
                    cur = child;
                    continue;
                }
                // The penultimate segment may name a struct; the final
                // segment is then a field.
                if ix == segments.len() - 2 {
                    if let Some(def) = self.modules[cur].structs.get(&to_upper(seg)) {
                        if let Some(field) = def.field(&segments[segments.len() - 1]) {
                            return Some(Located::FieldOffset(field.offset));
                        }
                    }
                }
                matched = false;
                break;
            }
            if !matched {
                continue;
            }
            let last = &segments[segments.len() - 1];
            let key = to_upper(last);
            let node = &self.modules[cur];
            if node.symbols.contains_key(&key) {
                return Some(Located::InModule(cur, key));
            }
            if let Some(def) = node.structs.get(&key) {
                return Some(Located::StructSize(def.size));
            }
        }
        None
    }

    // ---- structs / macros ----------------------------------------------

    pub fn find_struct(&self, module: usize, path: &NamePath) -> Option<(usize, &StructDef)> {
        if path.is_simple() {
            let key = to_upper(&path.segments[0]);
            let mut cur = Some(module);
            while let Some(ix) = cur {
                if let Some(def) = self.modules[ix].structs.get(&key) {
                    return Some((ix, def));
                }
                cur = self.modules[ix].parent;
            }
            return None;
        }
        let owner = self.walk_module_path(module, path)?;
        let key = to_upper(path.segments.last()?);
        self.modules[owner].structs.get(&key).map(|def| (owner, def))
    }

    pub fn find_macro(&self, module: usize, path: &NamePath) -> Option<(usize, &MacroDef)> {
        if path.is_simple() {
            let key = to_upper(&path.segments[0]);
            let mut cur = Some(module);
            while let Some(ix) = cur {
                if let Some(def) = self.modules[ix].macros.get(&key) {
                    return Some((ix, def));
                }
                cur = self.modules[ix].parent;
            }
            return None;
        }
        let owner = self.walk_module_path(module, path)?;
        let key = to_upper(path.segments.last()?);
        self.modules[owner].macros.get(&key).map(|def| (owner, def))
    }

    /// Module holding the last segment of a qualified path.
    fn walk_module_path(&self, module: usize, path: &NamePath) -> Option<usize> {
        let bases: Vec<usize> = if path.rooted {
            vec![ROOT_MODULE]
        } else {
            let mut bases = Vec::new();
            let mut cur = Some(module);
            while let Some(ix) = cur {
                bases.push(ix);
                cur = self.modules[ix].parent;
            }
            bases
        };
        'bases: for base in bases {
            let mut cur = base;
            for seg in &path.segments[..path.segments.len() - 1] {
                match self.child_of(cur, seg) {
                    Some(child) => cur = child,
                    None => continue 'bases,
                }
            }
            return Some(cur);
        }
        None
    }
}

enum Located {
    Scoped(usize, usize, String),
    InModule(usize, String),
    StructSize(u16),
    FieldOffset(u16),
}

fn insert_symbol(map: &mut HashMap<String, Symbol>, symbol: Symbol) -> DefineOutcome {
    let key = to_upper(&symbol.name);
    if let Some(existing) = map.get_mut(&key) {
        if existing.kind == SymbolKind::Variable && symbol.kind == SymbolKind::Variable {
            existing.value = symbol.value;
            return DefineOutcome::Ok;
        }
        return DefineOutcome::Duplicate;
    }
    map.insert(key, symbol);
    DefineOutcome::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tokenizer::Span;

    fn path(text: &str) -> NamePath {
        let rooted = text.starts_with("::");
        let text = text.strip_prefix("::").unwrap_or(text);
        let local = text.starts_with('@');
        let text = text.strip_prefix('@').unwrap_or(text);
        NamePath {
            rooted,
            local,
            segments: text.split('.').map(str::to_string).collect(),
            span: Span::default(),
        }
    }

    fn label(name: &str, value: i64) -> Symbol {
        Symbol::new(name, Value::Int(value), SymbolKind::Label, 0, 1)
    }

    #[test]
    fn define_and_lookup_case_insensitive() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define(ROOT_MODULE, label("Main", 0x8000)), DefineOutcome::Ok);
        assert_eq!(
            table.lookup(ROOT_MODULE, &path("MAIN")),
            Some(Value::Int(0x8000))
        );
        assert_eq!(
            table.define(ROOT_MODULE, label("main", 1)),
            DefineOutcome::Duplicate
        );
    }

    #[test]
    fn variables_rebind_labels_do_not() {
        let mut table = SymbolTable::new();
        let var = |v| Symbol::new("counter", Value::Int(v), SymbolKind::Variable, 0, 1);
        assert_eq!(table.define(ROOT_MODULE, var(1)), DefineOutcome::Ok);
        assert_eq!(table.define(ROOT_MODULE, var(2)), DefineOutcome::Ok);
        assert_eq!(
            table.lookup(ROOT_MODULE, &path("counter")),
            Some(Value::Int(2))
        );
    }

    #[test]
    fn nested_module_lookup_walks_outward() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define(ROOT_MODULE, label("outer", 1)), DefineOutcome::Ok);
        let inner = table.ensure_child(ROOT_MODULE, "Inner");
        assert_eq!(table.define(inner, label("here", 2)), DefineOutcome::Ok);
        assert_eq!(table.lookup(inner, &path("outer")), Some(Value::Int(1)));
        assert_eq!(table.lookup(inner, &path("here")), Some(Value::Int(2)));
        // Inner symbols are invisible from outside without qualification.
        assert_eq!(table.lookup(ROOT_MODULE, &path("here")), None);
        assert_eq!(
            table.lookup(ROOT_MODULE, &path("Inner.here")),
            Some(Value::Int(2))
        );
    }

    #[test]
    fn rooted_lookup_ignores_current_module() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define(ROOT_MODULE, label("name", 1)), DefineOutcome::Ok);
        let inner = table.ensure_child(ROOT_MODULE, "M");
        assert_eq!(table.define(inner, label("name", 2)), DefineOutcome::Ok);
        assert_eq!(table.lookup(inner, &path("name")), Some(Value::Int(2)));
        assert_eq!(table.lookup(inner, &path("::name")), Some(Value::Int(1)));
    }

    #[test]
    fn local_form_does_not_inherit() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define(ROOT_MODULE, label("top", 7)), DefineOutcome::Ok);
        let inner = table.ensure_child(ROOT_MODULE, "M");
        assert_eq!(table.lookup(inner, &path("top")), Some(Value::Int(7)));
        assert_eq!(table.lookup(inner, &path("@top")), None);
    }

    #[test]
    fn scope_shadows_module() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define(ROOT_MODULE, label("x", 1)), DefineOutcome::Ok);
        table.push_scope(ROOT_MODULE, LocalScope::loop_scope(1));
        assert_eq!(table.define(ROOT_MODULE, label("x", 2)), DefineOutcome::Ok);
        assert_eq!(table.lookup(ROOT_MODULE, &path("x")), Some(Value::Int(2)));
        let _ = table.pop_scope(ROOT_MODULE);
        assert_eq!(table.lookup(ROOT_MODULE, &path("x")), Some(Value::Int(1)));
    }

    #[test]
    fn backtick_names_stay_in_temporary_scope() {
        let mut table = SymbolTable::new();
        table.push_scope(ROOT_MODULE, LocalScope::loop_scope(1));
        assert_eq!(table.define(ROOT_MODULE, label("`t", 5)), DefineOutcome::Ok);
        assert_eq!(table.lookup(ROOT_MODULE, &path("`t")), Some(Value::Int(5)));
        let _ = table.pop_scope(ROOT_MODULE);
        // Gone with the scope; never entered the global table.
        assert_eq!(table.lookup(ROOT_MODULE, &path("`t")), None);
        assert!(table.module(ROOT_MODULE).symbols().next().is_none());
    }

    #[test]
    fn local_booking_hides_outer_symbol() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define(ROOT_MODULE, label("tmp", 9)), DefineOutcome::Ok);
        let mut scope = LocalScope::proc_scope();
        scope.local_bookings.push("tmp".to_string());
        table.push_scope(ROOT_MODULE, scope);
        assert_eq!(table.lookup(ROOT_MODULE, &path("tmp")), None);
        assert_eq!(table.define(ROOT_MODULE, label("tmp", 10)), DefineOutcome::Ok);
        assert_eq!(table.lookup(ROOT_MODULE, &path("tmp")), Some(Value::Int(10)));
        let _ = table.pop_scope(ROOT_MODULE);
        assert_eq!(table.lookup(ROOT_MODULE, &path("tmp")), Some(Value::Int(9)));
    }

    #[test]
    fn usage_counts_increment_on_lookup() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define(ROOT_MODULE, label("used", 1)), DefineOutcome::Ok);
        assert_eq!(table.usage_count(ROOT_MODULE, &path("used")), Some(0));
        let _ = table.lookup(ROOT_MODULE, &path("used"));
        assert_eq!(table.usage_count(ROOT_MODULE, &path("used")), Some(1));
    }

    #[test]
    fn struct_name_and_field_resolution() {
        let mut table = SymbolTable::new();
        let def = StructDef {
            name: "MyS".to_string(),
            body: Vec::new(),
            fields: vec![
                StructField {
                    name: "fld1".to_string(),
                    offset: 0,
                    size: 1,
                },
                StructField {
                    name: "fld2".to_string(),
                    offset: 1,
                    size: 2,
                },
            ],
            size: 3,
            def_file: 0,
            def_line: 1,
        };
        assert_eq!(table.define_struct(ROOT_MODULE, def), DefineOutcome::Ok);
        assert_eq!(table.lookup(ROOT_MODULE, &path("MyS")), Some(Value::Int(3)));
        assert_eq!(
            table.lookup(ROOT_MODULE, &path("MyS.fld2")),
            Some(Value::Int(1))
        );
        assert_eq!(table.lookup(ROOT_MODULE, &path("MyS.nope")), None);
    }

    #[test]
    fn deep_module_path_resolution() {
        let mut table = SymbolTable::new();
        let a = table.ensure_child(ROOT_MODULE, "A");
        let b = table.ensure_child(a, "B");
        assert_eq!(table.define(b, label("deep", 42)), DefineOutcome::Ok);
        assert_eq!(
            table.lookup(ROOT_MODULE, &path("A.B.deep")),
            Some(Value::Int(42))
        );
        assert_eq!(table.lookup(a, &path("B.deep")), Some(Value::Int(42)));
        assert_eq!(table.lookup(b, &path("::A.B.deep")), Some(Value::Int(42)));
        assert_eq!(table.module_path(b), "A.B");
    }
}
