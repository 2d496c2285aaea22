//! Function provenance and the guest hook table.
//!
//! Functions are identified by the address of their VM object. Every
//! function recorded here is pinned in the VM registry, so the address stays
//! unique for as long as the record exists.

use std::collections::HashMap;

use mlua::{ChunkMode, FromLuaMulti, Function, IntoLuaMulti, Lua, MultiValue, RegistryKey, Table, Value};
use parking_lot::Mutex;

use crate::TypeMismatch;

/// Name of the registry slot holding the private `debug` library.
pub(crate) const DEBUG_REGISTRY_KEY: &str = "tether.debug";

/// Prefix shared by every chunk name the engine assigns.
pub(crate) const SOURCE_TAG_PREFIX: &str = "=[tether:";

/// Source tags of chunks compiled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceTag {
    /// Hardening bootstrap.
    Sandbox,

    /// Environment bootstrap.
    Environment,

    /// Top-level input passed to `execute`.
    Input,

    /// Copy made by `clonefunction`.
    Clone,

    /// Copy returned by `hookfunction`.
    Hook,

    /// Chunk compiled by `loadstring`.
    Load,
}

impl SourceTag {
    const ALL: [Self; 6] = [
        Self::Sandbox,
        Self::Environment,
        Self::Input,
        Self::Clone,
        Self::Hook,
        Self::Load,
    ];

    fn label(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Environment => "environment",
            Self::Input => "input",
            Self::Clone => "clone",
            Self::Hook => "hook",
            Self::Load => "load",
        }
    }

    /// Returns the chunk name for this tag.
    pub fn chunk_name(self) -> String {
        format!("{SOURCE_TAG_PREFIX}{}]", self.label())
    }

    /// Returns the chunk name for this tag, followed by a script name.
    pub fn named_chunk(self, name: &str) -> String {
        format!("{SOURCE_TAG_PREFIX}{}] {name}", self.label())
    }

    /// Classifies a function source string.
    pub fn classify(source: &str) -> Option<Self> {
        let rest = source.strip_prefix(SOURCE_TAG_PREFIX)?;
        let (label, _) = rest.split_once(']')?;

        Self::ALL.into_iter().find(|tag| tag.label() == label)
    }

    /// Checks whether functions with this tag were produced by the engine
    /// rather than by user input.
    pub fn is_manufactured(self) -> bool {
        !matches!(self, Self::Input)
    }

    /// Checks whether frames with this tag belong to host-controlled code.
    pub fn is_host(self) -> bool {
        matches!(self, Self::Sandbox | Self::Environment | Self::Input)
    }
}

struct HookEntry {
    _original: RegistryKey,
    replacement: RegistryKey,
    replacement_id: usize,
}

#[derive(Default)]
struct Tables {
    /// Original function → hook record.
    hooks: HashMap<usize, HookEntry>,

    /// Replacement function → original function.
    replacements: HashMap<usize, usize>,

    /// Functions the engine manufactured.
    provenance: HashMap<usize, RegistryKey>,
}

/// Provenance registry and hook table of one guest VM.
///
/// Entries never expire on their own; [`ClosureRegistry::clear`] drops all
/// of them when the VM is torn down.
pub struct ClosureRegistry {
    tables: Mutex<Tables>,
    primary: bool,
}

impl ClosureRegistry {
    /// Creates an empty registry.
    ///
    /// `primary` is the answer of [`caller_is_host`] when no frame decides
    /// it.
    ///
    /// [`caller_is_host`]: Self::caller_is_host
    pub fn new(primary: bool) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            primary,
        }
    }

    /// Records a function as manufactured by the engine.
    pub fn mark(&self, lua: &Lua, function: &Function) -> mlua::Result<()> {
        let id = identity(function);

        let mut tables = self.tables.lock();
        if !tables.provenance.contains_key(&id) {
            let key = lua.create_registry_value(function.clone())?;
            tables.provenance.insert(id, key);
        }

        Ok(())
    }

    /// Creates a native function and records it.
    pub fn create_native<A, R, F>(&self, lua: &Lua, function: F) -> mlua::Result<Function>
    where
        A: FromLuaMulti,
        R: IntoLuaMulti,
        F: Fn(&Lua, A) -> mlua::Result<R> + Send + 'static,
    {
        let function = lua.create_function(function)?;
        self.mark(lua, &function)?;
        Ok(function)
    }

    /// Wraps a function into a native forwarder.
    pub fn wrap(&self, lua: &Lua, target: Function) -> mlua::Result<Function> {
        self.create_native(lua, move |_, args: MultiValue| target.call::<MultiValue>(args))
    }

    /// Makes an independently callable copy of a function.
    ///
    /// Native functions get a forwarding wrapper. Guest functions are dumped
    /// to bytecode and reloaded, then their upvalues are copied by index, so
    /// captured tables stay shared with the original while captured scalars
    /// become independent. If the copy cannot be made, the original is
    /// returned.
    pub fn clone_function(&self, lua: &Lua, function: &Function) -> mlua::Result<Function> {
        self.duplicate(lua, function, SourceTag::Clone)
    }

    /// Hooks `original`, returning a function with its previous behavior.
    ///
    /// Every slot of the globals table, and of tables stored directly in it,
    /// that holds `original` is rebound to `replacement`.
    pub fn hook(
        &self,
        lua: &Lua,
        original: &Function,
        replacement: &Function,
    ) -> mlua::Result<Function> {
        let previous = self.duplicate(lua, original, SourceTag::Hook)?;

        {
            let mut tables = self.tables.lock();
            let original_id = identity(original);
            let replacement_id = identity(replacement);

            if let Some(entry) = tables.hooks.remove(&original_id) {
                tables.replacements.remove(&entry.replacement_id);
            }

            let entry = HookEntry {
                _original: lua.create_registry_value(original.clone())?,
                replacement: lua.create_registry_value(replacement.clone())?,
                replacement_id,
            };

            tables.hooks.insert(original_id, entry);
            tables.replacements.insert(replacement_id, original_id);
        }

        let rebound = rebind(lua, original, replacement)?;
        tracing::debug!(rebound, "function hooked");

        Ok(previous)
    }

    /// Returns the replacement installed for `original`.
    pub fn replacement(&self, lua: &Lua, original: &Function) -> mlua::Result<Option<Function>> {
        let tables = self.tables.lock();

        match tables.hooks.get(&identity(original)) {
            Some(entry) => lua.registry_value(&entry.replacement).map(Some),
            None => Ok(None),
        }
    }

    /// Checks whether the engine manufactured or hooked a function.
    pub fn is_ours(&self, function: &Function) -> bool {
        let id = identity(function);

        {
            let tables = self.tables.lock();
            if tables.hooks.contains_key(&id)
                || tables.replacements.contains_key(&id)
                || tables.provenance.contains_key(&id)
            {
                return true;
            }
        }

        function
            .info()
            .source
            .as_deref()
            .and_then(SourceTag::classify)
            .is_some_and(SourceTag::is_manufactured)
    }

    /// Walks the call stack outward to decide whether the caller is
    /// host-controlled code.
    pub fn caller_is_host(&self, lua: &Lua) -> bool {
        let mut level = 0;

        while let Some(frame) = lua.inspect_stack(level) {
            if let Some(source) = frame.source().source.as_deref() {
                if source.starts_with('@') {
                    return false;
                }

                if SourceTag::classify(source).is_some_and(SourceTag::is_host) {
                    return true;
                }
            }

            level += 1;
        }

        self.primary
    }

    /// Returns the number of hooked functions.
    pub fn hook_count(&self) -> usize {
        self.tables.lock().hooks.len()
    }

    /// Drops every record.
    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        tables.hooks.clear();
        tables.replacements.clear();
        tables.provenance.clear();
    }

    fn duplicate(&self, lua: &Lua, function: &Function, tag: SourceTag) -> mlua::Result<Function> {
        if is_native(function) {
            return self.wrap(lua, function.clone());
        }

        match reload(lua, function, tag) {
            Ok(copy) => {
                self.mark(lua, &copy)?;
                Ok(copy)
            }
            Err(err) => {
                tracing::warn!(%err, "function copy failed, returning the original");
                Ok(function.clone())
            }
        }
    }
}

/// Checks whether a function is native.
pub fn is_native(function: &Function) -> bool {
    function.info().what == "C"
}

/// Converts an argument into a function, or raises a type error.
pub fn expect_function(
    value: Value,
    function: &'static str,
    position: usize,
) -> mlua::Result<Function> {
    match value {
        Value::Function(value) => Ok(value),
        other => Err(mlua::Error::external(TypeMismatch {
            function,
            position,
            expected: "function",
            got: other.type_name(),
        })),
    }
}

fn identity(function: &Function) -> usize {
    function.to_pointer() as usize
}

fn reload(lua: &Lua, function: &Function, tag: SourceTag) -> mlua::Result<Function> {
    let bytecode = function.dump(false);

    let copy = lua
        .load(bytecode)
        .set_name(tag.chunk_name())
        .set_mode(ChunkMode::Binary)
        .into_function()?;

    let debug: Table = lua.named_registry_value(DEBUG_REGISTRY_KEY)?;
    let get_upvalue: Function = debug.get("getupvalue")?;
    let set_upvalue: Function = debug.get("setupvalue")?;

    for index in 1.. {
        let (name, value): (Option<String>, Value) =
            get_upvalue.call((function.clone(), index))?;

        if name.is_none() {
            break;
        }

        set_upvalue.call::<()>((copy.clone(), index, value))?;
    }

    Ok(copy)
}

/// Rebinds slots holding `original` in the globals table and in tables
/// stored directly in it.
fn rebind(lua: &Lua, original: &Function, replacement: &Function) -> mlua::Result<usize> {
    let globals = lua.globals();
    let mut rebound = rebind_table(&globals, original, replacement)?;

    let nested: Vec<Table> = globals
        .pairs::<Value, Value>()
        .filter_map(|pair| match pair {
            Ok((_, Value::Table(table))) if table != globals => Some(table),
            _ => None,
        })
        .collect();

    for table in nested {
        rebound += rebind_table(&table, original, replacement)?;
    }

    Ok(rebound)
}

fn rebind_table(table: &Table, original: &Function, replacement: &Function) -> mlua::Result<usize> {
    let keys: Vec<Value> = table
        .pairs::<Value, Value>()
        .filter_map(|pair| match pair {
            Ok((key, Value::Function(function))) if function == *original => Some(key),
            _ => None,
        })
        .collect();

    for key in &keys {
        table.raw_set(key.clone(), replacement.clone())?;
    }

    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_tags_round_trip() {
        for tag in SourceTag::ALL {
            assert_eq!(SourceTag::classify(&tag.chunk_name()), Some(tag));
            assert_eq!(SourceTag::classify(&tag.named_chunk("main")), Some(tag));
        }

        assert_eq!(SourceTag::classify("=[tether:other]"), None);
        assert_eq!(SourceTag::classify("[tether:sandbox]"), None);
        assert_eq!(SourceTag::classify("@scripts/a.lua"), None);
        assert_eq!(SourceTag::classify("=[C]"), None);
    }

    #[test]
    fn host_tags() {
        assert!(SourceTag::Input.is_host());
        assert!(SourceTag::Environment.is_host());
        assert!(!SourceTag::Load.is_host());
        assert!(!SourceTag::Clone.is_host());
    }

    #[test]
    fn user_input_is_not_manufactured() {
        assert!(!SourceTag::Input.is_manufactured());

        for tag in [
            SourceTag::Sandbox,
            SourceTag::Environment,
            SourceTag::Clone,
            SourceTag::Hook,
            SourceTag::Load,
        ] {
            assert!(tag.is_manufactured());
        }
    }

    #[test]
    fn non_functions_are_type_errors() {
        let error = expect_function(Value::Integer(5), "clonefunction", 1).unwrap_err();
        assert_eq!(
            error.to_string(),
            "bad argument #1 to 'clonefunction' (function expected, got integer)"
        );
    }
}
