// Library registration: host functions are grouped into named modules
// and installed into the globals table (or merged into it, for "_G").

use crate::lua_vm::{CFunction, LuaResult, LuaVM};

pub enum LibraryEntry {
    Function(CFunction),
}

pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, LibraryEntry)>,
}

impl LibraryModule {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }

    pub fn with_function(mut self, name: &'static str, func: CFunction) -> Self {
        self.entries.push((name, LibraryEntry::Function(func)));
        self
    }
}

/// Builder for library modules.
#[macro_export]
macro_rules! lib_module {
    ($name:expr, {
        $($item_name:expr => $item:expr),* $(,)?
    }) => {{
        let mut module = $crate::lib_registry::LibraryModule::new($name);
        $(
            module.entries.push((
                $item_name,
                $crate::lib_registry::LibraryEntry::Function($item),
            ));
        )*
        module
    }};
}

pub struct LibraryRegistry {
    modules: Vec<LibraryModule>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: LibraryModule) {
        self.modules.push(module);
    }

    pub fn load_all(&self, vm: &mut LuaVM) -> LuaResult<()> {
        for module in &self.modules {
            self.load_module(vm, module)?;
        }
        Ok(())
    }

    pub fn load_module(&self, vm: &mut LuaVM, module: &LibraryModule) -> LuaResult<()> {
        if module.name == "_G" {
            // Base functions are registered directly as globals.
            for (name, entry) in &module.entries {
                let LibraryEntry::Function(f) = entry;
                let v = crate::lua_value::LuaValue::cfunction(*f);
                vm.set_global(name, v);
            }
            return Ok(());
        }
        let lib = vm.new_table(0, module.entries.len());
        let lib_id = lib.hvalue();
        for (name, entry) in &module.entries {
            let LibraryEntry::Function(f) = entry;
            let key = vm.new_string(name);
            let v = crate::lua_value::LuaValue::cfunction(*f);
            let _ = vm.table_set(lib_id, key, v);
        }
        vm.set_global(module.name, lib);
        Ok(())
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the core libraries: the base functions and coroutines.
pub fn create_core_registry() -> LibraryRegistry {
    let mut registry = LibraryRegistry::new();
    registry.register(crate::stdlib::basic::create_basic_lib());
    registry.register(crate::stdlib::coroutine::create_coroutine_lib());
    registry
}
