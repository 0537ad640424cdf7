//! State shared by every thread of one runtime: the registry, the globals
//! table, per-type metatables, and the panic hook.

use std::sync::{Arc, RwLock, Weak};

use crate::coroutine::Coroutine;
use crate::lua::Options;
use crate::table::LuaTable;
use crate::value::{LuaType, LuaValue, TableRef, TYPE_TAG_COUNT};

/// Registry key under which the globals table is anchored.
pub const GLOBALS_KEY: &str = "_G";

/// Host hook that observes an error raised outside any protected call,
/// just before the value surfaces to the host.
pub type PanicFn = fn(&LuaValue);

pub type GlobalRef = Arc<GlobalState>;

#[derive(Debug)]
pub struct GlobalState {
    /// Host-only anchor table, never reachable from scripts.
    pub registry: TableRef,
    /// The globals table; also stored in the registry at [`GLOBALS_KEY`].
    pub globals: TableRef,
    type_metatables: RwLock<[Option<TableRef>; TYPE_TAG_COUNT]>,
    panic: RwLock<Option<PanicFn>>,
    main: RwLock<Weak<Coroutine>>,
    pub options: Options,
}

impl GlobalState {
    pub fn new(options: Options) -> GlobalRef {
        let globals: TableRef = Arc::new(RwLock::new(LuaTable::new()));
        let registry: TableRef = Arc::new(RwLock::new(LuaTable::new()));
        crate::lock_write(&registry).put(
            LuaValue::Str(GLOBALS_KEY.into()),
            LuaValue::Table(globals.clone()),
        );
        Arc::new(GlobalState {
            registry,
            globals,
            type_metatables: RwLock::new(Default::default()),
            panic: RwLock::new(None),
            main: RwLock::new(Weak::new()),
            options,
        })
    }

    /// Record the main thread.  Held weakly: the main coroutine owns the
    /// globals, not the other way around.
    pub(crate) fn bind_main(&self, main: &Arc<Coroutine>) {
        *crate::lock_write(&self.main) = Arc::downgrade(main);
    }

    pub fn main(&self) -> Option<Arc<Coroutine>> {
        crate::lock_read(&self.main).upgrade()
    }

    /// Shared metatable for every value of a non-table, non-userdata type.
    pub fn type_metatable(&self, t: LuaType) -> Option<TableRef> {
        crate::lock_read(&self.type_metatables)[t.tag_index()].clone()
    }

    pub fn set_type_metatable(&self, t: LuaType, mt: Option<TableRef>) {
        crate::lock_write(&self.type_metatables)[t.tag_index()] = mt;
    }

    /// Install a panic hook, returning the previous one.
    pub fn at_panic(&self, hook: Option<PanicFn>) -> Option<PanicFn> {
        std::mem::replace(&mut *crate::lock_write(&self.panic), hook)
    }

    pub fn panic_hook(&self) -> Option<PanicFn> {
        *crate::lock_read(&self.panic)
    }
}
