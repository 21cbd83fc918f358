//! Process-wide library init/finalize, and the per-context registries that own every type and
//! request handle minted against it.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;
#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

use crate::{
    backend::GpuDriver,
    config::EngineConfig,
    error::{Error, Result},
    handle::{self, HandlePool},
    info::{keys, Info},
    progress::ProgressEngine,
    request::Request,
    types::{predefined::PredefinedTable, TypeNode},
};

const DEFAULT_NESTING_LIMIT: usize = 3;
const NESTING_LIMIT_ENV: &str = "DTPACK_NESTING_LEVEL";

static PROCESS_REFCOUNT: Mutex<u32> = Mutex::new(0);

#[cfg(feature = "parking_lot")]
fn lock(mutex: &Mutex<u32>) -> parking_lot::MutexGuard<'_, u32> {
    mutex.lock()
}
#[cfg(not(feature = "parking_lot"))]
fn lock(mutex: &Mutex<u32>) -> std::sync::MutexGuard<'_, u32> {
    mutex.lock().unwrap()
}

/// Process-wide init/finalize, mirroring `one_time_init`/`one_time_finalize`: the real work (none,
/// today — registering a default backend set would go here) only runs on the 0→1 / 1→0 transition
/// of a refcount, so nested `init`/`finalize` pairs from unrelated callers in the same process
/// compose correctly.
pub struct Library;

impl Library {
    pub fn init() -> Result<()> {
        let mut count = lock(&PROCESS_REFCOUNT);
        if *count == 0 {
            log::debug!("dtpack: process-wide init");
        }
        *count += 1;
        Ok(())
    }

    pub fn finalize() -> Result<()> {
        let mut count = lock(&PROCESS_REFCOUNT);
        if *count == 0 {
            return Err(Error::BadArgs);
        }
        *count -= 1;
        if *count == 0 {
            log::debug!("dtpack: process-wide finalize");
        }
        Ok(())
    }
}

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

/// One datatype/request namespace. Handles minted by a `Context` embed its id, but are resolved
/// by calling back into that same `Context` (its handle pools aren't reachable any other way) —
/// there is no global context registry to keep consistent.
pub struct Context {
    id: u32,
    pub(crate) types: HandlePool<TypeNode>,
    pub(crate) requests: HandlePool<Request>,
    predefined: PredefinedTable,
    backends: Vec<Arc<dyn GpuDriver>>,
    nesting_limit: usize,
    pub(crate) progress: ProgressEngine,
}

impl Context {
    pub fn create(info: &Info) -> Result<Arc<Context>> {
        Self::create_with_backends(info, Vec::new())
    }

    pub fn create_with_backends(info: &Info, backends: Vec<Arc<dyn GpuDriver>>) -> Result<Arc<Context>> {
        Self::create_with_config(info, backends, EngineConfig::default())
    }

    /// Like [`create_with_backends`](Self::create_with_backends), but also takes an
    /// [`EngineConfig`] for knobs `Info` doesn't cover (today: temporary-slab sizing). Tests that
    /// need to observe chunking without a full 16 MiB slab use this directly.
    pub fn create_with_config(
        info: &Info,
        backends: Vec<Arc<dyn GpuDriver>>,
        config: EngineConfig,
    ) -> Result<Arc<Context>> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let nesting_limit = info
            .get_usize(keys::NESTING_LEVEL)
            .or_else(|| std::env::var(NESTING_LIMIT_ENV).ok().and_then(|s| s.parse().ok()))
            .unwrap_or(DEFAULT_NESTING_LIMIT);

        let types = HandlePool::new();
        let predefined = PredefinedTable::build(id, &types);

        Ok(Arc::new(Context {
            id,
            types,
            requests: HandlePool::new(),
            predefined,
            backends,
            nesting_limit,
            progress: ProgressEngine::new(config.slab),
        }))
    }

    /// Consumes the caller's handle on the context. Fails with `BadArgs` if other `Arc<Context>`
    /// clones (e.g. held by in-flight requests) are still alive, mirroring the original's
    /// "free while busy" rejection.
    pub fn free(self: Arc<Self>) -> Result<()> {
        Arc::try_unwrap(self).map(drop).map_err(|_| Error::BadArgs)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn nesting_limit(&self) -> usize {
        self.nesting_limit
    }

    pub fn predefined(&self) -> &PredefinedTable {
        &self.predefined
    }

    pub fn backends(&self) -> &[Arc<dyn GpuDriver>] {
        &self.backends
    }

    pub(crate) fn mint_type_handle(&self, object_id: u32) -> u64 {
        handle::encode(self.id, object_id)
    }

    pub(crate) fn mint_request_handle(&self, object_id: u32) -> u64 {
        handle::encode(self.id, object_id)
    }

    /// Resolves a type handle previously minted by this context. Returns `None` for handles
    /// minted by a different context (mismatched context id) or already freed.
    pub fn resolve_type(&self, handle: u64) -> Option<Arc<TypeNode>> {
        let (context_id, object_id) = handle::decode(handle);
        if context_id != self.id {
            return None;
        }
        self.types.get(object_id)
    }

    pub fn resolve_request(&self, handle: u64) -> Option<Arc<Request>> {
        let (context_id, object_id) = handle::decode(handle);
        if context_id != self.id {
            return None;
        }
        self.requests.get(object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_finalize_nests() {
        Library::init().unwrap();
        Library::init().unwrap();
        Library::finalize().unwrap();
        Library::finalize().unwrap();
        assert!(Library::finalize().is_err());
    }

    #[test]
    fn distinct_contexts_get_distinct_ids() {
        let a = Context::create(&Info::create()).unwrap();
        let b = Context::create(&Info::create()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn nesting_limit_overridable_via_info() {
        let mut info = Info::create();
        info.keyval_append(keys::NESTING_LEVEL, b"2".to_vec());
        let ctx = Context::create(&info).unwrap();
        assert_eq!(ctx.nesting_limit(), 2);
    }

    #[test]
    fn nesting_limit_defaults_to_three_with_no_override() {
        let ctx = Context::create(&Info::create()).unwrap();
        assert_eq!(ctx.nesting_limit(), DEFAULT_NESTING_LIMIT);
        assert_eq!(ctx.nesting_limit(), 3);
    }

    #[test]
    fn cross_context_handle_does_not_resolve() {
        let a = Context::create(&Info::create()).unwrap();
        let b = Context::create(&Info::create()).unwrap();
        let byte = a.predefined().byte();
        assert!(b.resolve_type(byte).is_none());
    }
}
