//! Managed loader: decrypt, link and invoke extracted units on demand.
//!
//! Each unit is decrypted and linked at most once per loader. The cache holds
//! one monitor per unit id, so concurrent first calls of the same unit wait
//! for a single in-flight load while calls of other units proceed.
//!
//! Failures to decrypt, link or find the entry point are fatal: they are
//! logged, handed to the fatal hook, and the process aborts. Errors raised by
//! the unit itself are returned to the caller unchanged.

use crate::crypto::GuardValue;
use crate::digest_guard::LOADER_CLASS;
use crate::envelope::ENVELOPE_CLASS;
use crate::error::LoaderError;
use crate::ir::{MethodRef, Type, OBJECT_CLASS, STRING_CLASS};
use crate::payload::{self, UnitImage};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Managed entry point of the loader
pub const DECRYPT_METHOD: &str = "decryptAndInvokeMain";

/// `static Envelope decryptAndInvokeMain(String id, byte[] payload, Object secret, Object[] args)`
pub fn decrypt_method() -> MethodRef {
    MethodRef::new(
        LOADER_CLASS,
        DECRYPT_METHOD,
        vec![
            Type::object(STRING_CLASS),
            Type::bytes(),
            Type::object(OBJECT_CLASS),
            Type::array(Type::object(OBJECT_CLASS)),
        ],
        Type::object(ENVELOPE_CLASS),
    )
}

/// Runtime capability to turn a unit image into something invocable.
pub trait UnitLinker {
    /// Linked entry point
    type Entry: Send + Sync;
    /// Runtime value passed to and returned from units
    type Value;
    /// Error raised by a running unit
    type Error;

    /// Link `image` and locate its entry point
    fn link(&self, image: UnitImage) -> Result<Self::Entry, LoaderError>;

    /// Invoke a linked entry point
    fn invoke(
        &self,
        entry: &Self::Entry,
        args: Vec<Self::Value>,
    ) -> Result<Self::Value, Self::Error>;
}

/// Called with the failure before the process aborts
pub type FatalHook = Arc<dyn Fn(&LoaderError) + Send + Sync>;

type Slot<E> = Arc<Mutex<Option<Arc<E>>>>;

pub struct ManagedLoader<E> {
    units: RwLock<HashMap<String, Slot<E>>>,
    loads: AtomicUsize,
    fatal_hook: Option<FatalHook>,
}

impl<E> Default for ManagedLoader<E> {
    fn default() -> Self {
        Self {
            units: RwLock::new(HashMap::new()),
            loads: AtomicUsize::new(0),
            fatal_hook: None,
        }
    }
}

impl<E> std::fmt::Debug for ManagedLoader<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedLoader")
            .field("units", &self.units.read().len())
            .field("loads", &self.load_count())
            .finish()
    }
}

impl<E> ManagedLoader<E> {
    /// Number of decrypt-and-link operations performed
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self, unit_id: &str) -> bool {
        self.units
            .read()
            .get(unit_id)
            .is_some_and(|slot| slot.lock().is_some())
    }
}

impl<E: Send + Sync> ManagedLoader<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook run on fatal failures, before the abort
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = Some(hook);
        self
    }

    fn slot(&self, unit_id: &str) -> Slot<E> {
        if let Some(slot) = self.units.read().get(unit_id) {
            return Arc::clone(slot);
        }
        let mut units = self.units.write();
        Arc::clone(units.entry(unit_id.to_string()).or_default())
    }

    /// Linked entry point of `unit_id`, loading it on first use.
    pub fn entry<L>(
        &self,
        linker: &L,
        unit_id: &str,
        payload: &[u8],
        secret: &GuardValue,
    ) -> Arc<E>
    where
        L: UnitLinker<Entry = E>,
    {
        let slot = self.slot(unit_id);
        let mut guard = slot.lock();
        if let Some(entry) = guard.as_ref() {
            tracing::trace!("Unit cache hit: {}", unit_id);
            return Arc::clone(entry);
        }

        tracing::debug!("Unit cache miss, loading {}", unit_id);
        let linked = payload::open(unit_id, payload, secret).and_then(|image| linker.link(image));
        let entry = match linked {
            Ok(entry) => Arc::new(entry),
            Err(e) => self.fatal(e),
        };
        self.loads.fetch_add(1, Ordering::SeqCst);
        *guard = Some(Arc::clone(&entry));
        entry
    }

    /// Load `unit_id` if needed and invoke its entry point with `args`.
    pub fn decrypt_and_invoke<L>(
        &self,
        linker: &L,
        unit_id: &str,
        payload: &[u8],
        secret: &GuardValue,
        args: Vec<L::Value>,
    ) -> Result<L::Value, L::Error>
    where
        L: UnitLinker<Entry = E>,
    {
        let entry = self.entry(linker, unit_id, payload, secret);
        linker.invoke(&entry, args)
    }

    fn fatal(&self, error: LoaderError) -> ! {
        tracing::error!("Fatal loader failure: {}", error);
        if let Some(hook) = &self.fatal_hook {
            hook(&error);
        }
        std::process::abort()
    }
}
