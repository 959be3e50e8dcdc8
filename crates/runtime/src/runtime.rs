//! The runtime instance
//!
//! One [`Runtime`] per process (or per test): heap, shape table, handle
//! registry, serialization lock, scheduler, channel table, poller, and
//! the capability/determinism configuration read from the environment.
//!
//! All global mutable state is confined here; module-level mutation in
//! compiled code goes through the instance under the runtime lock like
//! everything else.

use std::path::PathBuf;
use std::sync::Mutex;

use molt_core::{Capability, CapabilitySet};

use crate::channel::ChannelTable;
use crate::errors::{capability_denied, determinism_violation, RtError};
use crate::handles::HandleRegistry;
use crate::heap::{Heap, ShapeTable};
use crate::poller::Poller;
use crate::rtlock::RtLock;
use crate::scheduler::SchedulerInner;

/// Environment variable: hash seed (0 selects deterministic hashing).
pub const ENV_HASH_SEED: &str = "MOLT_HASH_SEED";
/// Environment variable: disable capability enforcement.
pub const ENV_TRUSTED: &str = "MOLT_TRUSTED";
/// Environment variable: deterministic mode.
pub const ENV_DETERMINISTIC: &str = "MOLT_DETERMINISTIC";
/// Environment variable: colon-separated module search roots.
pub const ENV_MODULE_ROOTS: &str = "MOLT_MODULE_ROOTS";

fn env_bool(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Runtime configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Capabilities granted by the build manifest.
    pub caps: CapabilitySet,
    /// Trusted override: disables capability checks wholesale.
    pub trusted: bool,
    /// Deterministic mode: forces seed 0 and disables nondeterministic
    /// intrinsics.
    pub deterministic: bool,
    /// Per-process value hash seed.
    pub hash_seed: u64,
    /// Module search roots, in deterministic order.
    pub module_roots: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            caps: CapabilitySet::empty(),
            trusted: false,
            deterministic: false,
            hash_seed: 0,
            module_roots: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Read the recognized environment variables on top of the manifest
    /// capability set baked into the artifact.
    pub fn from_env(manifest_caps: CapabilitySet) -> Self {
        let deterministic = env_bool(ENV_DETERMINISTIC);
        let hash_seed = if deterministic {
            0
        } else {
            std::env::var(ENV_HASH_SEED)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };
        let module_roots = std::env::var(ENV_MODULE_ROOTS)
            .map(|roots| roots.split(':').map(PathBuf::from).collect())
            .unwrap_or_default();
        RuntimeConfig {
            caps: manifest_caps,
            trusted: env_bool(ENV_TRUSTED),
            deterministic,
            hash_seed,
            module_roots,
        }
    }

    pub fn with_caps(mut self, caps: CapabilitySet) -> Self {
        self.caps = caps;
        self
    }
}

/// A resident runtime instance.
pub struct Runtime {
    pub heap: Heap,
    pub shapes: ShapeTable,
    pub handles: HandleRegistry,
    pub lock: RtLock,
    pub config: RuntimeConfig,
    pub(crate) sched: Mutex<SchedulerInner>,
    pub(crate) chans: Mutex<ChannelTable>,
    pub(crate) poller: Mutex<Poller>,
    /// The error channel: terminal errors of tasks nobody joined.
    pub(crate) task_errors: Mutex<Vec<RtError>>,
    /// Class field tables registered by the artifact at startup
    /// (field name -> slot offset, per class id).
    classes: Mutex<Vec<Vec<String>>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Runtime {
            heap: Heap::new(),
            shapes: ShapeTable::new(),
            handles: HandleRegistry::new(),
            lock: RtLock::new(),
            config,
            sched: Mutex::new(SchedulerInner::new()),
            chans: Mutex::new(ChannelTable::new()),
            poller: Mutex::new(Poller::new()),
            task_errors: Mutex::new(Vec::new()),
            classes: Mutex::new(Vec::new()),
        }
    }

    /// Register a class's field layout. Called by artifact startup code
    /// in class-id order.
    pub fn register_class(&self, fields: Vec<String>) -> u32 {
        let mut classes = self.classes.lock().expect("class table poisoned");
        classes.push(fields);
        (classes.len() - 1) as u32
    }

    /// Create a bounded channel, returning its id.
    pub fn channel_create(&self, bound: usize) -> Result<u64, RtError> {
        self.chans
            .lock()
            .expect("channel table poisoned")
            .create(bound)
    }

    /// Outstanding sent-but-unreceived items on a channel.
    pub fn channel_depth(&self, id: u64) -> Option<usize> {
        self.chans.lock().expect("channel table poisoned").depth(id)
    }

    /// Per-channel statistics snapshot.
    pub fn channel_stats(&self, id: u64) -> Option<crate::channel::ChannelStats> {
        self.chans.lock().expect("channel table poisoned").stats(id)
    }

    /// Slot offset of `field` within class `id`.
    pub fn class_field_offset(&self, id: u32, field: &str) -> Option<usize> {
        let classes = self.classes.lock().expect("class table poisoned");
        classes
            .get(id as usize)
            .and_then(|fields| fields.iter().position(|f| f == field))
    }

    /// O(1) capability check. Denied calls raise; there is no fallback.
    pub fn require_cap(&self, cap: Capability) -> Result<(), RtError> {
        if self.config.trusted || self.config.caps.contains(cap) {
            Ok(())
        } else {
            Err(capability_denied(cap))
        }
    }

    /// Deterministic-mode gate for nondeterministic intrinsics.
    pub fn require_nondeterminism(&self, what: &str) -> Result<(), RtError> {
        if self.config.deterministic {
            Err(determinism_violation(what))
        } else {
            Ok(())
        }
    }

    /// Record a terminal task error that had no joiner. Logged through
    /// the runtime's error channel; the parent token is NOT cancelled.
    pub(crate) fn report_task_error(&self, err: RtError) {
        tracing::error!(kind = err.kind.name(), "task failed with no joiner: {}", err);
        self.task_errors
            .lock()
            .expect("error channel poisoned")
            .push(err);
    }

    /// Drain the error channel (tests and top-level reporting).
    pub fn take_task_errors(&self) -> Vec<RtError> {
        std::mem::take(&mut *self.task_errors.lock().expect("error channel poisoned"))
    }

    /// Opportunistic cycle collection at the deterministic byte trigger.
    pub fn maybe_collect(&self) {
        if self.heap.should_collect() {
            let _guard = self.lock.lock();
            crate::cycle::collect_cycles(&self.heap);
        }
    }

    /// Shutdown: release all handles (finalizers run in reverse
    /// registration order, under the runtime lock), then a final cycle
    /// pass. Finalizers may resurrect handles; running them first keeps
    /// the final pass authoritative.
    pub fn shutdown(&self) {
        let _guard = self.lock.lock();
        self.handles.release_all();
        crate::cycle::collect_cycles(&self.heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_capability_check() {
        let rt = Runtime::new(
            RuntimeConfig::default().with_caps(CapabilitySet::empty().with(Capability::FsRead)),
        );
        assert!(rt.require_cap(Capability::FsRead).is_ok());
        let err = rt.require_cap(Capability::NetOut).unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::CapabilityDenied);
    }

    #[test]
    fn test_trusted_overrides() {
        let mut config = RuntimeConfig::default();
        config.trusted = true;
        let rt = Runtime::new(config);
        assert!(rt.require_cap(Capability::ProcSpawn).is_ok());
    }

    #[test]
    fn test_deterministic_gate() {
        let mut config = RuntimeConfig::default();
        config.deterministic = true;
        let rt = Runtime::new(config);
        let err = rt.require_nondeterminism("wall clock").unwrap_err();
        assert_eq!(err.kind, molt_core::ErrorKind::DeterminismViolation);
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var(ENV_DETERMINISTIC, "1");
        std::env::set_var(ENV_HASH_SEED, "99");
        let config = RuntimeConfig::from_env(CapabilitySet::empty());
        // Deterministic mode forces seed 0 regardless of the variable.
        assert!(config.deterministic);
        assert_eq!(config.hash_seed, 0);
        std::env::remove_var(ENV_DETERMINISTIC);
        let config = RuntimeConfig::from_env(CapabilitySet::empty());
        assert_eq!(config.hash_seed, 99);
        std::env::remove_var(ENV_HASH_SEED);
    }
}
