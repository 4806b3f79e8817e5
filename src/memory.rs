//! # Resource Accountant
//!
//! ## Responsibility
//! Report how much memory is free right now and decide whether a model of a
//! known size may be loaded without eating into a fixed safety margin.
//!
//! ## Guarantees
//! - Side-effect free: [`ResourceAccountant::can_admit`] only reads the
//!   current free-memory figure and never fails.
//! - Pluggable: the free-memory figure comes from a [`MemoryProbe`], so tests
//!   can pin it with [`FixedMemoryProbe`] while production uses
//!   [`SystemMemoryProbe`].
//!
//! ## NOT Responsible For
//! - Deciding what to evict (that belongs to `model::cache`)
//! - Attention-state accounting (that belongs to `attention`)

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::{MemoryRefreshKind, Pid, RefreshKind, System};
use tracing::{debug, warn};

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte in bytes.
pub const GIB: u64 = 1024 * MIB;

/// Free memory that must remain after any admitted allocation (512 MiB).
pub const DEFAULT_SAFETY_MARGIN: u64 = 512 * MIB;

/// Source of the live free-memory figure.
///
/// Implementations must be cheap enough to call on every routing decision.
pub trait MemoryProbe: Send + Sync {
    /// Total memory visible to this process, in bytes.
    fn total_bytes(&self) -> u64;

    /// Memory currently free for new allocations, in bytes.
    fn free_bytes(&self) -> u64;

    /// Best-effort request to give memory back to the system.
    ///
    /// The default does nothing; callers must not rely on an effect.
    fn reclaim(&self) {}
}

/// Probe backed by the operating system's available-memory counter.
///
/// When a budget is configured it acts as a cap on this process: free
/// memory is the budget minus the process's resident set, and never more
/// than the machine actually has available. An application limited to
/// e.g. 1.5 GiB therefore behaves the same on a 64 GiB host.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    budget: Option<u64>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    /// Probe the whole machine.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
            )),
            budget: None,
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Probe the machine but never report more than `budget` bytes.
    pub fn with_budget(budget: u64) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new()
        }
    }

    /// Resident memory of this process, in bytes; 0 if it cannot be read.
    pub fn resident_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        Self::resident_locked(&mut system, self.pid)
    }

    fn resident_locked(system: &mut System, pid: Option<Pid>) -> u64 {
        let Some(pid) = pid else {
            return 0;
        };
        system.refresh_process(pid);
        system.process(pid).map_or(0, |process| process.memory())
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn total_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        self.budget.map_or(total, |b| total.min(b))
    }

    fn free_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let available = system.available_memory();
        match self.budget {
            None => available,
            Some(budget) => {
                let resident = Self::resident_locked(&mut system, self.pid);
                budget.saturating_sub(resident).min(available)
            }
        }
    }
}

/// Probe that reports a fixed, externally settable amount of free memory.
///
/// Used by tests and by deployments that want routing decisions pinned.
#[derive(Debug, Clone)]
pub struct FixedMemoryProbe {
    total: u64,
    free: Arc<AtomicU64>,
    reclaim_calls: Arc<AtomicU64>,
}

impl FixedMemoryProbe {
    /// Create a probe reporting `free` bytes free out of `total`.
    pub fn new(total: u64, free: u64) -> Self {
        Self {
            total,
            free: Arc::new(AtomicU64::new(free.min(total))),
            reclaim_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Change the reported free memory.
    pub fn set_free(&self, free: u64) {
        self.free.store(free.min(self.total), Ordering::SeqCst);
    }

    /// Number of times [`MemoryProbe::reclaim`] was invoked.
    pub fn reclaim_calls(&self) -> u64 {
        self.reclaim_calls.load(Ordering::SeqCst)
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn total_bytes(&self) -> u64 {
        self.total
    }

    fn free_bytes(&self) -> u64 {
        self.free.load(Ordering::SeqCst)
    }

    fn reclaim(&self) {
        self.reclaim_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Point-in-time memory snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    /// Total bytes visible to the process.
    pub total_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
    /// Bytes free.
    pub free_bytes: u64,
    /// `used / total` as a percentage in `[0, 100]`.
    pub used_percent: f64,
}

impl MemoryStats {
    /// One-line human readable summary.
    pub fn format(&self) -> String {
        format!(
            "memory: used={}MB ({:.1}%), free={}MB, total={}MB",
            self.used_bytes / MIB,
            self.used_percent,
            self.free_bytes / MIB,
            self.total_bytes / MIB
        )
    }
}

/// Admission control for model-sized allocations.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Clone)]
pub struct ResourceAccountant {
    probe: Arc<dyn MemoryProbe>,
    safety_margin: u64,
}

impl std::fmt::Debug for ResourceAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAccountant")
            .field("safety_margin", &self.safety_margin)
            .finish()
    }
}

impl ResourceAccountant {
    /// Create an accountant over `probe` with the default 512 MiB margin.
    pub fn new(probe: Arc<dyn MemoryProbe>) -> Self {
        Self::with_safety_margin(probe, DEFAULT_SAFETY_MARGIN)
    }

    /// Create an accountant with an explicit safety margin in bytes.
    pub fn with_safety_margin(probe: Arc<dyn MemoryProbe>, safety_margin: u64) -> Self {
        Self {
            probe,
            safety_margin,
        }
    }

    /// Accountant over the host's real memory.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemMemoryProbe::new()))
    }

    /// The configured safety margin in bytes.
    pub fn safety_margin(&self) -> u64 {
        self.safety_margin
    }

    /// Current free memory in bytes.
    pub fn free_memory(&self) -> u64 {
        self.probe.free_bytes()
    }

    /// Whether `size_bytes` can be allocated while keeping the safety margin.
    ///
    /// True iff `free - size >= margin`. An allocation larger than the free
    /// memory is never admitted.
    pub fn can_admit(&self, size_bytes: u64) -> bool {
        let free = self.free_memory();
        let admitted = free
            .checked_sub(size_bytes)
            .is_some_and(|after| after >= self.safety_margin);

        if admitted {
            debug!(
                need_mb = size_bytes / MIB,
                free_mb = free / MIB,
                "memory check passed"
            );
        } else {
            warn!(
                need_mb = size_bytes / MIB,
                free_mb = free / MIB,
                margin_mb = self.safety_margin / MIB,
                "insufficient memory for allocation"
            );
        }
        admitted
    }

    /// Ask the probe to reclaim memory. Last resort before giving up.
    pub fn suggest_reclaim(&self) {
        let before = self.free_memory();
        self.probe.reclaim();
        let after = self.free_memory();
        debug!(
            freed_mb = after.saturating_sub(before) / MIB,
            "memory reclaim suggested"
        );
    }

    /// Snapshot of total, used and free memory.
    pub fn stats(&self) -> MemoryStats {
        let total = self.probe.total_bytes();
        let free = self.probe.free_bytes().min(total);
        let used = total - free;
        let used_percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };
        MemoryStats {
            total_bytes: total,
            used_bytes: used,
            free_bytes: free,
            used_percent,
        }
    }
}
