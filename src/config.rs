//! Tunable parameters for the heap, GC and scheduler.
//!
//! Plain data, no builder macro -- a flat struct of the knobs this runtime
//! actually reads, with no generational fields since this collector has no
//! generations.

/// Number of top-level pools: one per size class, `16 B` to
/// `512 MiB`.
pub const NUM_POOLS: usize = 26;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base virtual address of the managed heap. `None` lets the platform
    /// pick (the hosted `HostPageSource` reserves its own range).
    pub heap_base: Option<usize>,

    /// Number of cores the lock-region striping is sized for. Each pool gets
    /// exactly this many lock regions, so every region's try-lock contends
    /// with at most one other core.
    pub cpu_count: usize,

    /// Emit `log::debug!`/`log::trace!` diagnostics for heap and GC
    /// operations. Off by default: the log calls are cheap no-ops when
    /// disabled but the `Display` formatting inside them is not free on a
    /// hot allocation path.
    pub verbose: bool,

    /// New semaphore waiters queue LIFO instead of FIFO by default. The
    /// mutex's contended path always forces LIFO acquisition regardless of
    /// this flag, favouring a barging caller's shorter tail latency.
    pub semaphore_lifo: bool,

    /// Threshold, in outstanding handshake-acked threads, above which the
    /// conductor logs a stall warning while waiting on the current
    /// handshake. Diagnostic only.
    pub handshake_stall_warn_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heap_base: None,
            cpu_count: num_cpus(),
            verbose: false,
            semaphore_lifo: false,
            handshake_stall_warn_threads: 1,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
