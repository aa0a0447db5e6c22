use crate::hash::HashKind;

/// Per-process tuning for the engine. Job-specific parameters (paths,
/// partition counts, byte ranges) travel separately in a `JobSpec` so one
/// process can run many simulated workers with one config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Byte budget for in-memory key/group tables (default: 1MB)
    pub table_budget: usize,

    /// Byte budget for the radix bucket-head table; bounds the per-pass
    /// bit width (default: 2MB)
    pub radix_table_budget: usize,

    /// Buffer capacity for single-file streams (default: 64KB)
    pub io_buffer_bytes: usize,

    /// Routing hash used by the partitioner (default: CRC-64)
    pub hash: HashKind,

    /// Records between merge progress reports (default: 4,000,000)
    pub progress_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_budget: 1_000_000,
            radix_table_budget: 2 * 1024 * 1024, // 2MB
            io_buffer_bytes: 64 * 1024,          // 64KB
            hash: HashKind::default(),
            progress_interval: 4_000_000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key/group table byte budget
    pub fn table_budget(mut self, bytes: usize) -> Self {
        self.table_budget = bytes;
        self
    }

    /// Set the radix bucket-table byte budget
    pub fn radix_table_budget(mut self, bytes: usize) -> Self {
        self.radix_table_budget = bytes;
        self
    }

    /// Set the stream buffer capacity
    pub fn io_buffer_bytes(mut self, bytes: usize) -> Self {
        self.io_buffer_bytes = bytes;
        self
    }

    /// Select the routing hash
    pub fn hash(mut self, kind: HashKind) -> Self {
        self.hash = kind;
        self
    }

    /// Set the merge progress reporting interval
    pub fn progress_interval(mut self, records: u64) -> Self {
        self.progress_interval = records;
        self
    }

    /// Write buffer for one of `partitions` bucket files, sized so that
    /// all open buckets stay inside the table budget.
    pub fn bucket_buffer_bytes(&self, partitions: usize) -> usize {
        (self.table_budget / partitions.max(1)).clamp(4 * 1024, 960_000)
    }
}
