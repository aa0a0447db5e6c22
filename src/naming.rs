use std::path::PathBuf;

// File naming shared by every phase. The work prefix is an opaque string,
// not a directory: suffixes are appended to it verbatim.

/// Bucket of keys routed to `partition`, written by `worker`.
pub fn key_bucket(work_dir: &str, partition: usize, worker: usize) -> PathBuf {
    PathBuf::from(format!("{}.key_set{}.client{}", work_dir, partition, worker))
}

/// Bucket of key/value maps routed to `partition`, written by `worker`.
pub fn map_bucket(work_dir: &str, partition: usize, worker: usize) -> PathBuf {
    PathBuf::from(format!("{}.map_set{}.client{}", work_dir, partition, worker))
}

/// Per-client output of a tagging or join pass over partition `partition`.
pub fn mapped_bucket(work_dir: &str, partition: usize, worker: usize) -> PathBuf {
    PathBuf::from(format!("{}.mapped_set{}.client{}", work_dir, partition, worker))
}

/// Routing trace for `worker`: one byte per record, in arrival order.
pub fn trace_file(work_dir: &str, worker: usize) -> PathBuf {
    PathBuf::from(format!("{}.hash_node_set{}", work_dir, worker))
}

/// Sorted or merged block owned by `worker`.
pub fn block_file(prefix: &str, worker: usize) -> PathBuf {
    PathBuf::from(format!("{}{}", prefix, worker))
}
