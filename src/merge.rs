use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

use crate::codec::RecordCodec;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::naming;
use crate::stream::{FileReader, FileWriter};

/// Ordering applied to the leading prefix of each record. Prefix order
/// pairs with the radix sorter, codec order with the comparator sorter;
/// a merge must run under the same order its input blocks were sorted by.
#[derive(Clone)]
pub enum MergeOrder {
    Lexicographic,
    Codec(Arc<dyn RecordCodec>),
}

impl MergeOrder {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            MergeOrder::Lexicographic => a.cmp(b),
            MergeOrder::Codec(codec) => codec.compare(a, b),
        }
    }
}

struct HeapEntry {
    record: Vec<u8>,
    source: usize,
    prefix_bytes: usize,
    order: Rc<MergeOrder>,
}

impl HeapEntry {
    fn prefix(&self) -> &[u8] {
        &self.record[..self.prefix_bytes]
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum; reverse so the smallest record,
        // lowest source on ties, comes out first
        self.order
            .compare(self.prefix(), other.prefix())
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// K-way merge of sorted record blocks into one output stream. One record
/// per live block sits in the heap; popping refills from the popped block.
pub struct BlockMerger<'a> {
    config: &'a EngineConfig,
    record_bytes: usize,
    prefix_bytes: usize,
    order: MergeOrder,
}

impl<'a> BlockMerger<'a> {
    pub fn new(
        config: &'a EngineConfig,
        record_bytes: usize,
        prefix_bytes: usize,
        order: MergeOrder,
    ) -> Result<Self> {
        if record_bytes == 0 {
            return Err(Error::InvalidOperation("record size must be nonzero".into()));
        }
        if prefix_bytes == 0 || prefix_bytes > record_bytes {
            return Err(Error::InvalidOperation(format!(
                "compare prefix {} outside 1..={}",
                prefix_bytes, record_bytes
            )));
        }
        Ok(Self {
            config,
            record_bytes,
            prefix_bytes,
            order,
        })
    }

    /// Merges blocks `{input_prefix}{i}` for i in `[range_start, range_end)`
    /// into `output_path`. Worker 0 reports progress at the configured
    /// interval. Returns the record count written.
    pub fn merge_blocks(
        &self,
        input_prefix: &str,
        range_start: usize,
        range_end: usize,
        output_path: &str,
        worker: usize,
    ) -> Result<u64> {
        if range_start >= range_end {
            return Err(Error::InvalidOperation(format!(
                "empty block range {}..{}",
                range_start, range_end
            )));
        }
        let shared = Rc::new(self.order.clone());
        let mut sources = (range_start..range_end)
            .map(|block| {
                FileReader::with_capacity(
                    naming::block_file(input_prefix, block),
                    self.config.io_buffer_bytes,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let mut writer = FileWriter::with_capacity(output_path, self.config.io_buffer_bytes)?;

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source, reader) in sources.iter_mut().enumerate() {
            let mut record = vec![0u8; self.record_bytes];
            if reader.try_fill("merge record", &mut record)? {
                heap.push(HeapEntry {
                    record,
                    source,
                    prefix_bytes: self.prefix_bytes,
                    order: Rc::clone(&shared),
                });
            } else {
                tracing::warn!(block = range_start + source, "empty input block");
            }
        }

        let mut records = 0u64;
        while let Some(entry) = heap.pop() {
            writer
                .write_all(&entry.record)
                .map_err(|e| Error::Encode("merged record", e))?;
            records += 1;
            if worker == 0 && records % self.config.progress_interval == 0 {
                let consumed = sources
                    .iter()
                    .map(FileReader::fraction_consumed)
                    .sum::<f64>()
                    / sources.len() as f64;
                tracing::info!(records, mean_consumed = consumed, "merge progress");
            }

            let HeapEntry {
                mut record, source, ..
            } = entry;
            if sources[source].try_fill("merge record", &mut record)? {
                heap.push(HeapEntry {
                    record,
                    source,
                    prefix_bytes: self.prefix_bytes,
                    order: Rc::clone(&shared),
                });
            }
        }

        writer.finish()?;
        tracing::info!(
            records,
            blocks = sources.len(),
            worker,
            "merged sorted blocks"
        );
        Ok(records)
    }
}
