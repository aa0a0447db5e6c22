use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecRegistry, NumericType};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::group::Grouper;
use crate::merge::{BlockMerger, MergeOrder};
use crate::partition::Partitioner;
use crate::reduce::{ReduceMode, Reducer};
use crate::restore::OrderRestorer;
use crate::sort::BlockSorter;

/// Bound applied to variable payloads when a job leaves the maxima unset.
const RECORD_BOUND_DEFAULT: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    DistributeKeys,
    DistributeMaps,
    DistributeKeyWeight,
    FindKeyWeight,
    FindKeyOccurrence,
    ApplyMapsToKeys,
    MergeSet,
    FindDuplicateKeyWeight,
    FindDuplicateKeyOccurrence,
    OrderMappedSets,
    OrderMappedOccurrences,
    MergeSortedSet,
    CreateRadixSortedBlock,
    CreateQuickSortedBlock,
    MergeRadixSortedBlocks,
    MergeQuickSortedBlocks,
}

impl Operation {
    pub fn from_name(name: &str) -> Result<Self> {
        let operation = match name {
            "DistributeKeys" => Operation::DistributeKeys,
            "DistributeMaps" => Operation::DistributeMaps,
            "DistributeKeyWeight" => Operation::DistributeKeyWeight,
            "FindKeyWeight" => Operation::FindKeyWeight,
            "FindKeyOccurrence" => Operation::FindKeyOccurrence,
            "ApplyMapsToKeys" => Operation::ApplyMapsToKeys,
            "MergeSet" => Operation::MergeSet,
            "FindDuplicateKeyWeight" => Operation::FindDuplicateKeyWeight,
            "FindDuplicateKeyOccurrence" => Operation::FindDuplicateKeyOccurrence,
            "OrderMappedSets" => Operation::OrderMappedSets,
            "OrderMappedOccurrences" => Operation::OrderMappedOccurrences,
            "MergeSortedSet" => Operation::MergeSortedSet,
            "CreateRadixSortedBlock" => Operation::CreateRadixSortedBlock,
            "CreateQuickSortedBlock" => Operation::CreateQuickSortedBlock,
            "MergeRadixSortedBlocks" => Operation::MergeRadixSortedBlocks,
            "MergeQuickSortedBlocks" => Operation::MergeQuickSortedBlocks,
            _ => return Err(Error::UnknownOperation(name.to_string())),
        };
        Ok(operation)
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::DistributeKeys => "DistributeKeys",
            Operation::DistributeMaps => "DistributeMaps",
            Operation::DistributeKeyWeight => "DistributeKeyWeight",
            Operation::FindKeyWeight => "FindKeyWeight",
            Operation::FindKeyOccurrence => "FindKeyOccurrence",
            Operation::ApplyMapsToKeys => "ApplyMapsToKeys",
            Operation::MergeSet => "MergeSet",
            Operation::FindDuplicateKeyWeight => "FindDuplicateKeyWeight",
            Operation::FindDuplicateKeyOccurrence => "FindDuplicateKeyOccurrence",
            Operation::OrderMappedSets => "OrderMappedSets",
            Operation::OrderMappedOccurrences => "OrderMappedOccurrences",
            Operation::MergeSortedSet => "MergeSortedSet",
            Operation::CreateRadixSortedBlock => "CreateRadixSortedBlock",
            Operation::CreateQuickSortedBlock => "CreateQuickSortedBlock",
            Operation::MergeRadixSortedBlocks => "MergeRadixSortedBlocks",
            Operation::MergeQuickSortedBlocks => "MergeQuickSortedBlocks",
        }
    }
}

fn default_codec() -> String {
    "base".to_string()
}

fn default_partitions() -> usize {
    1
}

fn default_key_bound() -> usize {
    RECORD_BOUND_DEFAULT
}

fn default_value_bound() -> i64 {
    -1
}

/// One unit of work handed to a worker by the orchestrator. `data_path`
/// is the input for distribute and sort jobs and the output location for
/// everything downstream; sort jobs reuse `max_key_bytes` as the record
/// size and `max_value_bytes` as the comparison prefix, where a negative
/// prefix means the whole record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub operation: String,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default)]
    pub worker_id: usize,
    #[serde(default = "default_partitions")]
    pub key_partitions: usize,
    #[serde(default = "default_partitions")]
    pub map_partitions: usize,
    pub work_dir: String,
    pub data_path: String,
    #[serde(default)]
    pub range_start: usize,
    #[serde(default)]
    pub range_end: usize,
    #[serde(default = "default_key_bound")]
    pub max_key_bytes: usize,
    #[serde(default = "default_value_bound")]
    pub max_value_bytes: i64,
    #[serde(default)]
    pub byte_offset: u64,
    #[serde(default)]
    pub span_bytes: u64,
    #[serde(default)]
    pub numeric_type: NumericType,
}

impl JobSpec {
    fn value_bound(&self) -> usize {
        if self.max_value_bytes < 0 {
            RECORD_BOUND_DEFAULT
        } else {
            self.max_value_bytes as usize
        }
    }

    fn sort_prefix(&self) -> usize {
        if self.max_value_bytes <= 0 {
            self.max_key_bytes
        } else {
            self.max_value_bytes as usize
        }
    }
}

/// Resolves an operation name and codec, builds the component the job
/// needs, and runs it. Everything a job touches comes from the job spec
/// and the engine config; the dispatcher itself holds no per-job state.
pub struct Dispatcher {
    config: EngineConfig,
    registry: CodecRegistry,
}

impl Dispatcher {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: CodecRegistry::builtin(),
        }
    }

    pub fn with_registry(config: EngineConfig, registry: CodecRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one job to completion and returns its record count (unique
    /// keys for reduce-distinct jobs, records otherwise).
    pub fn run(&self, spec: &JobSpec) -> Result<u64> {
        let operation = Operation::from_name(&spec.operation)?;
        let codec = self.registry.resolve(&spec.codec)?;
        let hasher = self.config.hash.build();
        tracing::info!(
            operation = operation.name(),
            codec = spec.codec.as_str(),
            worker = spec.worker_id,
            "dispatching job"
        );

        match operation {
            Operation::DistributeKeys => Partitioner::new(
                &self.config,
                codec.as_ref(),
                hasher.as_ref(),
                &spec.work_dir,
                spec.worker_id,
                spec.key_partitions,
                spec.max_key_bytes,
                spec.value_bound(),
            )?
            .distribute_keys(&spec.data_path, spec.byte_offset, spec.span_bytes)
            .map(|summary| summary.records),

            Operation::DistributeKeyWeight => Partitioner::new(
                &self.config,
                codec.as_ref(),
                hasher.as_ref(),
                &spec.work_dir,
                spec.worker_id,
                spec.key_partitions,
                spec.max_key_bytes,
                spec.value_bound(),
            )?
            .distribute_key_weights(
                &spec.data_path,
                spec.byte_offset,
                spec.span_bytes,
                spec.numeric_type,
            )
            .map(|summary| summary.records),

            Operation::DistributeMaps => Partitioner::new(
                &self.config,
                codec.as_ref(),
                hasher.as_ref(),
                &spec.work_dir,
                spec.worker_id,
                spec.map_partitions,
                spec.max_key_bytes,
                spec.value_bound(),
            )?
            .distribute_maps(&spec.data_path, spec.byte_offset, spec.span_bytes)
            .map(|summary| summary.records),

            Operation::FindKeyOccurrence => self
                .reducer(spec, codec.as_ref(), ReduceMode::Occurrence)
                .reduce_distinct(spec.range_start, spec.range_end, &spec.data_path),

            Operation::FindKeyWeight => self
                .reducer(spec, codec.as_ref(), ReduceMode::WeightSum)
                .reduce_distinct(spec.range_start, spec.range_end, &spec.data_path),

            Operation::FindDuplicateKeyOccurrence => self
                .reducer(spec, codec.as_ref(), ReduceMode::Occurrence)
                .tag_duplicates(spec.range_start, spec.range_end),

            Operation::FindDuplicateKeyWeight => self
                .reducer(spec, codec.as_ref(), ReduceMode::WeightSum)
                .tag_duplicates(spec.range_start, spec.range_end),

            Operation::MergeSet => self
                .grouper(spec, codec.as_ref())
                .merge_set(spec.range_start, spec.range_end, &spec.data_path),

            Operation::MergeSortedSet => self
                .grouper(spec, codec.as_ref())
                .merge_sorted_set(spec.range_start, spec.range_end, &spec.data_path),

            Operation::ApplyMapsToKeys => self
                .grouper(spec, codec.as_ref())
                .apply_maps(spec.range_start, spec.range_end),

            Operation::OrderMappedSets => self
                .restorer(spec, codec.as_ref())?
                .restore_records(spec.range_start, spec.range_end, &spec.data_path),

            Operation::OrderMappedOccurrences => self
                .restorer(spec, codec.as_ref())?
                .restore_scalars(spec.range_start, spec.range_end, &spec.data_path),

            Operation::CreateRadixSortedBlock => BlockSorter::new(
                &self.config,
                codec.as_ref(),
                spec.max_key_bytes,
                spec.sort_prefix(),
            )?
            .radix_sort_block(
                &spec.data_path,
                spec.byte_offset,
                spec.span_bytes,
                &spec.work_dir,
                spec.worker_id,
            ),

            Operation::CreateQuickSortedBlock => BlockSorter::new(
                &self.config,
                codec.as_ref(),
                spec.max_key_bytes,
                spec.sort_prefix(),
            )?
            .quick_sort_block(
                &spec.data_path,
                spec.byte_offset,
                spec.span_bytes,
                &spec.work_dir,
                spec.worker_id,
            ),

            Operation::MergeRadixSortedBlocks => BlockMerger::new(
                &self.config,
                spec.max_key_bytes,
                spec.sort_prefix(),
                MergeOrder::Lexicographic,
            )?
            .merge_blocks(
                &spec.work_dir,
                spec.range_start,
                spec.range_end,
                &spec.data_path,
                spec.worker_id,
            ),

            Operation::MergeQuickSortedBlocks => BlockMerger::new(
                &self.config,
                spec.max_key_bytes,
                spec.sort_prefix(),
                MergeOrder::Codec(Arc::clone(&codec)),
            )?
            .merge_blocks(
                &spec.work_dir,
                spec.range_start,
                spec.range_end,
                &spec.data_path,
                spec.worker_id,
            ),
        }
    }

    fn reducer<'a>(
        &'a self,
        spec: &'a JobSpec,
        codec: &'a dyn crate::codec::RecordCodec,
        mode: ReduceMode,
    ) -> Reducer<'a> {
        Reducer::new(
            &self.config,
            codec,
            &spec.work_dir,
            spec.worker_id,
            spec.max_key_bytes,
            mode,
            spec.numeric_type,
        )
    }

    fn grouper<'a>(
        &'a self,
        spec: &'a JobSpec,
        codec: &'a dyn crate::codec::RecordCodec,
    ) -> Grouper<'a> {
        Grouper::new(
            &self.config,
            codec,
            &spec.work_dir,
            spec.worker_id,
            spec.max_key_bytes,
            spec.value_bound(),
        )
    }

    fn restorer<'a>(
        &'a self,
        spec: &'a JobSpec,
        codec: &'a dyn crate::codec::RecordCodec,
    ) -> Result<OrderRestorer<'a>> {
        OrderRestorer::new(
            &self.config,
            codec,
            &spec.work_dir,
            spec.worker_id,
            spec.key_partitions,
            spec.max_key_bytes,
            spec.value_bound(),
            spec.numeric_type,
        )
    }
}
