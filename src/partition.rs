use std::path::{Path, PathBuf};

use byteorder::WriteBytesExt;

use crate::codec::{self, NumericType, RecordCodec};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hash::KeyHasher;
use crate::naming;
use crate::stream::{FileReader, FileWriter};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSummary {
    pub records: u64,
    pub payload_bytes: u64,
}

/// Routes records from one worker's input slice into per-partition bucket
/// files. Key-family passes also write the trace file that the restorer
/// later replays; the map pass does not, since map order is never restored.
pub struct Partitioner<'a> {
    config: &'a EngineConfig,
    codec: &'a dyn RecordCodec,
    hasher: &'a dyn KeyHasher,
    work_dir: &'a str,
    worker: usize,
    partitions: usize,
    max_key_bytes: usize,
    max_value_bytes: usize,
}

impl<'a> Partitioner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a EngineConfig,
        codec: &'a dyn RecordCodec,
        hasher: &'a dyn KeyHasher,
        work_dir: &'a str,
        worker: usize,
        partitions: usize,
        max_key_bytes: usize,
        max_value_bytes: usize,
    ) -> Result<Self> {
        // the trace encodes partition ids as single bytes
        if partitions == 0 || partitions > 256 {
            return Err(Error::InvalidOperation(format!(
                "partition count {} outside 1..=256",
                partitions
            )));
        }
        Ok(Self {
            config,
            codec,
            hasher,
            work_dir,
            worker,
            partitions,
            max_key_bytes,
            max_value_bytes,
        })
    }

    fn open_input(&self, data_path: &str, byte_offset: u64) -> Result<FileReader> {
        let mut input =
            FileReader::with_capacity(Path::new(data_path), self.config.io_buffer_bytes)?;
        input.seek_to(byte_offset)?;
        Ok(input)
    }

    fn open_buckets(&self, path_for: impl Fn(usize) -> PathBuf) -> Result<Vec<FileWriter>> {
        let buffer = self.config.bucket_buffer_bytes(self.partitions);
        (0..self.partitions)
            .map(|partition| FileWriter::with_capacity(path_for(partition), buffer))
            .collect()
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        // codecs decode; the bound is enforced here
        if key.len() > self.max_key_bytes {
            return Err(Error::SchemaViolation {
                kind: "key",
                len: key.len(),
                max: self.max_key_bytes,
            });
        }
        Ok(())
    }

    /// Distributes bare keys into `.key_set` buckets plus the trace file.
    pub fn distribute_keys(
        &self,
        data_path: &str,
        byte_offset: u64,
        span_bytes: u64,
    ) -> Result<PartitionSummary> {
        let mut input = self.open_input(data_path, byte_offset)?;
        let mut buckets =
            self.open_buckets(|p| naming::key_bucket(self.work_dir, p, self.worker))?;
        let mut trace = FileWriter::with_capacity(
            naming::trace_file(self.work_dir, self.worker),
            self.config.io_buffer_bytes,
        )?;

        let mut summary = PartitionSummary::default();
        let mut remaining = span_bytes as i64;
        while remaining > 0 {
            let key = match self.codec.read_key(&mut input, self.max_key_bytes)? {
                Some(key) => key,
                None => break,
            };
            self.check_key(&key)?;

            let bucket = self.hasher.partition(&key, self.partitions);
            trace
                .write_u8(bucket as u8)
                .map_err(|e| Error::Encode("trace byte", e))?;
            codec::write_key_record(&mut buckets[bucket], &key)?;

            remaining -= key.len() as i64;
            summary.records += 1;
            summary.payload_bytes += key.len() as u64;
        }

        for bucket in buckets {
            bucket.finish()?;
        }
        trace.finish()?;
        tracing::info!(
            records = summary.records,
            payload_bytes = summary.payload_bytes,
            partitions = self.partitions,
            worker = self.worker,
            "distributed keys"
        );
        Ok(summary)
    }

    /// Distributes (key, weight) pairs into `.key_set` buckets plus the
    /// trace file.
    pub fn distribute_key_weights(
        &self,
        data_path: &str,
        byte_offset: u64,
        span_bytes: u64,
        ty: NumericType,
    ) -> Result<PartitionSummary> {
        let mut input = self.open_input(data_path, byte_offset)?;
        let mut buckets =
            self.open_buckets(|p| naming::key_bucket(self.work_dir, p, self.worker))?;
        let mut trace = FileWriter::with_capacity(
            naming::trace_file(self.work_dir, self.worker),
            self.config.io_buffer_bytes,
        )?;

        let mut summary = PartitionSummary::default();
        let mut remaining = span_bytes as i64;
        while remaining > 0 {
            let (key, weight) = match self
                .codec
                .read_key_weight(&mut input, self.max_key_bytes, ty)?
            {
                Some(pair) => pair,
                None => break,
            };
            self.check_key(&key)?;

            let bucket = self.hasher.partition(&key, self.partitions);
            trace
                .write_u8(bucket as u8)
                .map_err(|e| Error::Encode("trace byte", e))?;
            codec::write_weighted_record(&mut buckets[bucket], &key, weight)?;

            let consumed = key.len() + ty.width();
            remaining -= consumed as i64;
            summary.records += 1;
            summary.payload_bytes += consumed as u64;
        }

        for bucket in buckets {
            bucket.finish()?;
        }
        trace.finish()?;
        tracing::info!(
            records = summary.records,
            payload_bytes = summary.payload_bytes,
            partitions = self.partitions,
            worker = self.worker,
            "distributed key weights"
        );
        Ok(summary)
    }

    /// Distributes (key, value) maps into `.map_set` buckets. No trace is
    /// written; construct with the map partition count.
    pub fn distribute_maps(
        &self,
        data_path: &str,
        byte_offset: u64,
        span_bytes: u64,
    ) -> Result<PartitionSummary> {
        let mut input = self.open_input(data_path, byte_offset)?;
        let mut buckets =
            self.open_buckets(|p| naming::map_bucket(self.work_dir, p, self.worker))?;

        let mut summary = PartitionSummary::default();
        let mut remaining = span_bytes as i64;
        while remaining > 0 {
            let (key, value) = match self
                .codec
                .read_map(&mut input, self.max_key_bytes, self.max_value_bytes)?
            {
                Some(pair) => pair,
                None => break,
            };
            self.check_key(&key)?;
            if value.len() > self.max_value_bytes {
                return Err(Error::SchemaViolation {
                    kind: "value",
                    len: value.len(),
                    max: self.max_value_bytes,
                });
            }

            let bucket = self.hasher.partition(&key, self.partitions);
            codec::write_map_record(&mut buckets[bucket], &key, &value)?;

            let consumed = key.len() + value.len();
            remaining -= consumed as i64;
            summary.records += 1;
            summary.payload_bytes += consumed as u64;
        }

        for bucket in buckets {
            bucket.finish()?;
        }
        tracing::info!(
            records = summary.records,
            payload_bytes = summary.payload_bytes,
            partitions = self.partitions,
            worker = self.worker,
            "distributed maps"
        );
        Ok(summary)
    }
}
