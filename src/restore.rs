use crate::codec::{read_map_record, read_weighted_record, NumericType, RecordCodec};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::naming;
use crate::stream::{read_byte_or_eof, FileReader, FileWriter};

/// Replays partition traces to put reduced or mapped records back into
/// their original input order. For each client set in the range the trace
/// names, byte by byte, which partition's `.mapped_set` file holds the
/// next record; everything appends to one `{output_dir}{worker}` stream.
pub struct OrderRestorer<'a> {
    config: &'a EngineConfig,
    codec: &'a dyn RecordCodec,
    work_dir: &'a str,
    worker: usize,
    partitions: usize,
    max_key_bytes: usize,
    max_value_bytes: usize,
    ty: NumericType,
}

impl<'a> OrderRestorer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a EngineConfig,
        codec: &'a dyn RecordCodec,
        work_dir: &'a str,
        worker: usize,
        partitions: usize,
        max_key_bytes: usize,
        max_value_bytes: usize,
        ty: NumericType,
    ) -> Result<Self> {
        if partitions == 0 || partitions > 256 {
            return Err(Error::InvalidOperation(format!(
                "partition count {} outside 1..=256",
                partitions
            )));
        }
        Ok(Self {
            config,
            codec,
            work_dir,
            worker,
            partitions,
            max_key_bytes,
            max_value_bytes,
            ty,
        })
    }

    fn replay(
        &self,
        range_start: usize,
        range_end: usize,
        output_dir: &str,
        mut emit_one: impl FnMut(&mut FileReader, &mut FileWriter) -> Result<bool>,
    ) -> Result<u64> {
        let mut writer = FileWriter::with_capacity(
            naming::block_file(output_dir, self.worker),
            self.config.io_buffer_bytes,
        )?;
        let mut records = 0u64;
        for set in range_start..range_end {
            let mut trace = FileReader::with_capacity(
                naming::trace_file(self.work_dir, set),
                self.config.io_buffer_bytes,
            )?;
            let mut sources = (0..self.partitions)
                .map(|partition| {
                    FileReader::with_capacity(
                        naming::mapped_bucket(self.work_dir, partition, set),
                        self.config.io_buffer_bytes,
                    )
                })
                .collect::<Result<Vec<_>>>()?;

            while let Some(byte) = read_byte_or_eof(&mut trace)? {
                let partition = byte as usize;
                if partition >= self.partitions {
                    return Err(Error::TraceMismatch(format!(
                        "trace for set {} names partition {} of {}",
                        set, partition, self.partitions
                    )));
                }
                if !emit_one(&mut sources[partition], &mut writer)? {
                    return Err(Error::TraceMismatch(format!(
                        "partition {} of set {} ran out of records mid-trace",
                        partition, set
                    )));
                }
                records += 1;
            }
        }
        writer.finish()?;
        Ok(records)
    }

    /// Restores full (key, value) records, emitting through the codec's
    /// final map writer.
    pub fn restore_records(
        &self,
        range_start: usize,
        range_end: usize,
        output_dir: &str,
    ) -> Result<u64> {
        let records = self.replay(range_start, range_end, output_dir, |source, writer| {
            match read_map_record(source, self.max_key_bytes, self.max_value_bytes)? {
                Some((key, value)) => {
                    self.codec.write_map(writer, &key, &value)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;
        tracing::info!(records, worker = self.worker, "restored mapped records");
        Ok(records)
    }

    /// Restores (key, scalar) records, emitting through the codec's
    /// aggregate writer.
    pub fn restore_scalars(
        &self,
        range_start: usize,
        range_end: usize,
        output_dir: &str,
    ) -> Result<u64> {
        let records = self.replay(range_start, range_end, output_dir, |source, writer| {
            match read_weighted_record(source, self.max_key_bytes, self.ty)? {
                Some((key, weight)) => {
                    self.codec.write_aggregate(writer, &key, weight)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;
        tracing::info!(records, worker = self.worker, "restored scalar records");
        Ok(records)
    }
}
