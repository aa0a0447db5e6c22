use std::io::Write;
use std::path::Path;

use crate::codec::RecordCodec;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::naming;
use crate::stream::{FileReader, FileWriter};

const NONE: u32 = u32::MAX;

/// Sorts one in-memory block of fixed-size records by a leading prefix and
/// writes the result to `{output_prefix}{worker}`. The radix variant is a
/// stable LSD sort over chained buckets; the comparator variant defers to
/// the codec's ordering and makes no stability promise.
pub struct BlockSorter<'a> {
    config: &'a EngineConfig,
    codec: &'a dyn RecordCodec,
    record_bytes: usize,
    prefix_bytes: usize,
}

impl<'a> BlockSorter<'a> {
    pub fn new(
        config: &'a EngineConfig,
        codec: &'a dyn RecordCodec,
        record_bytes: usize,
        prefix_bytes: usize,
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
            codec,
            record_bytes,
            prefix_bytes,
        })
    }

    pub fn radix_sort_block(
        &self,
        data_path: &str,
        byte_offset: u64,
        span_bytes: u64,
        output_prefix: &str,
        worker: usize,
    ) -> Result<u64> {
        let data = self.load(data_path, byte_offset, span_bytes)?;
        let order = self.radix_order(&data, self.record_count(&data)?);
        let records = self.write_block(output_prefix, worker, &data, &order)?;
        tracing::info!(records, worker, "radix sorted block");
        Ok(records)
    }

    pub fn quick_sort_block(
        &self,
        data_path: &str,
        byte_offset: u64,
        span_bytes: u64,
        output_prefix: &str,
        worker: usize,
    ) -> Result<u64> {
        let data = self.load(data_path, byte_offset, span_bytes)?;
        let order = self.comparator_order(&data, self.record_count(&data)?);
        let records = self.write_block(output_prefix, worker, &data, &order)?;
        tracing::info!(records, worker, "comparator sorted block");
        Ok(records)
    }

    fn load(&self, data_path: &str, byte_offset: u64, span_bytes: u64) -> Result<Vec<u8>> {
        if span_bytes % self.record_bytes as u64 != 0 {
            return Err(Error::InvalidOperation(format!(
                "span {} is not a multiple of the record size {}",
                span_bytes, self.record_bytes
            )));
        }
        let mut input =
            FileReader::with_capacity(Path::new(data_path), self.config.io_buffer_bytes)?;
        input.seek_to(byte_offset)?;
        let mut data = vec![0u8; span_bytes as usize];
        input.fill("sort block", &mut data)?;
        Ok(data)
    }

    fn record_count(&self, data: &[u8]) -> Result<usize> {
        let count = data.len() / self.record_bytes;
        // record ids and chain links are u32, NONE reserved
        if count >= NONE as usize {
            return Err(Error::InvalidOperation(format!(
                "block of {} records exceeds the addressable maximum",
                count
            )));
        }
        Ok(count)
    }

    /// Widest pass that keeps both bucket index arrays inside the table
    /// budget, capped at 24 bits.
    fn pass_width(&self) -> usize {
        let mut bits = 1;
        while bits < 24
            && (1usize << (bits + 1)) * 2 * std::mem::size_of::<u32>()
                <= self.config.radix_table_budget
        {
            bits += 1;
        }
        bits
    }

    fn radix_order(&self, data: &[u8], count: usize) -> Vec<u32> {
        let total_bits = self.prefix_bytes * 8;
        let width = self.pass_width();
        let mut order: Vec<u32> = (0..count as u32).collect();
        let mut next = vec![NONE; count];
        let mut heads = vec![NONE; 1 << width];
        let mut tails = vec![NONE; 1 << width];

        // least significant slice first; each pass appends in the order the
        // previous pass produced, which keeps equal prefixes stable
        let mut low_bit = 0;
        while low_bit < total_bits {
            let pass_bits = width.min(total_bits - low_bit);
            let live = 1usize << pass_bits;
            heads[..live].fill(NONE);
            tails[..live].fill(NONE);

            for &id in &order {
                let at = id as usize * self.record_bytes;
                let prefix = &data[at..at + self.prefix_bytes];
                let bucket = bucket_of(prefix, low_bit, pass_bits);
                next[id as usize] = NONE;
                if tails[bucket] == NONE {
                    heads[bucket] = id;
                } else {
                    next[tails[bucket] as usize] = id;
                }
                tails[bucket] = id;
            }

            let mut at = 0;
            for &head in &heads[..live] {
                let mut id = head;
                while id != NONE {
                    order[at] = id;
                    at += 1;
                    id = next[id as usize];
                }
            }
            low_bit += pass_bits;
        }
        order
    }

    fn comparator_order(&self, data: &[u8], count: usize) -> Vec<u32> {
        let record = self.record_bytes;
        let prefix = self.prefix_bytes;
        let mut order: Vec<u32> = (0..count as u32).collect();
        order.sort_unstable_by(|&a, &b| {
            let a = &data[a as usize * record..][..prefix];
            let b = &data[b as usize * record..][..prefix];
            self.codec.compare(a, b)
        });
        order
    }

    fn write_block(
        &self,
        output_prefix: &str,
        worker: usize,
        data: &[u8],
        order: &[u32],
    ) -> Result<u64> {
        let mut writer = FileWriter::with_capacity(
            naming::block_file(output_prefix, worker),
            self.config.io_buffer_bytes,
        )?;
        for &id in order {
            let at = id as usize * self.record_bytes;
            writer
                .write_all(&data[at..at + self.record_bytes])
                .map_err(|e| Error::Encode("sorted record", e))?;
        }
        writer.finish()?;
        Ok(order.len() as u64)
    }
}

/// Reads `width` bits of the prefix starting `low_bit` bits above its least
/// significant end, with the prefix interpreted as a big-endian integer.
fn bucket_of(prefix: &[u8], low_bit: usize, width: usize) -> usize {
    let mut value = 0usize;
    let mut got = 0;
    while got < width {
        let bit = low_bit + got;
        let byte = prefix[prefix.len() - 1 - bit / 8] as usize;
        let shift = bit % 8;
        let take = (8 - shift).min(width - got);
        value |= ((byte >> shift) & ((1 << take) - 1)) << got;
        got += take;
    }
    value
}
