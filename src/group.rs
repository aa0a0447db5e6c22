use itertools::Itertools;

use crate::codec::{read_key_record, read_map_record, write_map_record, RecordCodec};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::naming;
use crate::stream::{FileReader, FileWriter};
use crate::table::KeyTable;

const NONE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct ValueNode {
    offset: usize,
    len: usize,
    next: u32,
}

/// Value bytes and chain links in two flat vectors; a chain head id lives
/// in the key table and each prepend links to the previous head.
#[derive(Debug, Default)]
struct ValueArena {
    data: Vec<u8>,
    nodes: Vec<ValueNode>,
}

impl ValueArena {
    fn prepend(&mut self, next: u32, value: &[u8]) -> u32 {
        let id = self.nodes.len() as u32;
        let offset = self.data.len();
        self.data.extend_from_slice(value);
        self.nodes.push(ValueNode {
            offset,
            len: value.len(),
            next,
        });
        id
    }

    fn value(&self, id: u32) -> &[u8] {
        let node = self.nodes[id as usize];
        &self.data[node.offset..node.offset + node.len]
    }

    fn next(&self, id: u32) -> u32 {
        self.nodes[id as usize].next
    }
}

/// Groups one partition's map buckets by key. The grouper owns partition
/// `worker` and drains `.map_set{worker}.client{j}` for every source
/// client j in the job's range. Chains hold values in reverse arrival
/// order; groups surface in first-arrival key order unless sorted.
pub struct Grouper<'a> {
    config: &'a EngineConfig,
    codec: &'a dyn RecordCodec,
    work_dir: &'a str,
    worker: usize,
    max_key_bytes: usize,
    max_value_bytes: usize,
}

impl<'a> Grouper<'a> {
    pub fn new(
        config: &'a EngineConfig,
        codec: &'a dyn RecordCodec,
        work_dir: &'a str,
        worker: usize,
        max_key_bytes: usize,
        max_value_bytes: usize,
    ) -> Self {
        Self {
            config,
            codec,
            work_dir,
            worker,
            max_key_bytes,
            max_value_bytes,
        }
    }

    fn load(&self, range_start: usize, range_end: usize) -> Result<(KeyTable<u32>, ValueArena)> {
        let mut table = KeyTable::with_budget(self.config.table_budget);
        let mut arena = ValueArena::default();
        for client in range_start..range_end {
            let mut reader = FileReader::with_capacity(
                naming::map_bucket(self.work_dir, self.worker, client),
                self.config.io_buffer_bytes,
            )?;
            while let Some((key, value)) =
                read_map_record(&mut reader, self.max_key_bytes, self.max_value_bytes)?
            {
                let head = table.upsert_with(&key, || NONE)?;
                *head = arena.prepend(*head, &value);
                table.charge(value.len() + std::mem::size_of::<ValueNode>())?;
            }
        }
        Ok((table, arena))
    }

    fn write_chain(
        &self,
        writer: &mut FileWriter,
        arena: &ValueArena,
        key: &[u8],
        head: u32,
    ) -> Result<u64> {
        let mut pairs = 0u64;
        let mut node = head;
        while node != NONE {
            self.codec.write_set(writer, key, arena.value(node))?;
            pairs += 1;
            node = arena.next(node);
        }
        Ok(pairs)
    }

    /// Writes every (key, value) pair grouped by key to
    /// `{output_dir}{worker}`, groups in first-arrival order. Returns the
    /// pair count.
    pub fn merge_set(&self, range_start: usize, range_end: usize, output_dir: &str) -> Result<u64> {
        let (table, arena) = self.load(range_start, range_end)?;
        let mut writer = FileWriter::with_capacity(
            naming::block_file(output_dir, self.worker),
            self.config.io_buffer_bytes,
        )?;
        let mut pairs = 0u64;
        for (key, &head) in table.iter() {
            pairs += self.write_chain(&mut writer, &arena, key, head)?;
        }
        writer.finish()?;
        tracing::info!(
            pairs,
            groups = table.len(),
            worker = self.worker,
            "merged map set"
        );
        Ok(pairs)
    }

    /// Sorted variant: groups surface in ascending order of the key packed
    /// into a little-endian u64. Keys of 8 bytes or more do not fit the
    /// packing and are rejected.
    pub fn merge_sorted_set(
        &self,
        range_start: usize,
        range_end: usize,
        output_dir: &str,
    ) -> Result<u64> {
        let (table, arena) = self.load(range_start, range_end)?;
        let mut keyed = Vec::with_capacity(table.len());
        for (key, &head) in table.iter() {
            if key.len() >= 8 {
                return Err(Error::SortedKeyTooLong { len: key.len() });
            }
            let mut packed = [0u8; 8];
            packed[..key.len()].copy_from_slice(key);
            keyed.push((u64::from_le_bytes(packed), key, head));
        }

        let mut writer = FileWriter::with_capacity(
            naming::block_file(output_dir, self.worker),
            self.config.io_buffer_bytes,
        )?;
        let mut pairs = 0u64;
        for (_, key, head) in keyed.into_iter().sorted_by_key(|&(packed, _, _)| packed) {
            pairs += self.write_chain(&mut writer, &arena, key, head)?;
        }
        writer.finish()?;
        tracing::info!(
            pairs,
            groups = table.len(),
            worker = self.worker,
            "merged sorted map set"
        );
        Ok(pairs)
    }

    /// Joins key buckets against the map table: each key occurrence in
    /// `.key_set{worker}.client{j}` is written to
    /// `.mapped_set{worker}.client{j}` with its chain-head value, order
    /// preserved. Key and map buckets must share one partitioning for the
    /// join to line up. Returns the record count.
    pub fn apply_maps(&self, range_start: usize, range_end: usize) -> Result<u64> {
        let (table, arena) = self.load(range_start, range_end)?;
        let mut records = 0u64;
        for client in range_start..range_end {
            let mut reader = FileReader::with_capacity(
                naming::key_bucket(self.work_dir, self.worker, client),
                self.config.io_buffer_bytes,
            )?;
            let mut writer = FileWriter::with_capacity(
                naming::mapped_bucket(self.work_dir, self.worker, client),
                self.config.io_buffer_bytes,
            )?;
            while let Some(key) = read_key_record(&mut reader, self.max_key_bytes)? {
                let head = table.get(&key).copied().ok_or_else(|| {
                    Error::JoinMismatch(String::from_utf8_lossy(&key).into_owned())
                })?;
                write_map_record(&mut writer, &key, arena.value(head))?;
                records += 1;
            }
            writer.finish()?;
        }
        tracing::info!(
            records,
            keys = table.len(),
            worker = self.worker,
            "applied maps to keys"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BaseCodec;
    use tempfile::TempDir;

    fn write_map_bucket(work_dir: &str, partition: usize, client: usize, pairs: &[(&[u8], &[u8])]) {
        let mut writer =
            FileWriter::create(naming::map_bucket(work_dir, partition, client)).unwrap();
        for (key, value) in pairs {
            write_map_record(&mut writer, key, value).unwrap();
        }
        writer.finish().unwrap();
    }

    fn write_key_bucket(work_dir: &str, partition: usize, client: usize, keys: &[&[u8]]) {
        let mut writer =
            FileWriter::create(naming::key_bucket(work_dir, partition, client)).unwrap();
        for key in keys {
            crate::codec::write_key_record(&mut writer, key).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_pairs(path: &std::path::Path) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut reader = FileReader::open(path).unwrap();
        let mut out = Vec::new();
        while let Some(pair) = read_map_record(&mut reader, 64, 64).unwrap() {
            out.push(pair);
        }
        out
    }

    fn pair(key: &[u8], value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        (key.to_vec(), value.to_vec())
    }

    #[test]
    fn test_merge_set_groups_with_reverse_arrival_chains() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_map_bucket(
            &work_dir,
            0,
            0,
            &[(b"A", b"one"), (b"B", b"left"), (b"A", b"two")],
        );

        let config = EngineConfig::default();
        let grouper = Grouper::new(&config, &BaseCodec, &work_dir, 0, 16, 16);
        let pairs_written = grouper.merge_set(0, 1, &out_dir).unwrap();
        assert_eq!(pairs_written, 3);

        // group A first (first arrival), values newest first
        assert_eq!(
            read_pairs(&naming::block_file(&out_dir, 0)),
            vec![
                pair(b"A", b"two"),
                pair(b"A", b"one"),
                pair(b"B", b"left"),
            ]
        );
    }

    #[test]
    fn test_merge_set_spans_clients_and_keeps_empty_values() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_map_bucket(&work_dir, 3, 0, &[(b"A", b"one")]);
        write_map_bucket(&work_dir, 3, 1, &[(b"A", b""), (b"C", b"c")]);

        let config = EngineConfig::default();
        let grouper = Grouper::new(&config, &BaseCodec, &work_dir, 3, 16, 16);
        let pairs_written = grouper.merge_set(0, 2, &out_dir).unwrap();
        assert_eq!(pairs_written, 3);

        assert_eq!(
            read_pairs(&naming::block_file(&out_dir, 3)),
            vec![pair(b"A", b""), pair(b"A", b"one"), pair(b"C", b"c")]
        );
    }

    #[test]
    fn test_sorted_set_orders_by_packed_key() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        // packed little-endian: "a"=97, "b"=98, "ab"=25185
        write_map_bucket(
            &work_dir,
            0,
            0,
            &[(b"b", b"2"), (b"ab", b"3"), (b"a", b"1")],
        );

        let config = EngineConfig::default();
        let grouper = Grouper::new(&config, &BaseCodec, &work_dir, 0, 16, 16);
        grouper.merge_sorted_set(0, 1, &out_dir).unwrap();

        assert_eq!(
            read_pairs(&naming::block_file(&out_dir, 0)),
            vec![pair(b"a", b"1"), pair(b"b", b"2"), pair(b"ab", b"3")]
        );
    }

    #[test]
    fn test_sorted_set_rejects_keys_that_overflow_the_packing() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_map_bucket(&work_dir, 0, 0, &[(b"sevchamp", b"v")]);

        let config = EngineConfig::default();
        let grouper = Grouper::new(&config, &BaseCodec, &work_dir, 0, 16, 16);
        match grouper.merge_sorted_set(0, 1, &out_dir) {
            Err(Error::SortedKeyTooLong { len }) => assert_eq!(len, 8),
            other => panic!("expected sorted-key rejection, got {:?}", other),
        }

        // seven bytes still fits
        write_map_bucket(&work_dir, 0, 0, &[(&b"sevchamp"[..7], b"v")]);
        assert_eq!(grouper.merge_sorted_set(0, 1, &out_dir).unwrap(), 1);
    }

    #[test]
    fn test_apply_maps_joins_every_occurrence() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        write_map_bucket(&work_dir, 0, 0, &[(b"A", b"x"), (b"B", b"y")]);
        write_key_bucket(&work_dir, 0, 0, &[b"A", b"B", b"A"]);

        let config = EngineConfig::default();
        let grouper = Grouper::new(&config, &BaseCodec, &work_dir, 0, 16, 16);
        let records = grouper.apply_maps(0, 1).unwrap();
        assert_eq!(records, 3);

        assert_eq!(
            read_pairs(&naming::mapped_bucket(&work_dir, 0, 0)),
            vec![pair(b"A", b"x"), pair(b"B", b"y"), pair(b"A", b"x")]
        );
    }

    #[test]
    fn test_apply_maps_uses_the_newest_mapping() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        write_map_bucket(&work_dir, 0, 0, &[(b"A", b"old"), (b"A", b"new")]);
        write_key_bucket(&work_dir, 0, 0, &[b"A"]);

        let config = EngineConfig::default();
        let grouper = Grouper::new(&config, &BaseCodec, &work_dir, 0, 16, 16);
        grouper.apply_maps(0, 1).unwrap();

        assert_eq!(
            read_pairs(&naming::mapped_bucket(&work_dir, 0, 0)),
            vec![pair(b"A", b"new")]
        );
    }

    #[test]
    fn test_apply_maps_flags_unmapped_keys() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        write_map_bucket(&work_dir, 0, 0, &[(b"A", b"x")]);
        write_key_bucket(&work_dir, 0, 0, &[b"A", b"rogue"]);

        let config = EngineConfig::default();
        let grouper = Grouper::new(&config, &BaseCodec, &work_dir, 0, 16, 16);
        match grouper.apply_maps(0, 1) {
            Err(Error::JoinMismatch(key)) => assert_eq!(key, "rogue"),
            other => panic!("expected join mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_chain_growth_hits_the_budget() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_map_bucket(
            &work_dir,
            0,
            0,
            &[
                (b"k", b"aaaaaaaaaaaaaaaa"),
                (b"k", b"bbbbbbbbbbbbbbbb"),
                (b"k", b"cccccccccccccccc"),
            ],
        );

        let config = EngineConfig::default().table_budget(80);
        let grouper = Grouper::new(&config, &BaseCodec, &work_dir, 0, 16, 16);
        assert!(matches!(
            grouper.merge_set(0, 1, &out_dir),
            Err(Error::MemoryBudget { .. })
        ));
    }
}
