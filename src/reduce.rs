use crate::codec::{
    read_key_record, read_weighted_record, write_weighted_record, NumericType, RecordCodec, Scalar,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::naming;
use crate::stream::{FileReader, FileWriter};
use crate::table::KeyTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceMode {
    /// Count arrivals per key.
    Occurrence,
    /// Sum the weight carried by each arrival.
    WeightSum,
}

/// Aggregates one partition's key buckets. The reducer owns partition
/// `worker` and drains `.key_set{worker}.client{j}` for every source
/// client j in the job's range.
pub struct Reducer<'a> {
    config: &'a EngineConfig,
    codec: &'a dyn RecordCodec,
    work_dir: &'a str,
    worker: usize,
    max_key_bytes: usize,
    mode: ReduceMode,
    ty: NumericType,
}

impl<'a> Reducer<'a> {
    pub fn new(
        config: &'a EngineConfig,
        codec: &'a dyn RecordCodec,
        work_dir: &'a str,
        worker: usize,
        max_key_bytes: usize,
        mode: ReduceMode,
        ty: NumericType,
    ) -> Self {
        Self {
            config,
            codec,
            work_dir,
            worker,
            max_key_bytes,
            mode,
            ty,
        }
    }

    fn bucket(&self, client: usize) -> Result<FileReader> {
        FileReader::with_capacity(
            naming::key_bucket(self.work_dir, self.worker, client),
            self.config.io_buffer_bytes,
        )
    }

    /// One record from a bucket file: the key plus the weight it
    /// contributes under the current mode.
    fn next_contribution(&self, reader: &mut FileReader) -> Result<Option<(Vec<u8>, Scalar)>> {
        match self.mode {
            ReduceMode::Occurrence => Ok(read_key_record(reader, self.max_key_bytes)?
                .map(|key| (key, self.ty.one()))),
            ReduceMode::WeightSum => {
                read_weighted_record(reader, self.max_key_bytes, self.ty)
            }
        }
    }

    fn load(&self, range_start: usize, range_end: usize) -> Result<KeyTable<Scalar>> {
        let mut table = KeyTable::with_budget(self.config.table_budget);
        for client in range_start..range_end {
            let mut reader = self.bucket(client)?;
            while let Some((key, weight)) = self.next_contribution(&mut reader)? {
                let slot = table.upsert_with(&key, || self.ty.zero())?;
                slot.accumulate(weight)?;
            }
        }
        Ok(table)
    }

    /// Writes one aggregate per unique key, in first-arrival order, to
    /// `{output_dir}{worker}`. Returns the unique key count.
    pub fn reduce_distinct(
        &self,
        range_start: usize,
        range_end: usize,
        output_dir: &str,
    ) -> Result<u64> {
        let table = self.load(range_start, range_end)?;
        let mut writer = FileWriter::with_capacity(
            naming::block_file(output_dir, self.worker),
            self.config.io_buffer_bytes,
        )?;
        for (key, aggregate) in table.iter() {
            self.codec.write_aggregate(&mut writer, key, *aggregate)?;
        }
        writer.finish()?;
        tracing::info!(
            keys = table.len(),
            table_bytes = table.used_bytes(),
            worker = self.worker,
            "reduced distinct keys"
        );
        Ok(table.len() as u64)
    }

    /// Re-scans every bucket and writes each record back out tagged with
    /// its key's full aggregate, order preserved, one
    /// `.mapped_set{worker}.client{j}` per source bucket. Returns the
    /// record count written.
    pub fn tag_duplicates(&self, range_start: usize, range_end: usize) -> Result<u64> {
        let table = self.load(range_start, range_end)?;
        let mut records = 0u64;
        for client in range_start..range_end {
            let mut reader = self.bucket(client)?;
            let mut writer = FileWriter::with_capacity(
                naming::mapped_bucket(self.work_dir, self.worker, client),
                self.config.io_buffer_bytes,
            )?;
            while let Some((key, _)) = self.next_contribution(&mut reader)? {
                let aggregate = table.get(&key).copied().ok_or_else(|| {
                    Error::InvalidState(format!(
                        "key absent from the aggregate table on re-scan of client {}",
                        client
                    ))
                })?;
                write_weighted_record(&mut writer, &key, aggregate)?;
                records += 1;
            }
            writer.finish()?;
        }
        tracing::info!(
            records,
            keys = table.len(),
            worker = self.worker,
            "tagged duplicate keys"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BaseCodec;
    use tempfile::TempDir;

    fn write_key_bucket(work_dir: &str, partition: usize, client: usize, keys: &[&[u8]]) {
        let mut writer =
            FileWriter::create(naming::key_bucket(work_dir, partition, client)).unwrap();
        for key in keys {
            crate::codec::write_key_record(&mut writer, key).unwrap();
        }
        writer.finish().unwrap();
    }

    fn write_weighted_bucket(
        work_dir: &str,
        partition: usize,
        client: usize,
        records: &[(&[u8], Scalar)],
    ) {
        let mut writer =
            FileWriter::create(naming::key_bucket(work_dir, partition, client)).unwrap();
        for (key, weight) in records {
            write_weighted_record(&mut writer, key, *weight).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_aggregates(path: &std::path::Path, ty: NumericType) -> Vec<(Vec<u8>, Scalar)> {
        let mut reader = FileReader::open(path).unwrap();
        let mut out = Vec::new();
        while let Some(pair) = read_weighted_record(&mut reader, 64, ty).unwrap() {
            out.push(pair);
        }
        out
    }

    #[test]
    fn test_occurrence_counts_in_first_arrival_order() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_key_bucket(&work_dir, 0, 0, &[b"A", b"B", b"A", b"C", b"B", b"A"]);

        let config = EngineConfig::default();
        let reducer = Reducer::new(
            &config,
            &BaseCodec,
            &work_dir,
            0,
            16,
            ReduceMode::Occurrence,
            NumericType::Int32,
        );
        let keys = reducer.reduce_distinct(0, 1, &out_dir).unwrap();
        assert_eq!(keys, 3);

        let got = read_aggregates(&naming::block_file(&out_dir, 0), NumericType::Int32);
        assert_eq!(
            got,
            vec![
                (b"A".to_vec(), Scalar::Int32(3)),
                (b"B".to_vec(), Scalar::Int32(2)),
                (b"C".to_vec(), Scalar::Int32(1)),
            ]
        );
    }

    #[test]
    fn test_weight_sum_handles_negative_weights() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_weighted_bucket(
            &work_dir,
            2,
            0,
            &[
                (b"A", Scalar::Int64(10)),
                (b"B", Scalar::Int64(-3)),
                (b"A", Scalar::Int64(5)),
            ],
        );

        let config = EngineConfig::default();
        let reducer = Reducer::new(
            &config,
            &BaseCodec,
            &work_dir,
            2,
            16,
            ReduceMode::WeightSum,
            NumericType::Int64,
        );
        reducer.reduce_distinct(0, 1, &out_dir).unwrap();

        let got = read_aggregates(&naming::block_file(&out_dir, 2), NumericType::Int64);
        assert_eq!(
            got,
            vec![
                (b"A".to_vec(), Scalar::Int64(15)),
                (b"B".to_vec(), Scalar::Int64(-3)),
            ]
        );
    }

    #[test]
    fn test_float_weights_sum_exactly() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_weighted_bucket(
            &work_dir,
            0,
            0,
            &[
                (b"x", Scalar::Float32(1.5)),
                (b"x", Scalar::Float32(2.25)),
            ],
        );

        let config = EngineConfig::default();
        let reducer = Reducer::new(
            &config,
            &BaseCodec,
            &work_dir,
            0,
            16,
            ReduceMode::WeightSum,
            NumericType::Float32,
        );
        reducer.reduce_distinct(0, 1, &out_dir).unwrap();

        let got = read_aggregates(&naming::block_file(&out_dir, 0), NumericType::Float32);
        assert_eq!(got, vec![(b"x".to_vec(), Scalar::Float32(3.75))]);
    }

    #[test]
    fn test_multiple_clients_feed_one_table() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_key_bucket(&work_dir, 1, 0, &[b"north", b"south"]);
        write_key_bucket(&work_dir, 1, 1, &[b"south", b"east"]);

        let config = EngineConfig::default();
        let reducer = Reducer::new(
            &config,
            &BaseCodec,
            &work_dir,
            1,
            16,
            ReduceMode::Occurrence,
            NumericType::Int32,
        );
        reducer.reduce_distinct(0, 2, &out_dir).unwrap();

        let got = read_aggregates(&naming::block_file(&out_dir, 1), NumericType::Int32);
        assert_eq!(
            got,
            vec![
                (b"north".to_vec(), Scalar::Int32(1)),
                (b"south".to_vec(), Scalar::Int32(2)),
                (b"east".to_vec(), Scalar::Int32(1)),
            ]
        );
    }

    #[test]
    fn test_tag_duplicates_preserves_bucket_order() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        write_key_bucket(&work_dir, 0, 0, &[b"A", b"B", b"A"]);

        let config = EngineConfig::default();
        let reducer = Reducer::new(
            &config,
            &BaseCodec,
            &work_dir,
            0,
            16,
            ReduceMode::Occurrence,
            NumericType::Int32,
        );
        let records = reducer.tag_duplicates(0, 1).unwrap();
        assert_eq!(records, 3);

        let got = read_aggregates(
            &naming::mapped_bucket(&work_dir, 0, 0),
            NumericType::Int32,
        );
        assert_eq!(
            got,
            vec![
                (b"A".to_vec(), Scalar::Int32(2)),
                (b"B".to_vec(), Scalar::Int32(1)),
                (b"A".to_vec(), Scalar::Int32(2)),
            ]
        );
    }

    #[test]
    fn test_table_budget_is_fatal() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();
        write_key_bucket(
            &work_dir,
            0,
            0,
            &[b"first unique key", b"second unique key", b"third unique key"],
        );

        let config = EngineConfig::default().table_budget(48);
        let reducer = Reducer::new(
            &config,
            &BaseCodec,
            &work_dir,
            0,
            64,
            ReduceMode::Occurrence,
            NumericType::Int32,
        );
        assert!(matches!(
            reducer.reduce_distinct(0, 1, &out_dir),
            Err(Error::MemoryBudget { .. })
        ));
    }

    #[test]
    fn test_missing_bucket_is_an_open_error() {
        let dir = TempDir::new().unwrap();
        let work_dir = dir.path().join("mr").to_str().unwrap().to_string();
        let out_dir = dir.path().join("out.").to_str().unwrap().to_string();

        let config = EngineConfig::default();
        let reducer = Reducer::new(
            &config,
            &BaseCodec,
            &work_dir,
            0,
            16,
            ReduceMode::Occurrence,
            NumericType::Int32,
        );
        assert!(matches!(
            reducer.reduce_distinct(0, 1, &out_dir),
            Err(Error::Open(_, _))
        ));
    }
}
