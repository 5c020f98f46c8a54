use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::sync::Arc;
use std::path::Path;
use anyhow::Result;

/// One staged mutation: `Some(value)` writes, `None` deletes.
pub type KvWrite = (Vec<u8>, Option<Vec<u8>>);

#[derive(Clone)]
pub struct KvStore {
    db: Arc<DB>,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db: Arc::new(db),
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let val = self.db.get(key)?;
        Ok(val)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key)?;
        Ok(())
    }

    /// Apply every write in one atomic batch.
    pub fn write_batch(&self, writes: Vec<KvWrite>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for (key, value) in writes {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        // Seek iterator rather than prefix_iterator: no prefix extractor is configured.
        let iter = self.db.iterator(IteratorMode::From(prefix, Direction::Forward));
        let mut results = Vec::new();
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    /// Count keys under `prefix` without copying values out.
    pub fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let iter = self.db.iterator(IteratorMode::From(prefix, Direction::Forward));
        let mut count = 0;
        for item in iter {
            let (k, _) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn estimate_num_keys(&self) -> Result<Option<u64>> {
        Ok(self.db.property_int_value("rocksdb.estimate-num-keys")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_kv_store() -> Result<()> {
        let temp_dir = tempdir()?;
        let kv = KvStore::open(temp_dir.path())?;

        kv.put(b"key1", b"value1")?;
        assert_eq!(kv.get(b"key1")?, Some(b"value1".to_vec()));
        assert_eq!(kv.get(b"key2")?, None);

        kv.delete(b"key1")?;
        assert_eq!(kv.get(b"key1")?, None);
        Ok(())
    }

    #[test]
    fn test_write_batch_and_scan() -> Result<()> {
        let temp_dir = tempdir()?;
        let kv = KvStore::open(temp_dir.path())?;

        kv.put(b"a:0", b"stale")?;
        kv.write_batch(vec![
            (b"a:0".to_vec(), None),
            (b"a:1".to_vec(), Some(b"val1".to_vec())),
            (b"a:2".to_vec(), Some(b"val2".to_vec())),
            (b"b:1".to_vec(), Some(b"val3".to_vec())),
        ])?;

        let a_results = kv.scan(b"a:")?;
        assert_eq!(a_results.len(), 2);
        assert_eq!(a_results[0].0, b"a:1".to_vec());
        assert_eq!(a_results[1].0, b"a:2".to_vec());

        assert_eq!(kv.count_prefix(b"b:")?, 1);
        assert_eq!(kv.count_prefix(b"c:")?, 0);
        Ok(())
    }
}
