use anyhow::{anyhow, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

const FLAG_PLAIN: u8 = 0;
const FLAG_GZIP: u8 = 1;

/// JSON payload behind a one-byte header saying whether it was gzipped.
#[derive(Debug, Clone, Copy)]
pub struct CacheCodec {
    compression: bool,
    threshold: usize,
}

impl CacheCodec {
    pub fn new(compression: bool, threshold: usize) -> Self {
        Self { compression, threshold }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        if self.compression && json.len() > self.threshold {
            let mut enc = GzEncoder::new(vec![FLAG_GZIP], Compression::default());
            enc.write_all(&json)?;
            return Ok(enc.finish()?);
        }
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(FLAG_PLAIN);
        out.extend_from_slice(&json);
        Ok(out)
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match bytes.split_first() {
            Some((&FLAG_PLAIN, body)) => Ok(serde_json::from_slice(body)?),
            Some((&FLAG_GZIP, body)) => {
                let mut json = Vec::new();
                GzDecoder::new(body).read_to_end(&mut json)?;
                Ok(serde_json::from_slice(&json)?)
            }
            Some((flag, _)) => Err(anyhow!("unknown cache payload flag {}", flag)),
            None => Err(anyhow!("empty cache payload")),
        }
    }
}

pub(crate) fn is_compressed(bytes: &[u8]) -> bool {
    bytes.first() == Some(&FLAG_GZIP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_small_values_stay_plain() {
        let codec = CacheCodec::new(true, 1024);
        let bytes = codec.encode(&json!({ "a": 1 })).unwrap();
        assert!(!is_compressed(&bytes));
        assert_eq!(codec.decode::<Value>(&bytes).unwrap(), json!({ "a": 1 }));
    }

    #[test]
    fn test_large_values_compress_and_round_trip() {
        let codec = CacheCodec::new(true, 64);
        let rows: Vec<Value> = (0..200).map(|i| json!({ "id": i, "name": "repeated name" })).collect();
        let bytes = codec.encode(&rows).unwrap();
        assert!(is_compressed(&bytes));
        assert!(bytes.len() < serde_json::to_vec(&rows).unwrap().len());
        assert_eq!(codec.decode::<Vec<Value>>(&bytes).unwrap(), rows);

        let off = CacheCodec::new(false, 64);
        assert!(!is_compressed(&off.encode(&rows).unwrap()));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let codec = CacheCodec::new(true, 64);
        assert!(codec.decode::<Value>(&[]).is_err());
        assert!(codec.decode::<Value>(&[9, 1, 2]).is_err());
        assert!(codec.decode::<Value>(&[FLAG_GZIP, 1, 2]).is_err());
    }
}
