//! Resource ledger: limits and usage.
//!
//! Two flat JSON documents. `limits.json` is read-only after initialization;
//! `usage.json` is mutated under an advisory lock ([`LockedFile`]) for the
//! full read-modify-write, so concurrent schedulers never interleave a
//! read with another's write.
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{JqsError, Result};
use crate::lock::LockedFile;
use crate::paths::PathStore;

const DEFAULT_CORES_TOTAL: i64 = 16;
const DEFAULT_MEM_MB_TOTAL: i64 = 65536;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limits {
    pub cores_total: i64,
    pub mem_mb_total: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cores_total: DEFAULT_CORES_TOTAL,
            mem_mb_total: DEFAULT_MEM_MB_TOTAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub cores_used: i64,
    pub mem_mb_used: i64,
}

impl Default for Usage {
    fn default() -> Self {
        Self {
            cores_used: 0,
            mem_mb_used: 0,
        }
    }
}

pub struct Ledger {
    paths: PathStore,
}

fn read_or_init<T>(path: &Path) -> Result<T>
where
    T: Default + Serialize + serde::de::DeserializeOwned,
{
    if let Ok(bytes) = fs::read(path) {
        if let Ok(value) = serde_json::from_slice::<T>(&bytes) {
            return Ok(value);
        }
    }
    let value = T::default();
    let json = serde_json::to_vec_pretty(&value)
        .map_err(|e| JqsError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
    fs::write(path, json).map_err(|e| JqsError::io(path, e))?;
    Ok(value)
}

impl Ledger {
    pub fn new(paths: PathStore) -> Self {
        Self { paths }
    }

    /// Read-only: `{cores_total, mem_mb_total}`.
    pub fn limits(&self) -> Result<Limits> {
        read_or_init(&self.paths.limits_file())
    }

    /// Read-only: `{cores_used, mem_mb_used}`.
    pub fn usage(&self) -> Result<Usage> {
        read_or_init(&self.paths.usage_file())
    }

    /// Hold the usage lock, read, compute new values, validate
    /// `0 ≤ new ≤ limits` on each scalar, write, return. The lock is held
    /// across the full read-modify-write.
    pub fn apply_delta(&self, delta_cores: i64, delta_mem: i64) -> Result<Usage> {
        let usage_path = self.paths.usage_file();
        let lock_path = self.paths.usage_lock();
        let limits = self.limits()?;

        let result = LockedFile::with_lock(&lock_path, |_f| -> io::Result<Result<Usage>> {
            let usage: Usage = read_or_init(&usage_path)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

            let new_cores = usage.cores_used + delta_cores;
            let new_mem = usage.mem_mb_used + delta_mem;

            if new_cores < 0 || new_mem < 0 {
                return Ok(Err(JqsError::Negative));
            }
            if new_cores > limits.cores_total || new_mem > limits.mem_mb_total {
                return Ok(Err(JqsError::ResourceExceeded {
                    new_cores,
                    cores_total: limits.cores_total,
                    new_mem,
                    mem_mb_total: limits.mem_mb_total,
                }));
            }

            let new_usage = Usage {
                cores_used: new_cores,
                mem_mb_used: new_mem,
            };
            let json = serde_json::to_vec_pretty(&new_usage)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fs::write(&usage_path, json)?;
            Ok(Ok(new_usage))
        })
        .map_err(|e| JqsError::io(&usage_path, e))?;

        result
    }
}
