//! Checkpointed allocation state
//!
//! Every mutation is written to disk before it becomes visible to readers, so
//! a restart never observes an allocation the node did not persist.

use super::error::{AllocationError, Result};
use super::state::{AllocationState, MemoryState, PodResourceInfo, PodResourceInfoMap};
use crate::models::{PodUid, ResourceRequirements};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Checkpoint file of granted allocations
pub const ALLOCATED_CHECKPOINT: &str = "allocated_pods_state";

/// Checkpoint file of resources confirmed by the runtime
pub const ACTUATED_CHECKPOINT: &str = "actuated_pods_state";

/// On-disk envelope; the checksum covers the serialized `data`
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    data: BTreeMap<PodUid, PodResourceInfo>,
    checksum: String,
}

/// Allocation state persisted to a single checkpoint file
pub struct CheckpointState {
    path: PathBuf,
    cache: MemoryState,
    write_lock: Mutex<()>,
}

impl CheckpointState {
    /// Open (or create) the checkpoint `file_name` under `dir`
    ///
    /// A missing file starts empty; a file that fails verification is an error.
    pub fn open(dir: impl AsRef<Path>, file_name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| AllocationError::io(dir, e))?;

        let path = dir.join(file_name);
        let pods = load_checkpoint(&path)?;
        info!(path = %path.display(), pods = pods.len(), "Loaded allocation checkpoint");

        Ok(Self {
            path,
            cache: MemoryState::with_pods(pods),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to a copy of the state, persist it, then publish it
    fn update(&self, f: impl FnOnce(&mut PodResourceInfoMap)) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut pods = self.cache.pod_resource_info_map();
        f(&mut pods);
        save_checkpoint(&self.path, &pods)?;
        self.cache.replace(pods);
        Ok(())
    }
}

impl AllocationState for CheckpointState {
    fn container_resources(&self, uid: &PodUid, container: &str) -> Option<ResourceRequirements> {
        self.cache.container_resources(uid, container)
    }

    fn pod_resource_info(&self, uid: &PodUid) -> Option<PodResourceInfo> {
        self.cache.pod_resource_info(uid)
    }

    fn pod_resource_info_map(&self) -> PodResourceInfoMap {
        self.cache.pod_resource_info_map()
    }

    fn set_pod_resource_info(&self, uid: &PodUid, info: PodResourceInfo) -> Result<()> {
        self.update(|pods| {
            pods.insert(uid.clone(), info);
        })
    }

    fn remove_pod(&self, uid: &PodUid) -> Result<()> {
        if self.cache.pod_resource_info(uid).is_none() {
            return Ok(());
        }
        self.update(|pods| {
            pods.remove(uid);
        })
    }

    fn remove_orphaned_pods(&self, remaining: &HashSet<PodUid>) -> Result<()> {
        self.update(|pods| pods.retain(|uid, _| remaining.contains(uid)))
    }

    fn pod_count(&self) -> usize {
        self.cache.pod_count()
    }
}

fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn save_checkpoint(path: &Path, pods: &PodResourceInfoMap) -> Result<()> {
    let data: BTreeMap<PodUid, PodResourceInfo> =
        pods.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let checksum = compute_checksum(&serde_json::to_vec(&data)?);
    let json = serde_json::to_vec(&Checkpoint { data, checksum })?;

    // Write atomically using temp file
    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| AllocationError::io(&temp_path, e))?;

    file.write_all(&json)
        .map_err(|e| AllocationError::io(&temp_path, e))?;
    file.sync_all()
        .map_err(|e| AllocationError::io(&temp_path, e))?;

    fs::rename(&temp_path, path).map_err(|e| AllocationError::io(path, e))?;

    debug!(path = %path.display(), pods = pods.len(), "Checkpoint written");
    Ok(())
}

fn load_checkpoint(path: &Path) -> Result<PodResourceInfoMap> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PodResourceInfoMap::new()),
        Err(e) => return Err(AllocationError::io(path, e)),
    };

    let mut raw = Vec::new();
    file.read_to_end(&mut raw)
        .map_err(|e| AllocationError::io(path, e))?;

    let checkpoint: Checkpoint =
        serde_json::from_slice(&raw).map_err(|e| AllocationError::CorruptCheckpoint {
            path: path.to_path_buf(),
            expected: String::new(),
            actual: format!("unparseable ({})", e),
        })?;

    let actual = compute_checksum(&serde_json::to_vec(&checkpoint.data)?);
    if actual != checkpoint.checksum {
        return Err(AllocationError::CorruptCheckpoint {
            path: path.to_path_buf(),
            expected: checkpoint.checksum,
            actual,
        });
    }

    Ok(checkpoint.data.into_iter().collect())
}
