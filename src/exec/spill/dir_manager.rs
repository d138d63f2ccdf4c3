// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Rotates run files across the configured local spill directories and
/// enforces the per-directory byte budget.
#[derive(Debug)]
pub struct DirManager {
    dirs: Vec<SpillDir>,
    next_dir: AtomicUsize,
    dir_max_bytes: u64,
}

#[derive(Debug)]
struct SpillDir {
    path: PathBuf,
    used_bytes: AtomicU64,
}

impl DirManager {
    /// `dir_max_bytes` of 0 disables the budget.
    pub fn new(dirs: Vec<PathBuf>, dir_max_bytes: u64) -> Result<Self, String> {
        if dirs.is_empty() {
            return Err("spill.local_dirs is empty".to_string());
        }
        let mut spill_dirs = Vec::with_capacity(dirs.len());
        for dir in dirs {
            ensure_dir(&dir)?;
            spill_dirs.push(SpillDir {
                path: dir,
                used_bytes: AtomicU64::new(0),
            });
        }
        Ok(Self {
            dirs: spill_dirs,
            next_dir: AtomicUsize::new(0),
            dir_max_bytes,
        })
    }

    /// Round-robin pick. The index is handed back to `charge`/`release` so
    /// run files settle their bytes against the directory they landed in.
    pub fn pick_dir(&self) -> (usize, PathBuf) {
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel);
        let pos = idx % self.dirs.len();
        (pos, self.dirs[pos].path.clone())
    }

    pub fn charge(&self, dir_index: usize, bytes: u64) -> Result<(), String> {
        let dir = self
            .dirs
            .get(dir_index)
            .ok_or_else(|| format!("spill directory index {dir_index} out of range"))?;
        let used = dir.used_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if self.dir_max_bytes > 0 && used > self.dir_max_bytes {
            dir.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
            return Err(format!(
                "spill directory {} byte budget exceeded: used {} bytes, limit {} bytes",
                dir.path.display(),
                used,
                self.dir_max_bytes
            ));
        }
        Ok(())
    }

    pub fn release(&self, dir_index: usize, bytes: u64) {
        if let Some(dir) = self.dirs.get(dir_index) {
            dir.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    if path.as_os_str().is_empty() {
        return Err("spill.local_dirs contains empty path".to_string());
    }
    std::fs::create_dir_all(path)
        .map_err(|e| format!("create spill directory {} failed: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rotation_cycles_through_dirs() {
        let temp = tempdir().expect("tempdir");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        let manager = DirManager::new(vec![a.clone(), b.clone()], 0).expect("dir manager");
        let (i0, p0) = manager.pick_dir();
        let (i1, p1) = manager.pick_dir();
        let (i2, _) = manager.pick_dir();
        assert_ne!(i0, i1);
        assert_eq!(i0, i2);
        assert_ne!(p0, p1);
        assert!(a.is_dir());
        assert!(b.is_dir());
    }

    #[test]
    fn budget_is_enforced_and_released() {
        let temp = tempdir().expect("tempdir");
        let manager = DirManager::new(vec![temp.path().to_path_buf()], 100).expect("dir manager");
        manager.charge(0, 80).expect("within budget");
        let err = manager.charge(0, 40).expect_err("over budget");
        assert!(err.contains("budget exceeded"), "err={}", err);
        manager.release(0, 80);
        manager.charge(0, 40).expect("fits after release");
    }
}
