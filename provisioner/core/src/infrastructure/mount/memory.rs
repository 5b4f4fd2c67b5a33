// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory `Mounter` for tests and the dev control plane

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::mount::{MountError, Mounter};
use crate::domain::storage_class::FsType;
use crate::domain::volume::VolumeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub device: PathBuf,
    pub fs_type: FsType,
    pub read_only: bool,
}

#[derive(Default)]
struct MounterState {
    devices: HashMap<VolumeId, PathBuf>,
    filesystems: HashMap<PathBuf, FsType>,
    mounts: HashMap<PathBuf, MountRecord>,
    formats: usize,
    resizes: usize,
    failing_mounts: u32,
    failing_unmounts: u32,
    unmount_attempts: usize,
}

pub struct InMemoryMounter {
    state: Mutex<MounterState>,
    auto_devices: bool,
}

impl InMemoryMounter {
    /// Every volume has a device as soon as it is asked for
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MounterState::default()),
            auto_devices: true,
        }
    }

    /// Devices appear only through `add_device`
    pub fn without_auto_devices() -> Self {
        Self {
            state: Mutex::new(MounterState::default()),
            auto_devices: false,
        }
    }

    pub fn device_path(volume_id: &VolumeId) -> PathBuf {
        PathBuf::from(format!("/dev/sim/{}", volume_id))
    }

    pub fn add_device(&self, volume_id: &VolumeId) -> PathBuf {
        let path = Self::device_path(volume_id);
        self.state
            .lock()
            .devices
            .insert(volume_id.clone(), path.clone());
        path
    }

    /// Pretend the volume already carries a filesystem
    pub fn preformat(&self, volume_id: &VolumeId, fs_type: FsType) {
        let path = Self::device_path(volume_id);
        self.state.lock().filesystems.insert(path, fs_type);
    }

    /// The next `n` mount calls fail
    pub fn fail_next_mounts(&self, n: u32) {
        self.state.lock().failing_mounts = n;
    }

    /// The next `n` unmount calls fail
    pub fn fail_next_unmounts(&self, n: u32) {
        self.state.lock().failing_unmounts = n;
    }

    pub fn unmount_attempts(&self) -> usize {
        self.state.lock().unmount_attempts
    }

    pub fn format_count(&self) -> usize {
        self.state.lock().formats
    }

    pub fn resize_count(&self) -> usize {
        self.state.lock().resizes
    }

    pub fn mount_at(&self, target: &Path) -> Option<MountRecord> {
        self.state.lock().mounts.get(target).cloned()
    }

    pub fn mount_count(&self) -> usize {
        self.state.lock().mounts.len()
    }
}

impl Default for InMemoryMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mounter for InMemoryMounter {
    async fn find_device(&self, volume_id: &VolumeId) -> Result<Option<PathBuf>, MountError> {
        let mut state = self.state.lock();
        if let Some(path) = state.devices.get(volume_id) {
            return Ok(Some(path.clone()));
        }
        if self.auto_devices {
            let path = Self::device_path(volume_id);
            state.devices.insert(volume_id.clone(), path.clone());
            return Ok(Some(path));
        }
        Ok(None)
    }

    async fn detect_filesystem(&self, device: &Path) -> Result<Option<FsType>, MountError> {
        Ok(self.state.lock().filesystems.get(device).copied())
    }

    async fn format(&self, device: &Path, fs_type: FsType) -> Result<(), MountError> {
        let mut state = self.state.lock();
        state.filesystems.insert(device.to_path_buf(), fs_type);
        state.formats += 1;
        Ok(())
    }

    async fn mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FsType,
        read_only: bool,
    ) -> Result<(), MountError> {
        let mut state = self.state.lock();
        if state.failing_mounts > 0 {
            state.failing_mounts -= 1;
            return Err(MountError::Command {
                command: format!("mount {}", target.display()),
                stderr: "injected failure".to_string(),
            });
        }
        if state.filesystems.get(device) != Some(&fs_type) {
            return Err(MountError::Command {
                command: format!("mount -t {} {}", fs_type, device.display()),
                stderr: "wrong fs type, bad superblock".to_string(),
            });
        }
        if let Some(existing) = state.mounts.get(target) {
            if existing.device == device {
                return Ok(());
            }
            return Err(MountError::Command {
                command: format!("mount {}", target.display()),
                stderr: format!("{} already mounted", target.display()),
            });
        }
        state.mounts.insert(
            target.to_path_buf(),
            MountRecord {
                device: device.to_path_buf(),
                fs_type,
                read_only,
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let mut state = self.state.lock();
        state.unmount_attempts += 1;
        if state.failing_unmounts > 0 {
            state.failing_unmounts -= 1;
            return Err(MountError::Command {
                command: format!("umount {}", target.display()),
                stderr: "target is busy".to_string(),
            });
        }
        state.mounts.remove(target);
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        Ok(self.state.lock().mounts.contains_key(target))
    }

    async fn resize_filesystem(
        &self,
        _device: &Path,
        target: &Path,
        _fs_type: FsType,
    ) -> Result<(), MountError> {
        let mut state = self.state.lock();
        if !state.mounts.contains_key(target) {
            return Err(MountError::Command {
                command: format!("resize {}", target.display()),
                stderr: "not mounted".to_string(),
            });
        }
        state.resizes += 1;
        Ok(())
    }
}
