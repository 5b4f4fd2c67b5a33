// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node mount surface
//!
//! The narrow set of device and filesystem primitives the node mount agent
//! needs. Implementations are per operating system.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::storage_class::FsType;
use crate::domain::volume::VolumeId;

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Block device backing `volume_id`, if the attach has surfaced it
    async fn find_device(&self, volume_id: &VolumeId) -> Result<Option<PathBuf>, MountError>;

    /// Filesystem present on `device`, `None` for a blank device
    async fn detect_filesystem(&self, device: &Path) -> Result<Option<FsType>, MountError>;

    async fn format(&self, device: &Path, fs_type: FsType) -> Result<(), MountError>;

    async fn mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FsType,
        read_only: bool,
    ) -> Result<(), MountError>;

    async fn unmount(&self, target: &Path) -> Result<(), MountError>;

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError>;

    /// Grow a mounted filesystem to fill its device
    async fn resize_filesystem(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FsType,
    ) -> Result<(), MountError>;
}

#[derive(Debug, Clone, Error)]
pub enum MountError {
    #[error("Device for volume {0} not found")]
    DeviceNotFound(String),

    #[error("Command `{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for MountError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
