// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Linux `Mounter` backed by util-linux and filesystem tools
//!
//! Devices are located under a by-id directory where the attach surfaces a
//! link whose name contains the cloud volume id.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::mount::{MountError, Mounter};
use crate::domain::storage_class::FsType;
use crate::domain::volume::VolumeId;

/// blkid exits 2 when the device carries no recognizable signature
const BLKID_NO_SIGNATURE: i32 = 2;

pub struct SystemMounter {
    device_dir: PathBuf,
}

impl SystemMounter {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    async fn run(program: &str, args: &[&str]) -> Result<std::process::Output, MountError> {
        debug!(program, ?args, "Running mount command");
        let output = Command::new(program).args(args).output().await?;
        Ok(output)
    }

    async fn run_checked(program: &str, args: &[&str]) -> Result<String, MountError> {
        let output = Self::run(program, args).await?;
        if !output.status.success() {
            return Err(MountError::Command {
                command: format!("{} {}", program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn find_device(&self, volume_id: &VolumeId) -> Result<Option<PathBuf>, MountError> {
        let mut entries = match tokio::fs::read_dir(&self.device_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        // Providers strip dashes from the id in the link name
        let compact = volume_id.as_str().replace('-', "");
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(volume_id.as_str()) || name.contains(&compact) {
                let resolved = tokio::fs::canonicalize(entry.path()).await?;
                return Ok(Some(resolved));
            }
        }
        Ok(None)
    }

    async fn detect_filesystem(&self, device: &Path) -> Result<Option<FsType>, MountError> {
        let device = device.to_string_lossy();
        let output = Self::run("blkid", &["-p", "-s", "TYPE", "-o", "value", &device]).await?;
        match output.status.code() {
            Some(0) => {
                let detected = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if detected.is_empty() {
                    return Ok(None);
                }
                // Anything we cannot mount is still data and must not be formatted over
                FsType::parse(&detected).map(Some).ok_or_else(|| {
                    MountError::Unsupported(format!("{} carries unsupported filesystem {}", device, detected))
                })
            }
            Some(BLKID_NO_SIGNATURE) => Ok(None),
            _ => Err(MountError::Command {
                command: format!("blkid -p {}", device),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn format(&self, device: &Path, fs_type: FsType) -> Result<(), MountError> {
        let device = device.to_string_lossy();
        info!(device = %device, fs_type = %fs_type, "Formatting blank device");
        match fs_type {
            FsType::Ext4 => Self::run_checked("mkfs.ext4", &["-F", "-m", "0", &device]).await?,
            FsType::Xfs => Self::run_checked("mkfs.xfs", &[&device]).await?,
        };
        Ok(())
    }

    async fn mount(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FsType,
        read_only: bool,
    ) -> Result<(), MountError> {
        if self.is_mounted(target).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(target).await?;
        let device = device.to_string_lossy();
        let target_str = target.to_string_lossy();
        let mut args = vec!["-t", fs_type.as_str()];
        if read_only {
            args.extend(["-o", "ro"]);
        }
        args.push(&device);
        args.push(&target_str);
        Self::run_checked("mount", &args).await?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if !self.is_mounted(target).await? {
            return Ok(());
        }
        Self::run_checked("umount", &[&target.to_string_lossy()]).await?;
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let table = tokio::fs::read_to_string("/proc/self/mountinfo").await?;
        Ok(mountinfo_contains(&table, target))
    }

    async fn resize_filesystem(
        &self,
        device: &Path,
        target: &Path,
        fs_type: FsType,
    ) -> Result<(), MountError> {
        match fs_type {
            FsType::Ext4 => Self::run_checked("resize2fs", &[&device.to_string_lossy()]).await?,
            FsType::Xfs => Self::run_checked("xfs_growfs", &[&target.to_string_lossy()]).await?,
        };
        Ok(())
    }
}

/// Field 5 of each mountinfo line is the mount point, octal-escaped
fn mountinfo_contains(table: &str, target: &Path) -> bool {
    let wanted = target.to_string_lossy();
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|mount_point| unescape_octal(mount_point) == wanted)
}

fn unescape_octal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.by_ref().take(3).collect();
            match u8::from_str_radix(&digits, 8) {
                Ok(byte) => out.push(byte as char),
                Err(_) => {
                    out.push('\\');
                    out.push_str(&digits);
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
97 22 259:3 / /var/lib/aegis/volumes/vol-1 rw,relatime shared:50 - ext4 /dev/nvme1n1 rw
98 22 259:4 / /mnt/with\\040space rw,relatime shared:51 - xfs /dev/nvme2n1 rw
";

    #[test]
    fn test_mountinfo_lookup() {
        assert!(mountinfo_contains(MOUNTINFO, Path::new("/var/lib/aegis/volumes/vol-1")));
        assert!(mountinfo_contains(MOUNTINFO, Path::new("/mnt/with space")));
        assert!(!mountinfo_contains(MOUNTINFO, Path::new("/var/lib/aegis/volumes/vol-2")));
    }

    #[tokio::test]
    async fn test_find_device_matches_id_in_link_name() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("nvme1n1");
        std::fs::write(&device, b"").unwrap();
        std::os::unix::fs::symlink(&device, dir.path().join("nvme-Aegis_Block_vol0abc123")).unwrap();

        let mounter = SystemMounter::new(dir.path());
        let found = mounter.find_device(&VolumeId::new("vol-0abc123")).await.unwrap();
        assert_eq!(found, Some(std::fs::canonicalize(&device).unwrap()));
        assert!(mounter
            .find_device(&VolumeId::new("vol-missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_device_dir_means_not_yet_attached() {
        let mounter = SystemMounter::new("/nonexistent/aegis/by-id");
        assert!(mounter.find_device(&VolumeId::new("vol-1")).await.unwrap().is_none());
    }
}
