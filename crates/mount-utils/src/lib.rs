//! Host-side mount operations for the node service.
//!
//! The [`Mounter`] trait is the only way the driver touches the host mount
//! table. [`OsMounter`] shells out to the standard `mount`/`umount`/`blkid`/
//! `mkfs.*` utilities; [`FakeMounter`] keeps an in-memory mount table for
//! tests. All methods are synchronous; async callers are expected to wrap
//! them in `spawn_blocking`.

cfg_if::cfg_if! {
  if #[cfg(unix)] {
    mod unix;
    pub use unix::OsMounter;
  } else {
    compile_error!("Only cfg(unix) is supported at this time")
  }
}

mod fake;

pub use fake::{FakeAction, FakeMounter};

use std::{
  fs, io,
  path::{Path, PathBuf},
  result,
};
use thiserror::Error;
use tracing::warn;

pub type Result<T> = result::Result<T, MountError>;

/// MountPoint represents a single line in /proc/mounts or /etc/fstab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
  pub device: PathBuf,
  pub path: PathBuf,
  pub ty: String,
  pub opts: Vec<String>,
  pub freq: i32,
  pub pass: i32,
}

impl MountPoint {
  pub fn new(device: impl Into<PathBuf>, path: impl Into<PathBuf>, ty: impl Into<String>) -> Self {
    MountPoint {
      device: device.into(),
      path: path.into(),
      ty: ty.into(),
      opts: Vec::new(),
      freq: 0,
      pass: 0,
    }
  }
}

#[derive(Debug, Error)]
pub enum MountError {
  #[error("File system mismatch: {0}")]
  FilesystemMismatch(String),
  #[error("Format failed: {0}")]
  FormatFailed(String, #[source] io::Error),
  #[error("Get disk format failed: {0}")]
  GetDiskFormatFailed(String, #[source] io::Error),
  #[error("Unknown mount error: {0}")]
  UnknownMountError(
    #[from]
    #[source]
    io::Error,
  ),
}

impl MountError {
  pub(crate) fn new(msg: impl Into<String>) -> Self {
    MountError::UnknownMountError(io::Error::other(msg.into()))
  }

  fn is_permission_error(&self) -> bool {
    match self {
      MountError::UnknownMountError(e) => e.kind() == io::ErrorKind::PermissionDenied,
      _ => false,
    }
  }
}

/// Interface defines the set of methods to allow for mount operations on a
/// system.
pub trait Mounter: Send + Sync {
  /// Mounts source to target as fstype with given options.
  /// options MUST not contain sensitive material (like passwords).
  fn mount(&self, source: &Path, target: &Path, fstype: &str, options: &[String]) -> Result<()>;

  /// Unmount unmounts given target.
  fn unmount(&self, target: &Path) -> Result<()>;

  /// List returns a list of all mounted filesystems. This can be large.
  fn list(&self) -> Result<Vec<MountPoint>>;

  /// IsLikelyNotMountPoint uses heuristics to determine if a directory
  /// is not a mountpoint. It does NOT properly detect all mountpoint
  /// types, most notably linux bind mounts; for a faster check that is
  /// enough, for a reliable answer use [`Mounter::is_not_mount_point`].
  fn is_likely_not_mount_point(&self, file: &Path) -> Result<bool>;

  /// Returns the filesystem type currently on the device, or `None` when
  /// the device carries no recognised filesystem.
  fn get_device_format(&self, device: &Path) -> Result<Option<String>>;

  /// Creates a filesystem of the given type on the device.
  fn format(&self, device: &Path, fstype: &str) -> Result<()>;

  /// Whether the given path exists on the host.
  fn path_exists(&self, path: &Path) -> Result<bool>;

  /// Creates the directory (and its parents) if it does not exist yet.
  fn make_dir(&self, path: &Path) -> Result<()>;

  /// Determines reliably whether `file` is a mount point, falling back to
  /// scanning the mount table for the bind-mount cases the quick check
  /// cannot see.
  fn is_not_mount_point(&self, file: &Path) -> Result<bool> {
    let not_mnt = match self.is_likely_not_mount_point(file) {
      Ok(v) => v,
      Err(e) if e.is_permission_error() => {
        // Not allowed to stat(), e.g. on NFS with root_squash. Fall back
        // to the mount-table check below.
        true
      }
      Err(e) => return Err(e),
    };

    if !not_mnt {
      return Ok(false);
    }

    // The kernel records resolved paths in /proc/mounts.
    let resolved = match fs::canonicalize(file) {
      Ok(v) => v,
      Err(_) => return Ok(true),
    };

    Ok(!self.list()?.iter().any(|mp| mp.path == resolved))
  }

  /// The device mounted at `mount_path`, if any.
  fn device_name_from_mount(&self, mount_path: &Path) -> Result<Option<PathBuf>> {
    let resolved = fs::canonicalize(mount_path).unwrap_or_else(|_| mount_path.to_path_buf());

    Ok(
      self
        .list()?
        .iter()
        .find(|mp| mp.path == resolved || mp.path == mount_path)
        .map(|mp| mp.device.clone()),
    )
  }

  /// Formats the device if it has no filesystem yet, then mounts it.
  ///
  /// A device that already carries a filesystem is never reformatted; if the
  /// existing filesystem differs from the requested one the call fails with
  /// [`MountError::FilesystemMismatch`] and the caller decides what to
  /// surface.
  fn format_and_mount(
    &self,
    source: &Path,
    target: &Path,
    fstype: &str,
    options: &[String],
  ) -> Result<()> {
    match self.get_device_format(source)? {
      None => {
        self.format(source, fstype)?;
      }
      Some(existing) if existing != fstype => {
        warn!(
          device = %source.display(),
          existing = %existing,
          requested = fstype,
          "refusing to mount device with mismatched filesystem"
        );
        return Err(MountError::FilesystemMismatch(format!(
          "device {} already formatted with {}, requested {}",
          source.display(),
          existing,
          fstype
        )));
      }
      Some(_) => (),
    }

    self.mount(source, target, fstype, options)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn format_and_mount_formats_blank_device() {
    let mounter = FakeMounter::new([]);
    mounter
      .format_and_mount(
        Path::new("/dev/xvdba"),
        Path::new("/mnt/stage"),
        "ext4",
        &[],
      )
      .unwrap();

    assert_eq!(
      mounter.get_device_format(Path::new("/dev/xvdba")).unwrap(),
      Some("ext4".into())
    );
    assert_eq!(mounter.list().unwrap().len(), 1);
  }

  #[test]
  fn format_and_mount_keeps_existing_filesystem() {
    let mounter = FakeMounter::new([]);
    mounter.set_device_format("/dev/xvdba", "ext4");
    mounter
      .format_and_mount(
        Path::new("/dev/xvdba"),
        Path::new("/mnt/stage"),
        "ext4",
        &[],
      )
      .unwrap();

    // No Format action should have been recorded.
    assert!(mounter
      .get_log()
      .iter()
      .all(|a| !matches!(a, FakeAction::Format { .. })));
  }

  #[test]
  fn format_and_mount_rejects_mismatched_filesystem() {
    let mounter = FakeMounter::new([]);
    mounter.set_device_format("/dev/xvdba", "xfs");
    let err = mounter
      .format_and_mount(
        Path::new("/dev/xvdba"),
        Path::new("/mnt/stage"),
        "ext4",
        &[],
      )
      .unwrap_err();

    assert!(matches!(err, MountError::FilesystemMismatch(_)));
    assert!(mounter.list().unwrap().is_empty());
  }
}
