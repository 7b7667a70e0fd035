use crate::{MountPoint, Mounter, Result};
use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::Mutex,
};
use tracing::info;

/// One recorded [`FakeMounter`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeAction {
  Mount {
    source: PathBuf,
    target: PathBuf,
    fs_type: String,
  },
  Unmount {
    target: PathBuf,
  },
  Format {
    device: PathBuf,
    fs_type: String,
  },
}

#[derive(Default)]
struct FakeMounterInner {
  mount_points: Vec<MountPoint>,
  // device -> filesystem currently on it
  filesystems: HashMap<PathBuf, String>,
  log: Vec<FakeAction>,
}

/// In-memory mount table for tests. Paths handed to it do not need to
/// exist on the host.
#[derive(Default)]
pub struct FakeMounter(Mutex<FakeMounterInner>);

impl FakeMounter {
  pub fn new(mps: impl IntoIterator<Item = MountPoint>) -> Self {
    let inner = FakeMounterInner {
      mount_points: mps.into_iter().collect(),
      ..Default::default()
    };

    FakeMounter(Mutex::new(inner))
  }

  /// Pretend the device already carries a filesystem.
  pub fn set_device_format(&self, device: impl Into<PathBuf>, fstype: impl Into<String>) {
    self
      .0
      .lock()
      .unwrap()
      .filesystems
      .insert(device.into(), fstype.into());
  }

  pub fn get_log(&self) -> Vec<FakeAction> {
    self.0.lock().unwrap().log.clone()
  }

  pub fn reset_log(&self) {
    self.0.lock().unwrap().log.clear();
  }
}

impl Mounter for FakeMounter {
  fn mount(&self, source: &Path, target: &Path, fstype: &str, options: &[String]) -> Result<()> {
    let mut inner = self.0.lock().unwrap();

    // Mimic linux bind-mount behaviour: /proc/mounts records the original
    // device of the bound path, not the path itself.
    let mut source = source.to_path_buf();
    if options.iter().any(|o| o == "bind") {
      if let Some(mp) = inner.mount_points.iter().find(|mp| mp.path == source) {
        source = mp.device.clone();
      }
    }

    let mut mp = MountPoint::new(source.clone(), target, fstype);
    mp.opts = options.to_vec();
    inner.mount_points.push(mp);

    info!(
      "Fake mounter: mounted {} to {}",
      source.display(),
      target.display()
    );
    inner.log.push(FakeAction::Mount {
      source,
      target: target.to_path_buf(),
      fs_type: fstype.to_string(),
    });

    Ok(())
  }

  fn unmount(&self, target: &Path) -> Result<()> {
    let mut inner = self.0.lock().unwrap();

    if let Some(i) = inner.mount_points.iter().position(|mp| mp.path == target) {
      let mp = inner.mount_points.remove(i);
      info!(
        "Fake mounter: unmounted {} from {}",
        mp.device.display(),
        target.display()
      );
    }

    inner.log.push(FakeAction::Unmount {
      target: target.to_path_buf(),
    });
    Ok(())
  }

  fn list(&self) -> Result<Vec<MountPoint>> {
    Ok(self.0.lock().unwrap().mount_points.clone())
  }

  fn is_likely_not_mount_point(&self, file: &Path) -> Result<bool> {
    let inner = self.0.lock().unwrap();
    Ok(!inner.mount_points.iter().any(|mp| mp.path == file))
  }

  fn get_device_format(&self, device: &Path) -> Result<Option<String>> {
    Ok(self.0.lock().unwrap().filesystems.get(device).cloned())
  }

  fn format(&self, device: &Path, fstype: &str) -> Result<()> {
    let mut inner = self.0.lock().unwrap();
    inner
      .filesystems
      .insert(device.to_path_buf(), fstype.to_string());
    inner.log.push(FakeAction::Format {
      device: device.to_path_buf(),
      fs_type: fstype.to_string(),
    });
    Ok(())
  }

  fn path_exists(&self, _path: &Path) -> Result<bool> {
    Ok(true)
  }

  fn make_dir(&self, _path: &Path) -> Result<()> {
    Ok(())
  }

  // The default implementation canonicalises against the host filesystem,
  // which would defeat the whole point of a fake.
  fn is_not_mount_point(&self, file: &Path) -> Result<bool> {
    self.is_likely_not_mount_point(file)
  }

  fn device_name_from_mount(&self, mount_path: &Path) -> Result<Option<PathBuf>> {
    Ok(
      self
        .0
        .lock()
        .unwrap()
        .mount_points
        .iter()
        .find(|mp| mp.path == mount_path)
        .map(|mp| mp.device.clone()),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mount_and_unmount_update_the_table() {
    let mounter = FakeMounter::new([]);
    mounter
      .mount(
        Path::new("/dev/xvdba"),
        Path::new("/mnt/a"),
        "ext4",
        &["rw".into()],
      )
      .unwrap();
    assert!(!mounter
      .is_likely_not_mount_point(Path::new("/mnt/a"))
      .unwrap());

    mounter.unmount(Path::new("/mnt/a")).unwrap();
    assert!(mounter
      .is_likely_not_mount_point(Path::new("/mnt/a"))
      .unwrap());
  }

  #[test]
  fn bind_mount_records_original_device() {
    let mounter = FakeMounter::new([MountPoint::new("/dev/xvdba", "/mnt/stage", "ext4")]);
    mounter
      .mount(
        Path::new("/mnt/stage"),
        Path::new("/mnt/pod"),
        "",
        &["bind".into()],
      )
      .unwrap();

    assert_eq!(
      mounter
        .device_name_from_mount(Path::new("/mnt/pod"))
        .unwrap(),
      Some(PathBuf::from("/dev/xvdba"))
    );
  }

  #[test]
  fn unmount_of_unmounted_path_succeeds() {
    let mounter = FakeMounter::new([]);
    mounter.unmount(Path::new("/mnt/none")).unwrap();
    assert_eq!(
      mounter.get_log(),
      vec![FakeAction::Unmount {
        target: PathBuf::from("/mnt/none")
      }]
    );
  }
}
