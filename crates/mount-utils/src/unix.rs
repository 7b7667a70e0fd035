use crate::{MountError, MountPoint, Mounter, Result};
use duct::cmd;
use std::{
  fs, io,
  os::unix::fs::MetadataExt,
  path::{Path, PathBuf},
};
use tracing::{debug, info};

const PROC_MOUNTS_PATH: &str = "/proc/mounts";
const EXPECTED_FIELDS_PER_MOUNTS_LINE: usize = 6;

/// Mounter backed by the host's mount utilities.
#[derive(Debug, Default)]
pub struct OsMounter;

impl OsMounter {
  pub fn new() -> Self {
    OsMounter
  }
}

impl Mounter for OsMounter {
  fn mount(&self, source: &Path, target: &Path, fstype: &str, options: &[String]) -> Result<()> {
    let mut args: Vec<String> = Vec::with_capacity(6);
    if !fstype.is_empty() {
      args.push("-t".into());
      args.push(fstype.into());
    }
    if !options.is_empty() {
      args.push("-o".into());
      args.push(options.join(","));
    }
    args.push(source.display().to_string());
    args.push(target.display().to_string());

    info!(
      source = %source.display(),
      target = %target.display(),
      fstype,
      ?options,
      "mounting"
    );
    let output = cmd("mount", &args)
      .stderr_to_stdout()
      .stdout_capture()
      .unchecked()
      .run()?;
    if !output.status.success() {
      return Err(MountError::new(format!(
        "mount of {} at {} failed: {}",
        source.display(),
        target.display(),
        String::from_utf8_lossy(&output.stdout).trim()
      )));
    }

    Ok(())
  }

  fn unmount(&self, target: &Path) -> Result<()> {
    info!("Unmounting {}", target.display());
    let output = cmd!("umount", target)
      .stderr_to_stdout()
      .stdout_capture()
      .unchecked()
      .run()?;
    if !output.status.success() {
      return Err(MountError::new(format!(
        "umount of {} failed: {}",
        target.display(),
        String::from_utf8_lossy(&output.stdout).trim()
      )));
    }

    Ok(())
  }

  fn list(&self) -> Result<Vec<MountPoint>> {
    let content = fs::read_to_string(PROC_MOUNTS_PATH)?;
    parse_proc_mounts(&content)
  }

  fn is_likely_not_mount_point(&self, file: &Path) -> Result<bool> {
    let stat = fs::metadata(file)?;
    let parent = file
      .parent()
      .ok_or_else(|| MountError::new("file does not have parent"))?;
    let parent_stat = fs::metadata(parent)?;

    // If the directory has a different device as parent, then it is a
    // mountpoint.
    Ok(stat.dev() == parent_stat.dev())
  }

  fn get_device_format(&self, device: &Path) -> Result<Option<String>> {
    let output = cmd!("blkid", "-p", "-s", "TYPE", "-o", "value", device)
      .stdout_capture()
      .stderr_capture()
      .unchecked()
      .run()
      .map_err(|e| MountError::GetDiskFormatFailed(device.display().to_string(), e))?;

    match output.status.code() {
      Some(0) => {
        let fstype = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(device = %device.display(), fstype = %fstype, "detected filesystem");
        Ok(if fstype.is_empty() { None } else { Some(fstype) })
      }
      // blkid exits 2 when it cannot find a recognised filesystem on the
      // probed device.
      Some(2) => Ok(None),
      _ => Err(MountError::GetDiskFormatFailed(
        device.display().to_string(),
        io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_string()),
      )),
    }
  }

  fn format(&self, device: &Path, fstype: &str) -> Result<()> {
    let mut args: Vec<String> = Vec::with_capacity(2);
    if fstype.starts_with("ext") {
      args.push("-F".into());
    } else if fstype == "xfs" {
      args.push("-f".into());
    }
    args.push(device.display().to_string());

    info!(device = %device.display(), fstype, "formatting device");
    let output = cmd(format!("mkfs.{fstype}"), &args)
      .stderr_to_stdout()
      .stdout_capture()
      .unchecked()
      .run()
      .map_err(|e| MountError::FormatFailed(device.display().to_string(), e))?;
    if !output.status.success() {
      return Err(MountError::FormatFailed(
        device.display().to_string(),
        io::Error::other(String::from_utf8_lossy(&output.stdout).trim().to_string()),
      ));
    }

    Ok(())
  }

  fn path_exists(&self, path: &Path) -> Result<bool> {
    match fs::metadata(path) {
      Ok(_) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(e.into()),
    }
  }

  fn make_dir(&self, path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
  }
}

fn parse_proc_mounts(content: &str) -> Result<Vec<MountPoint>> {
  let mut out = Vec::new();
  for line in content.lines() {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != EXPECTED_FIELDS_PER_MOUNTS_LINE {
      return Err(MountError::new(format!(
        "wrong number of fields (expected {}, got {}): {}",
        EXPECTED_FIELDS_PER_MOUNTS_LINE,
        fields.len(),
        line
      )));
    }

    out.push(MountPoint {
      device: PathBuf::from(fields[0]),
      path: PathBuf::from(fields[1]),
      ty: fields[2].to_string(),
      opts: fields[3].split(',').map(String::from).collect(),
      freq: fields[4].parse().unwrap_or(0),
      pass: fields[5].parse().unwrap_or(0),
    });
  }

  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = "\
/dev/nvme0n1p1 / ext4 rw,relatime,discard 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/xvdba /var/lib/kubelet/stage ext4 rw,relatime 0 0
";

  #[test]
  fn parses_proc_mounts_lines() {
    let mps = parse_proc_mounts(SAMPLE).unwrap();
    assert_eq!(mps.len(), 3);
    assert_eq!(mps[2].device, PathBuf::from("/dev/xvdba"));
    assert_eq!(mps[2].path, PathBuf::from("/var/lib/kubelet/stage"));
    assert_eq!(mps[2].ty, "ext4");
    assert_eq!(mps[0].opts, vec!["rw", "relatime", "discard"]);
  }

  #[test]
  fn rejects_short_lines() {
    assert!(parse_proc_mounts("/dev/sda1 / ext4 rw 0\n").is_err());
  }

  #[test]
  fn skips_blank_lines() {
    assert!(parse_proc_mounts("\n\n").unwrap().is_empty());
  }
}
