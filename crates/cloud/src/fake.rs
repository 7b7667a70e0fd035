use crate::{
  devices::next_device_name,
  util::{bytes_to_gib, gib_to_bytes, round_up_gib},
  CloudError, CloudProvider, Disk, DiskOptions, Snapshot, SnapshotOptions, SNAPSHOT_NAME_TAG_KEY,
  VOLUME_NAME_TAG_KEY,
};
use async_trait::async_trait;
use std::{
  collections::{HashMap, HashSet},
  sync::Mutex,
  time::SystemTime,
};

#[derive(Debug, Clone)]
struct FakeDisk {
  disk: Disk,
  attachment: Option<FakeAttachment>,
}

#[derive(Debug, Clone)]
struct FakeAttachment {
  instance_id: String,
  device: String,
}

#[derive(Default)]
struct FakeCloudInner {
  // keyed by name tag, mirroring how the real provider recovers
  // idempotence
  disks: HashMap<String, FakeDisk>,
  snapshots: HashMap<String, Snapshot>,
  counter: u64,
}

/// In-memory [`CloudProvider`] with the same sentinel discipline as
/// [`crate::Ec2Cloud`]; the whole service-level test suite runs against
/// it.
#[derive(Default)]
pub struct FakeCloud {
  inner: Mutex<FakeCloudInner>,
}

impl FakeCloud {
  pub fn new() -> Self {
    FakeCloud::default()
  }

  /// The instance a volume is currently attached to, for asserting
  /// attach/detach round trips.
  pub fn attached_instance(&self, volume_id: &str) -> Option<String> {
    let inner = self.inner.lock().unwrap();
    inner
      .disks
      .values()
      .find(|d| d.disk.volume_id == volume_id)
      .and_then(|d| d.attachment.as_ref())
      .map(|a| a.instance_id.clone())
  }
}

#[async_trait]
impl CloudProvider for FakeCloud {
  async fn create_disk(&self, name: &str, opts: DiskOptions) -> Result<Disk, CloudError> {
    let mut inner = self.inner.lock().unwrap();

    if let Some(existing) = inner.disks.get(name) {
      if existing.disk.capacity_gib != bytes_to_gib(opts.capacity_bytes) {
        return Err(CloudError::AlreadyExists);
      }
      return Ok(existing.disk.clone());
    }

    inner.counter += 1;
    let disk = Disk {
      volume_id: format!("vol-fake-{:06}", inner.counter),
      capacity_gib: round_up_gib(opts.capacity_bytes),
      availability_zone: if opts.availability_zone.is_empty() {
        "us-west-2a".to_string()
      } else {
        opts.availability_zone.clone()
      },
      fs_type: String::new(),
    };

    let key = opts
      .tags
      .get(VOLUME_NAME_TAG_KEY)
      .cloned()
      .unwrap_or_else(|| name.to_string());
    inner.disks.insert(
      key,
      FakeDisk {
        disk: disk.clone(),
        attachment: None,
      },
    );

    Ok(disk)
  }

  async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError> {
    let mut inner = self.inner.lock().unwrap();
    let name = inner
      .disks
      .iter()
      .find(|(_, d)| d.disk.volume_id == volume_id)
      .map(|(name, _)| name.clone())
      .ok_or(CloudError::NotFound)?;

    inner.disks.remove(&name);
    Ok(())
  }

  async fn get_disk_by_name(&self, name: &str, capacity_bytes: i64) -> Result<Disk, CloudError> {
    let inner = self.inner.lock().unwrap();
    let entry = inner.disks.get(name).ok_or(CloudError::NotFound)?;

    if entry.disk.capacity_gib != bytes_to_gib(capacity_bytes) {
      return Err(CloudError::DiskExistsDiffSize);
    }
    Ok(entry.disk.clone())
  }

  async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError> {
    let inner = self.inner.lock().unwrap();
    inner
      .disks
      .values()
      .find(|d| d.disk.volume_id == volume_id)
      .map(|d| d.disk.clone())
      .ok_or(CloudError::NotFound)
  }

  async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<String, CloudError> {
    let mut inner = self.inner.lock().unwrap();

    let in_use: HashSet<String> = inner
      .disks
      .values()
      .filter_map(|d| d.attachment.as_ref())
      .filter(|a| a.instance_id == instance_id)
      .map(|a| a.device.clone())
      .collect();

    let entry = inner
      .disks
      .values_mut()
      .find(|d| d.disk.volume_id == volume_id)
      .ok_or(CloudError::NotFound)?;

    match &entry.attachment {
      Some(att) if att.instance_id == instance_id => Ok(att.device.clone()),
      Some(_) => Err(CloudError::AlreadyExists),
      None => {
        let device = next_device_name(&in_use)?;
        entry.attachment = Some(FakeAttachment {
          instance_id: instance_id.to_string(),
          device: device.clone(),
        });
        Ok(device)
      }
    }
  }

  async fn detach_disk(&self, volume_id: &str, _instance_id: &str) -> Result<(), CloudError> {
    let mut inner = self.inner.lock().unwrap();
    if let Some(entry) = inner
      .disks
      .values_mut()
      .find(|d| d.disk.volume_id == volume_id)
    {
      entry.attachment = None;
    }

    // Absent volume or absent attachment both already satisfy the goal
    // state.
    Ok(())
  }

  async fn is_exist_instance(&self, instance_id: &str) -> bool {
    !instance_id.is_empty() && instance_id != "instance-missing"
  }

  async fn create_snapshot(
    &self,
    volume_id: &str,
    opts: SnapshotOptions,
  ) -> Result<Snapshot, CloudError> {
    let mut inner = self.inner.lock().unwrap();

    let name = opts
      .tags
      .get(SNAPSHOT_NAME_TAG_KEY)
      .cloned()
      .unwrap_or_default();

    if let Some(existing) = inner.snapshots.get(&name) {
      if existing.source_volume_id == volume_id {
        return Ok(existing.clone());
      }
      return Err(CloudError::AlreadyExists);
    }

    inner.counter += 1;
    let snapshot = Snapshot {
      snapshot_id: format!("snap-fake-{:06}", inner.counter),
      source_volume_id: volume_id.to_string(),
      size_bytes: gib_to_bytes(1),
      creation_time: SystemTime::now(),
      ready_to_use: true,
    };
    inner.snapshots.insert(name, snapshot.clone());

    Ok(snapshot)
  }

  async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
    let mut inner = self.inner.lock().unwrap();
    let name = inner
      .snapshots
      .iter()
      .find(|(_, s)| s.snapshot_id == snapshot_id)
      .map(|(name, _)| name.clone())
      .ok_or(CloudError::NotFound)?;

    inner.snapshots.remove(&name);
    Ok(())
  }

  async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot, CloudError> {
    let inner = self.inner.lock().unwrap();
    inner
      .snapshots
      .get(name)
      .cloned()
      .ok_or(CloudError::NotFound)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn opts(bytes: i64) -> DiskOptions {
    DiskOptions {
      capacity_bytes: bytes,
      tags: HashMap::from([(VOLUME_NAME_TAG_KEY.to_string(), "disk-a".to_string())]),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn create_is_idempotent_by_name() {
    let cloud = FakeCloud::new();
    let first = cloud.create_disk("disk-a", opts(gib_to_bytes(1))).await.unwrap();
    let second = cloud.create_disk("disk-a", opts(gib_to_bytes(1))).await.unwrap();
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn create_with_different_size_conflicts() {
    let cloud = FakeCloud::new();
    cloud.create_disk("disk-a", opts(gib_to_bytes(1))).await.unwrap();
    let err = cloud
      .create_disk("disk-a", opts(gib_to_bytes(2)))
      .await
      .unwrap_err();
    assert_eq!(err, CloudError::AlreadyExists);
  }

  #[tokio::test]
  async fn get_disk_by_name_distinguishes_size_mismatch() {
    let cloud = FakeCloud::new();
    cloud.create_disk("disk-a", opts(gib_to_bytes(1))).await.unwrap();

    assert_eq!(
      cloud
        .get_disk_by_name("disk-a", gib_to_bytes(4))
        .await
        .unwrap_err(),
      CloudError::DiskExistsDiffSize
    );
    assert_eq!(
      cloud
        .get_disk_by_name("disk-b", gib_to_bytes(1))
        .await
        .unwrap_err(),
      CloudError::NotFound
    );
  }

  #[tokio::test]
  async fn attach_detach_round_trip() {
    let cloud = FakeCloud::new();
    let disk = cloud.create_disk("disk-a", opts(gib_to_bytes(1))).await.unwrap();

    let device = cloud
      .attach_disk(&disk.volume_id, "i-123")
      .await
      .unwrap();
    assert_eq!(device, "/dev/xvdba");

    // Same instance: same device back. Other instance: conflict.
    assert_eq!(
      cloud.attach_disk(&disk.volume_id, "i-123").await.unwrap(),
      device
    );
    assert_eq!(
      cloud
        .attach_disk(&disk.volume_id, "i-456")
        .await
        .unwrap_err(),
      CloudError::AlreadyExists
    );

    cloud.detach_disk(&disk.volume_id, "i-123").await.unwrap();
    assert_eq!(cloud.attached_instance(&disk.volume_id), None);

    // Detaching again still succeeds.
    cloud.detach_disk(&disk.volume_id, "i-123").await.unwrap();
  }

  #[tokio::test]
  async fn delete_missing_disk_is_not_found() {
    let cloud = FakeCloud::new();
    assert_eq!(
      cloud.delete_disk("vol-nope").await.unwrap_err(),
      CloudError::NotFound
    );
  }

  #[tokio::test]
  async fn snapshot_idempotence_and_conflict() {
    let cloud = FakeCloud::new();
    let opts = || SnapshotOptions {
      tags: HashMap::from([(SNAPSHOT_NAME_TAG_KEY.to_string(), "snap-a".to_string())]),
    };

    let first = cloud.create_snapshot("vol-a", opts()).await.unwrap();
    let second = cloud.create_snapshot("vol-a", opts()).await.unwrap();
    assert_eq!(first.snapshot_id, second.snapshot_id);

    assert_eq!(
      cloud.create_snapshot("vol-b", opts()).await.unwrap_err(),
      CloudError::AlreadyExists
    );
  }
}
