//! Cloud provider abstraction for the EBS CSI driver.
//!
//! The controller service only ever talks to the [`CloudProvider`] trait.
//! [`Ec2Cloud`] implements it against the EC2 API with credentials from the
//! SDK's standard chain; [`FakeCloud`] implements it in memory for tests.
//! Both enforce the same name-tag idempotence discipline, so the controller
//! never needs an index of its own.

mod backoff;
mod devices;
mod ec2;
mod error;
mod fake;
mod metadata;
pub mod util;

pub use backoff::Backoff;
pub use ec2::Ec2Cloud;
pub use error::CloudError;
pub use fake::FakeCloud;
pub use metadata::{Metadata, DEFAULT_METADATA_ENDPOINT};

use async_trait::async_trait;
use std::{collections::HashMap, time::SystemTime};

/// Tag carrying the CO-chosen volume name; CreateVolume idempotence is
/// recovered by filtering on it.
pub const VOLUME_NAME_TAG_KEY: &str = "CSIVolumeName";

/// Tag carrying the CO-chosen snapshot name.
pub const SNAPSHOT_NAME_TAG_KEY: &str = "CSIVolumeSnapshotName";

/// Size of a volume when the request does not carry a capacity range.
pub const DEFAULT_VOLUME_SIZE: i64 = 10 * util::GIB;

pub const VOLUME_TYPE_GP2: &str = "gp2";
pub const VOLUME_TYPE_IO1: &str = "io1";
pub const VOLUME_TYPE_ST1: &str = "st1";
pub const VOLUME_TYPE_SC1: &str = "sc1";
pub const DEFAULT_VOLUME_TYPE: &str = VOLUME_TYPE_GP2;

/// A provisioned block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
  pub volume_id: String,
  pub capacity_gib: i64,
  pub availability_zone: String,
  /// Empty until CreateVolume stamps the requested filesystem type.
  pub fs_type: String,
}

/// A point-in-time copy of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
  pub snapshot_id: String,
  pub source_volume_id: String,
  pub size_bytes: i64,
  pub creation_time: SystemTime,
  pub ready_to_use: bool,
}

/// Parameters for a disk creation request.
#[derive(Debug, Clone, Default)]
pub struct DiskOptions {
  pub capacity_bytes: i64,
  pub tags: HashMap<String, String>,
  pub volume_type: String,
  pub iops_per_gb: i32,
  pub availability_zone: String,
  pub encrypted: bool,
  pub kms_key_id: String,
  /// When set, the volume is restored from this snapshot.
  pub snapshot_id: String,
}

/// Parameters for a snapshot creation request.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
  pub tags: HashMap<String, String>,
}

/// Block-device operations the driver needs from the cloud.
///
/// Create operations are idempotent by name tag and block until the
/// provider reports the resource usable; waits follow the exponential
/// backoff in [`Backoff`]. Every method observes cancellation at its
/// await points.
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
  /// Creates a disk carrying `name` in its name tag and waits for it to
  /// become `available`.
  ///
  /// Returns the existing disk when one with the same name and size
  /// already exists, [`CloudError::AlreadyExists`] when the existing disk
  /// has a different size, and [`CloudError::WaitTimeout`] when the wait
  /// expires.
  async fn create_disk(&self, name: &str, opts: DiskOptions) -> Result<Disk, CloudError>;

  /// Deletes a disk. Returns [`CloudError::NotFound`] if the disk does
  /// not exist at call time.
  async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError>;

  /// Resolves a disk by its name tag.
  ///
  /// Returns [`CloudError::NotFound`] for zero matches,
  /// [`CloudError::MultiDisks`] for more than one, and
  /// [`CloudError::DiskExistsDiffSize`] when the single match does not
  /// have the requested capacity.
  async fn get_disk_by_name(&self, name: &str, capacity_bytes: i64) -> Result<Disk, CloudError>;

  /// Resolves a disk by provider volume ID.
  async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError>;

  /// Attaches the disk to the instance, waits for the attachment to
  /// report `attached` and returns the device path.
  ///
  /// Attaching a disk that is already attached to the same instance
  /// returns the existing device path; attached to a different instance
  /// returns [`CloudError::AlreadyExists`].
  async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<String, CloudError>;

  /// Detaches the disk and waits for it to become `available` again.
  /// Detaching an already-detached or missing disk succeeds.
  async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError>;

  /// Whether the instance exists at the provider.
  async fn is_exist_instance(&self, instance_id: &str) -> bool;

  /// Creates a snapshot of the volume and waits for it to complete. Same
  /// name-tag idempotence discipline as disks.
  async fn create_snapshot(
    &self,
    volume_id: &str,
    opts: SnapshotOptions,
  ) -> Result<Snapshot, CloudError>;

  /// Deletes a snapshot. Returns [`CloudError::NotFound`] if absent.
  async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError>;

  /// Resolves a snapshot by its name tag.
  async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot, CloudError>;
}
