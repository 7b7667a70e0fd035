//! The EBS CSI driver: identity, controller and node services on one
//! shared [`Driver`] value.
//!
//! The controller half turns idempotent CO requests into EC2 provisioning
//! calls through [`ebs_cloud::CloudProvider`]; the node half turns an
//! attached block device into a mounted filesystem through
//! [`mount_utils::Mounter`]. Neither keeps state of its own: idempotence
//! is recovered from provider tags and the host mount table on every
//! request.

mod controller;
mod identity;
mod node;

use ebs_cloud::{CloudProvider, Metadata};
use mount_utils::Mounter;
use std::sync::Arc;

/// Reverse-DNS plugin name reported by the identity service.
pub const DRIVER_NAME: &str = "ebs.csi.aws.com";

/// Key identifying the zone dimension in topology segments.
pub const TOPOLOGY_KEY: &str = "topology.ebs.csi.aws.com/zone";

/// Sole publish-context key: the provider-reported device path.
pub const DEVICE_PATH_KEY: &str = "devicePath";

/// Volume-context key for the filesystem type chosen at CreateVolume.
pub const FS_TYPE_KEY: &str = "fsType";

/// Filesystem used when neither the volume context nor the device carry
/// one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// All three CSI services in one value; cheap to clone so each tonic
/// service can own one.
pub struct Driver<C> {
  cloud: Arc<C>,
  mounter: Arc<dyn Mounter>,
  metadata: Metadata,
}

impl<C: CloudProvider> Driver<C> {
  pub fn new(cloud: Arc<C>, mounter: Arc<dyn Mounter>, metadata: Metadata) -> Self {
    Driver {
      cloud,
      mounter,
      metadata,
    }
  }
}

impl<C> Clone for Driver<C> {
  fn clone(&self) -> Self {
    Driver {
      cloud: Arc::clone(&self.cloud),
      mounter: Arc::clone(&self.mounter),
      metadata: self.metadata.clone(),
    }
  }
}

/// The single access mode this driver provisions for.
const SUPPORTED_ACCESS_MODES: &[csi_proto::AccessMode] =
  &[csi_proto::AccessMode::SingleNodeWriter];

/// Whether every supplied capability's access mode lies in the supported
/// set.
fn is_valid_volume_capabilities(caps: &[csi_proto::v1::VolumeCapability]) -> bool {
  caps
    .iter()
    .all(|cap| SUPPORTED_ACCESS_MODES.contains(&cap.mode()))
}

#[cfg(test)]
pub(crate) mod test_support {
  use super::*;
  use ebs_cloud::FakeCloud;
  use mount_utils::FakeMounter;

  pub(crate) const TEST_INSTANCE_ID: &str = "i-1234567890abcdef0";
  pub(crate) const TEST_ZONE: &str = "us-west-2b";

  pub(crate) struct TestDriver {
    pub driver: Driver<FakeCloud>,
    pub cloud: Arc<FakeCloud>,
    pub mounter: Arc<FakeMounter>,
  }

  pub(crate) fn test_driver() -> TestDriver {
    let cloud = Arc::new(FakeCloud::new());
    let mounter = Arc::new(FakeMounter::new([]));
    let metadata = Metadata::from_values(TEST_INSTANCE_ID, TEST_ZONE).unwrap();

    TestDriver {
      driver: Driver::new(cloud.clone(), mounter.clone(), metadata),
      cloud,
      mounter,
    }
  }
}
