use crate::{
  is_valid_volume_capabilities, Driver, DEFAULT_FS_TYPE, DEVICE_PATH_KEY, FS_TYPE_KEY,
  TOPOLOGY_KEY,
};
use csi_proto::v1 as csi;
use ebs_cloud::CloudProvider;
use mount_utils::{MountError, Mounter};
use std::{
  collections::HashMap,
  io,
  path::PathBuf,
  sync::Arc,
  time::Duration,
};
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};

/// How long to keep polling for the block device after a successful
/// attach; the kernel can take a few seconds to surface it.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEVICE_POLL_ATTEMPTS: u32 = 15;

impl<C: CloudProvider> Driver<C> {
  /// Runs a mount-table operation off the async executor. The host mount
  /// primitives are synchronous and not cancellable once begun.
  async fn run_mount<T, F>(&self, f: F) -> mount_utils::Result<T>
  where
    F: FnOnce(&dyn Mounter) -> mount_utils::Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let mounter = Arc::clone(&self.mounter);
    match tokio::task::spawn_blocking(move || f(mounter.as_ref())).await {
      Ok(result) => result,
      Err(e) => Err(MountError::UnknownMountError(io::Error::other(format!(
        "mount task failed: {e}"
      )))),
    }
  }

  /// Resolves the kernel-visible device for a provider-reported device
  /// path, waiting for it to appear.
  ///
  /// On Xen instances the provider path matches the kernel path; on some
  /// hypervisors the `xvd` prefix is surfaced as `sd` (or the other way
  /// around), so both spellings are probed.
  async fn find_device_path(&self, device_path: &str) -> Result<PathBuf, Status> {
    let candidates = device_path_candidates(device_path);

    for attempt in 0..DEVICE_POLL_ATTEMPTS {
      for candidate in &candidates {
        let probe = candidate.clone();
        let exists = self
          .run_mount(move |m| m.path_exists(&probe))
          .await
          .map_err(|e| Status::internal(e.to_string()))?;
        if exists {
          return Ok(candidate.clone());
        }
      }

      if attempt + 1 < DEVICE_POLL_ATTEMPTS {
        debug!(device_path, attempt, "device not visible yet");
        tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
      }
    }

    Err(Status::internal(format!(
      "Device path {device_path} did not appear on the node"
    )))
  }
}

fn device_path_candidates(device_path: &str) -> Vec<PathBuf> {
  let mut candidates = vec![PathBuf::from(device_path)];
  if let Some(rest) = device_path.strip_prefix("/dev/xvd") {
    candidates.push(PathBuf::from(format!("/dev/sd{rest}")));
  } else if let Some(rest) = device_path.strip_prefix("/dev/sd") {
    candidates.push(PathBuf::from(format!("/dev/xvd{rest}")));
  }
  candidates
}

#[tonic::async_trait]
impl<C: CloudProvider> csi::node_server::Node for Driver<C> {
  #[instrument(name = "node.node_stage_volume", skip(self, request))]
  async fn node_stage_volume(
    &self,
    request: Request<csi::NodeStageVolumeRequest>,
  ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
    let req = request.into_inner();
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("Volume ID not provided"));
    }
    if req.staging_target_path.is_empty() {
      return Err(Status::invalid_argument("Staging target not provided"));
    }
    let capability = req
      .volume_capability
      .clone()
      .ok_or_else(|| Status::invalid_argument("Volume capability not provided"))?;
    if !is_valid_volume_capabilities(&[capability]) {
      return Err(Status::invalid_argument("Volume capability not supported"));
    }

    let device_path = req
      .publish_context
      .get(DEVICE_PATH_KEY)
      .cloned()
      .ok_or_else(|| Status::invalid_argument("Device path not provided"))?;

    let device = self.find_device_path(&device_path).await?;
    let staging = PathBuf::from(&req.staging_target_path);

    // A retried stage after a crash may find the work already done.
    let staged_path = staging.clone();
    if let Some(mounted_device) = self
      .run_mount(move |m| m.device_name_from_mount(&staged_path))
      .await
      .map_err(|e| Status::internal(e.to_string()))?
    {
      if mounted_device == device {
        info!(
          volume_id = %req.volume_id,
          staging = %staging.display(),
          "volume already staged"
        );
        return Ok(Response::new(csi::NodeStageVolumeResponse {}));
      }
      return Err(Status::already_exists(format!(
        "Staging path {} is mounted to a different device {}",
        staging.display(),
        mounted_device.display()
      )));
    }

    let fs_type = match req.volume_context.get(FS_TYPE_KEY) {
      Some(v) if !v.is_empty() => v.clone(),
      _ => DEFAULT_FS_TYPE.to_string(),
    };

    info!(
      volume_id = %req.volume_id,
      device = %device.display(),
      staging = %staging.display(),
      fs_type = %fs_type,
      "staging volume"
    );
    let mount_device = device.clone();
    let mount_target = staging.clone();
    let mount_fs = fs_type.clone();
    self
      .run_mount(move |m| m.format_and_mount(&mount_device, &mount_target, &mount_fs, &[]))
      .await
      .map_err(|e| match e {
        MountError::FilesystemMismatch(msg) => Status::invalid_argument(msg),
        e => Status::internal(format!(
          "Could not stage volume {:?} at {:?}: {e}",
          req.volume_id, req.staging_target_path
        )),
      })?;

    Ok(Response::new(csi::NodeStageVolumeResponse {}))
  }

  #[instrument(name = "node.node_unstage_volume", skip(self, request))]
  async fn node_unstage_volume(
    &self,
    request: Request<csi::NodeUnstageVolumeRequest>,
  ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
    let req = request.into_inner();
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("Volume ID not provided"));
    }
    if req.staging_target_path.is_empty() {
      return Err(Status::invalid_argument("Staging target not provided"));
    }

    self
      .unmount_if_mounted(PathBuf::from(&req.staging_target_path))
      .await?;

    info!(volume_id = %req.volume_id, staging = %req.staging_target_path, "unstaged volume");
    Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
  }

  #[instrument(name = "node.node_publish_volume", skip(self, request))]
  async fn node_publish_volume(
    &self,
    request: Request<csi::NodePublishVolumeRequest>,
  ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
    let req = request.into_inner();
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("Volume ID not provided"));
    }
    if req.staging_target_path.is_empty() {
      return Err(Status::invalid_argument("Staging target not provided"));
    }
    if req.target_path.is_empty() {
      return Err(Status::invalid_argument("Target path not provided"));
    }
    let capability = req
      .volume_capability
      .clone()
      .ok_or_else(|| Status::invalid_argument("Volume capability not provided"))?;
    if !is_valid_volume_capabilities(&[capability]) {
      return Err(Status::invalid_argument("Volume capability not supported"));
    }

    let source = PathBuf::from(&req.staging_target_path);
    let target = PathBuf::from(&req.target_path);

    let mut options = vec!["bind".to_string()];
    if req.readonly {
      options.push("ro".to_string());
    }

    let probe = target.clone();
    let not_mounted = self
      .run_mount(move |m| {
        if !m.path_exists(&probe)? {
          m.make_dir(&probe)?;
        }
        m.is_not_mount_point(&probe)
      })
      .await
      .map_err(|e| Status::internal(e.to_string()))?;
    if !not_mounted {
      debug!(target = %target.display(), "target already mounted");
      return Ok(Response::new(csi::NodePublishVolumeResponse {}));
    }

    info!(
      volume_id = %req.volume_id,
      source = %source.display(),
      target = %target.display(),
      readonly = req.readonly,
      "publishing volume"
    );
    self
      .run_mount(move |m| m.mount(&source, &target, "", &options))
      .await
      .map_err(|e| {
        Status::internal(format!(
          "Could not publish volume {:?} at {:?}: {e}",
          req.volume_id, req.target_path
        ))
      })?;

    Ok(Response::new(csi::NodePublishVolumeResponse {}))
  }

  #[instrument(name = "node.node_unpublish_volume", skip(self, request))]
  async fn node_unpublish_volume(
    &self,
    request: Request<csi::NodeUnpublishVolumeRequest>,
  ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
    let req = request.into_inner();
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("Volume ID not provided"));
    }
    if req.target_path.is_empty() {
      return Err(Status::invalid_argument("Target path not provided"));
    }

    self
      .unmount_if_mounted(PathBuf::from(&req.target_path))
      .await?;

    info!(volume_id = %req.volume_id, target = %req.target_path, "unpublished volume");
    Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
  }

  #[instrument(name = "node.node_get_capabilities", skip(self, _request))]
  async fn node_get_capabilities(
    &self,
    _request: Request<csi::NodeGetCapabilitiesRequest>,
  ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
    use csi::node_service_capability::{rpc, Rpc, Type};

    let capabilities = vec![csi::NodeServiceCapability {
      r#type: Some(Type::Rpc(Rpc {
        r#type: rpc::Type::StageUnstageVolume as i32,
      })),
    }];

    Ok(Response::new(csi::NodeGetCapabilitiesResponse {
      capabilities,
    }))
  }

  #[instrument(name = "node.node_get_info", skip(self, _request))]
  async fn node_get_info(
    &self,
    _request: Request<csi::NodeGetInfoRequest>,
  ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
    let response = csi::NodeGetInfoResponse {
      node_id: self.metadata.instance_id().to_string(),
      max_volumes_per_node: 0,
      accessible_topology: Some(csi::Topology {
        segments: HashMap::from([(
          TOPOLOGY_KEY.to_string(),
          self.metadata.availability_zone().to_string(),
        )]),
      }),
    };

    Ok(Response::new(response))
  }
}

impl<C: CloudProvider> Driver<C> {
  /// Unmounts the path unless it is already unmounted or gone.
  async fn unmount_if_mounted(&self, path: PathBuf) -> Result<(), Status> {
    self
      .run_mount(move |m| {
        if !m.path_exists(&path)? {
          return Ok(());
        }
        if m.is_not_mount_point(&path)? {
          return Ok(());
        }
        m.unmount(&path)
      })
      .await
      .map_err(|e| Status::internal(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{test_driver, TEST_INSTANCE_ID, TEST_ZONE};
  use csi::node_server::Node as _;
  use csi_proto::AccessMode;
  use mount_utils::FakeAction;
  use tonic::Code;

  const DEVICE: &str = "/dev/xvdba";

  fn volume_cap() -> csi::VolumeCapability {
    csi::VolumeCapability {
      access_mode: Some(csi::volume_capability::AccessMode {
        mode: AccessMode::SingleNodeWriter as i32,
      }),
      access_type: Some(csi::volume_capability::AccessType::Mount(
        csi::volume_capability::MountVolume::default(),
      )),
    }
  }

  fn stage_request(staging: &str) -> csi::NodeStageVolumeRequest {
    csi::NodeStageVolumeRequest {
      volume_id: "vol-test".to_string(),
      publish_context: HashMap::from([(DEVICE_PATH_KEY.to_string(), DEVICE.to_string())]),
      staging_target_path: staging.to_string(),
      volume_capability: Some(volume_cap()),
      ..Default::default()
    }
  }

  fn publish_request(staging: &str, target: &str, readonly: bool) -> csi::NodePublishVolumeRequest {
    csi::NodePublishVolumeRequest {
      volume_id: "vol-test".to_string(),
      staging_target_path: staging.to_string(),
      target_path: target.to_string(),
      volume_capability: Some(volume_cap()),
      readonly,
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn stage_formats_and_mounts_a_blank_device() {
    let harness = test_driver();
    harness
      .driver
      .node_stage_volume(Request::new(stage_request("/stage/vol-test")))
      .await
      .unwrap();

    let log = harness.mounter.get_log();
    assert!(log.iter().any(|a| matches!(
      a,
      FakeAction::Format { device, fs_type } if device == &PathBuf::from(DEVICE) && fs_type == DEFAULT_FS_TYPE
    )));
    assert!(log.iter().any(|a| matches!(
      a,
      FakeAction::Mount { target, .. } if target == &PathBuf::from("/stage/vol-test")
    )));
  }

  #[tokio::test]
  async fn stage_is_idempotent() {
    let harness = test_driver();
    harness
      .driver
      .node_stage_volume(Request::new(stage_request("/stage/vol-test")))
      .await
      .unwrap();
    harness.mounter.reset_log();

    harness
      .driver
      .node_stage_volume(Request::new(stage_request("/stage/vol-test")))
      .await
      .unwrap();

    // Second call must not format or mount again.
    assert!(harness.mounter.get_log().is_empty());
  }

  #[tokio::test]
  async fn stage_respects_requested_fs_type() {
    let harness = test_driver();
    let mut request = stage_request("/stage/vol-test");
    request.volume_context = HashMap::from([(FS_TYPE_KEY.to_string(), "xfs".to_string())]);

    harness
      .driver
      .node_stage_volume(Request::new(request))
      .await
      .unwrap();
    assert_eq!(
      harness
        .mounter
        .get_device_format(std::path::Path::new(DEVICE))
        .unwrap(),
      Some("xfs".to_string())
    );
  }

  #[tokio::test]
  async fn stage_rejects_mismatched_filesystem() {
    let harness = test_driver();
    harness.mounter.set_device_format(DEVICE, "xfs");

    let mut request = stage_request("/stage/vol-test");
    request.volume_context = HashMap::from([(FS_TYPE_KEY.to_string(), "ext4".to_string())]);

    let err = harness
      .driver
      .node_stage_volume(Request::new(request))
      .await
      .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
  }

  #[tokio::test]
  async fn stage_requires_device_path_in_publish_context() {
    let harness = test_driver();
    let mut request = stage_request("/stage/vol-test");
    request.publish_context.clear();

    let err = harness
      .driver
      .node_stage_volume(Request::new(request))
      .await
      .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
  }

  #[tokio::test]
  async fn stage_rejects_unsupported_capability() {
    let harness = test_driver();
    let mut request = stage_request("/stage/vol-test");
    request.volume_capability = Some(csi::VolumeCapability {
      access_mode: Some(csi::volume_capability::AccessMode {
        mode: AccessMode::MultiNodeMultiWriter as i32,
      }),
      access_type: Some(csi::volume_capability::AccessType::Mount(
        csi::volume_capability::MountVolume::default(),
      )),
    });

    let err = harness
      .driver
      .node_stage_volume(Request::new(request))
      .await
      .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
  }

  #[tokio::test]
  async fn publish_bind_mounts_the_staging_path() {
    let harness = test_driver();
    harness
      .driver
      .node_stage_volume(Request::new(stage_request("/stage/vol-test")))
      .await
      .unwrap();

    harness
      .driver
      .node_publish_volume(Request::new(publish_request(
        "/stage/vol-test",
        "/pods/pod-1/vol-test",
        false,
      )))
      .await
      .unwrap();

    // The bind mount resolves to the backing device, like /proc/mounts
    // would.
    assert_eq!(
      harness
        .mounter
        .device_name_from_mount(std::path::Path::new("/pods/pod-1/vol-test"))
        .unwrap(),
      Some(PathBuf::from(DEVICE))
    );
  }

  #[tokio::test]
  async fn publish_readonly_adds_ro_option() {
    let harness = test_driver();
    harness
      .driver
      .node_publish_volume(Request::new(publish_request(
        "/stage/vol-test",
        "/pods/pod-1/vol-test",
        true,
      )))
      .await
      .unwrap();

    let mounts = harness.mounter.list().unwrap();
    assert_eq!(mounts.len(), 1);
    assert!(mounts[0].opts.contains(&"bind".to_string()));
    assert!(mounts[0].opts.contains(&"ro".to_string()));
  }

  #[tokio::test]
  async fn publish_twice_mounts_once() {
    let harness = test_driver();
    let request = || publish_request("/stage/vol-test", "/pods/pod-1/vol-test", false);

    harness
      .driver
      .node_publish_volume(Request::new(request()))
      .await
      .unwrap();
    harness
      .driver
      .node_publish_volume(Request::new(request()))
      .await
      .unwrap();

    assert_eq!(harness.mounter.list().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn full_stage_publish_unpublish_unstage_round_trip() {
    let harness = test_driver();
    let staging = "/stage/vol-test";
    let target = "/pods/pod-1/vol-test";

    harness
      .driver
      .node_stage_volume(Request::new(stage_request(staging)))
      .await
      .unwrap();
    harness
      .driver
      .node_publish_volume(Request::new(publish_request(staging, target, false)))
      .await
      .unwrap();
    assert_eq!(harness.mounter.list().unwrap().len(), 2);

    harness
      .driver
      .node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
        volume_id: "vol-test".to_string(),
        target_path: target.to_string(),
      }))
      .await
      .unwrap();
    assert_eq!(harness.mounter.list().unwrap().len(), 1);

    harness
      .driver
      .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
        volume_id: "vol-test".to_string(),
        staging_target_path: staging.to_string(),
      }))
      .await
      .unwrap();
    assert!(harness.mounter.list().unwrap().is_empty());

    // The filesystem survives the unmounts; a re-stage must not reformat.
    harness.mounter.reset_log();
    harness
      .driver
      .node_stage_volume(Request::new(stage_request(staging)))
      .await
      .unwrap();
    assert!(harness
      .mounter
      .get_log()
      .iter()
      .all(|a| !matches!(a, FakeAction::Format { .. })));
  }

  #[tokio::test]
  async fn unpublish_and_unstage_are_idempotent() {
    let harness = test_driver();

    harness
      .driver
      .node_unpublish_volume(Request::new(csi::NodeUnpublishVolumeRequest {
        volume_id: "vol-test".to_string(),
        target_path: "/pods/pod-1/vol-test".to_string(),
      }))
      .await
      .unwrap();

    harness
      .driver
      .node_unstage_volume(Request::new(csi::NodeUnstageVolumeRequest {
        volume_id: "vol-test".to_string(),
        staging_target_path: "/stage/vol-test".to_string(),
      }))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn get_info_reports_instance_and_zone() {
    let harness = test_driver();
    let info = harness
      .driver
      .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
      .await
      .unwrap()
      .into_inner();

    assert_eq!(info.node_id, TEST_INSTANCE_ID);
    assert_eq!(
      info
        .accessible_topology
        .unwrap()
        .segments
        .get(TOPOLOGY_KEY),
      Some(&TEST_ZONE.to_string())
    );
  }

  #[tokio::test]
  async fn capabilities_advertise_stage_unstage() {
    use csi::node_service_capability::{rpc, Type};

    let harness = test_driver();
    let response = harness
      .driver
      .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
      .await
      .unwrap()
      .into_inner();

    let types: Vec<i32> = response
      .capabilities
      .iter()
      .filter_map(|c| match &c.r#type {
        Some(Type::Rpc(rpc)) => Some(rpc.r#type),
        None => None,
      })
      .collect();
    assert_eq!(types, vec![rpc::Type::StageUnstageVolume as i32]);
  }

  #[test]
  fn device_candidates_cover_both_prefixes() {
    assert_eq!(
      device_path_candidates("/dev/xvdba"),
      vec![PathBuf::from("/dev/xvdba"), PathBuf::from("/dev/sdba")]
    );
    assert_eq!(
      device_path_candidates("/dev/sdf"),
      vec![PathBuf::from("/dev/sdf"), PathBuf::from("/dev/xvdf")]
    );
    assert_eq!(
      device_path_candidates("/dev/nvme1n1"),
      vec![PathBuf::from("/dev/nvme1n1")]
    );
  }
}
