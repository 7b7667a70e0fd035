use crate::{Driver, is_valid_volume_capabilities, DEVICE_PATH_KEY, FS_TYPE_KEY, TOPOLOGY_KEY};
use csi_proto::v1 as csi;
use ebs_cloud::{
  util, CloudError, CloudProvider, Disk, DiskOptions, Snapshot, SnapshotOptions,
  DEFAULT_VOLUME_SIZE, SNAPSHOT_NAME_TAG_KEY, VOLUME_NAME_TAG_KEY, VOLUME_TYPE_IO1,
};
use std::collections::HashMap;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument};

#[tonic::async_trait]
impl<C: CloudProvider> csi::controller_server::Controller for Driver<C> {
  #[instrument(name = "controller.create_volume", skip(self, request))]
  async fn create_volume(
    &self,
    request: Request<csi::CreateVolumeRequest>,
  ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
    let req = request.into_inner();
    debug!(name = %req.name, "CreateVolume called");

    if req.name.is_empty() {
      return Err(Status::invalid_argument("Volume name not provided"));
    }

    let requested = req
      .capacity_range
      .as_ref()
      .map(|range| range.required_bytes)
      .filter(|bytes| *bytes > 0)
      .unwrap_or(DEFAULT_VOLUME_SIZE);
    let size_bytes = util::round_up_bytes(requested);

    if let Some(range) = &req.capacity_range {
      if range.limit_bytes > 0 && size_bytes > range.limit_bytes {
        return Err(Status::invalid_argument(
          "After round-up, volume size exceeds the limit specified",
        ));
      }
    }

    if req.volume_capabilities.is_empty() {
      return Err(Status::invalid_argument("Volume capabilities not provided"));
    }
    if !is_valid_volume_capabilities(&req.volume_capabilities) {
      return Err(Status::invalid_argument(
        "Volume capabilities not supported",
      ));
    }

    match self.cloud.get_disk_by_name(&req.name, size_bytes).await {
      // Volume exists already; hand the same answer back.
      Ok(disk) => return Ok(Response::new(create_volume_response(&disk))),
      Err(CloudError::NotFound) => (),
      Err(CloudError::DiskExistsDiffSize) => {
        return Err(Status::already_exists(
          CloudError::DiskExistsDiffSize.to_string(),
        ))
      }
      Err(e) => return Err(Status::internal(e.to_string())),
    }

    let params = &req.parameters;
    let volume_type = params.get("type").cloned().unwrap_or_default();
    let mut iops_per_gb = 0;
    if volume_type == VOLUME_TYPE_IO1 {
      iops_per_gb = params
        .get("iopsPerGB")
        .map(String::as_str)
        .unwrap_or("")
        .parse()
        .map_err(|e| Status::invalid_argument(format!("Could not parse invalid iopsPerGB: {e}")))?;
    }

    let encrypted = params.get("encrypted").map(String::as_str) == Some("true");
    let kms_key_id = if encrypted {
      params.get("kmsKeyId").cloned().unwrap_or_default()
    } else {
      String::new()
    };

    let mut opts = DiskOptions {
      capacity_bytes: size_bytes,
      tags: HashMap::from([(VOLUME_NAME_TAG_KEY.to_string(), req.name.clone())]),
      volume_type,
      iops_per_gb,
      availability_zone: pick_availability_zone(req.accessibility_requirements.as_ref()),
      encrypted,
      kms_key_id,
      snapshot_id: String::new(),
    };

    if let Some(source) = &req.volume_content_source {
      match &source.r#type {
        Some(csi::volume_content_source::Type::Snapshot(snapshot)) => {
          opts.snapshot_id = snapshot.snapshot_id.clone();
        }
        _ => {
          return Err(Status::invalid_argument(
            "Unsupported volumeContentSource type",
          ))
        }
      }
    }

    let mut disk = self
      .cloud
      .create_disk(&req.name, opts)
      .await
      .map_err(|e| Status::internal(format!("Could not create volume {:?}: {e}", req.name)))?;
    disk.fs_type = params.get(FS_TYPE_KEY).cloned().unwrap_or_default();

    info!(volume_id = %disk.volume_id, name = %req.name, "created volume");
    Ok(Response::new(create_volume_response(&disk)))
  }

  #[instrument(name = "controller.delete_volume", skip(self, request))]
  async fn delete_volume(
    &self,
    request: Request<csi::DeleteVolumeRequest>,
  ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
    let req = request.into_inner();
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("Volume ID not provided"));
    }

    match self.cloud.delete_disk(&req.volume_id).await {
      Ok(()) => (),
      Err(CloudError::NotFound) => {
        debug!(volume_id = %req.volume_id, "volume not found, returning with success");
      }
      Err(e) => {
        return Err(Status::internal(format!(
          "Could not delete volume ID {:?}: {e}",
          req.volume_id
        )))
      }
    }

    Ok(Response::new(csi::DeleteVolumeResponse {}))
  }

  #[instrument(name = "controller.controller_publish_volume", skip(self, request))]
  async fn controller_publish_volume(
    &self,
    request: Request<csi::ControllerPublishVolumeRequest>,
  ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
    let req = request.into_inner();
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("Volume ID not provided"));
    }
    if req.node_id.is_empty() {
      return Err(Status::invalid_argument("Node ID not provided"));
    }
    let capability = req
      .volume_capability
      .clone()
      .ok_or_else(|| Status::invalid_argument("Volume capability not provided"))?;
    if !is_valid_volume_capabilities(&[capability]) {
      return Err(Status::invalid_argument("Volume capability not supported"));
    }

    if !self.cloud.is_exist_instance(&req.node_id).await {
      return Err(Status::not_found(format!(
        "Instance {:?} not found",
        req.node_id
      )));
    }

    if let Err(e) = self.cloud.get_disk_by_id(&req.volume_id).await {
      return Err(match e {
        CloudError::NotFound => Status::not_found("Volume not found"),
        e => Status::internal(format!(
          "Could not get volume with ID {:?}: {e}",
          req.volume_id
        )),
      });
    }

    let device_path = match self.cloud.attach_disk(&req.volume_id, &req.node_id).await {
      Ok(device) => device,
      Err(CloudError::AlreadyExists) => {
        return Err(Status::already_exists(CloudError::AlreadyExists.to_string()))
      }
      Err(e) => {
        return Err(Status::internal(format!(
          "Could not attach volume {:?} to node {:?}: {e}",
          req.volume_id, req.node_id
        )))
      }
    };

    info!(
      volume_id = %req.volume_id,
      node_id = %req.node_id,
      device_path = %device_path,
      "attached volume"
    );
    Ok(Response::new(csi::ControllerPublishVolumeResponse {
      publish_context: HashMap::from([(DEVICE_PATH_KEY.to_string(), device_path)]),
    }))
  }

  #[instrument(name = "controller.controller_unpublish_volume", skip(self, request))]
  async fn controller_unpublish_volume(
    &self,
    request: Request<csi::ControllerUnpublishVolumeRequest>,
  ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
    let req = request.into_inner();
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("Volume ID not provided"));
    }
    if req.node_id.is_empty() {
      return Err(Status::invalid_argument("Node ID not provided"));
    }

    self
      .cloud
      .detach_disk(&req.volume_id, &req.node_id)
      .await
      .map_err(|e| {
        Status::internal(format!(
          "Could not detach volume {:?} from node {:?}: {e}",
          req.volume_id, req.node_id
        ))
      })?;

    info!(volume_id = %req.volume_id, node_id = %req.node_id, "detached volume");
    Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
  }

  #[instrument(name = "controller.validate_volume_capabilities", skip(self, request))]
  async fn validate_volume_capabilities(
    &self,
    request: Request<csi::ValidateVolumeCapabilitiesRequest>,
  ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
    let req = request.into_inner();
    if req.volume_id.is_empty() {
      return Err(Status::invalid_argument("Volume ID not provided"));
    }
    if req.volume_capabilities.is_empty() {
      return Err(Status::invalid_argument("Volume capabilities not provided"));
    }

    if let Err(e) = self.cloud.get_disk_by_id(&req.volume_id).await {
      return Err(match e {
        CloudError::NotFound => Status::not_found("Volume not found"),
        e => Status::internal(format!(
          "Could not get volume with ID {:?}: {e}",
          req.volume_id
        )),
      });
    }

    let confirmed = if is_valid_volume_capabilities(&req.volume_capabilities) {
      Some(csi::validate_volume_capabilities_response::Confirmed {
        volume_context: Default::default(),
        volume_capabilities: req.volume_capabilities,
        parameters: Default::default(),
      })
    } else {
      None
    };

    Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
      confirmed,
      message: String::new(),
    }))
  }

  #[instrument(name = "controller.list_volumes", skip(self, _request))]
  async fn list_volumes(
    &self,
    _request: Request<csi::ListVolumesRequest>,
  ) -> Result<Response<csi::ListVolumesResponse>, Status> {
    Err(Status::unimplemented(""))
  }

  #[instrument(name = "controller.get_capacity", skip(self, _request))]
  async fn get_capacity(
    &self,
    _request: Request<csi::GetCapacityRequest>,
  ) -> Result<Response<csi::GetCapacityResponse>, Status> {
    Err(Status::unimplemented(""))
  }

  #[instrument(name = "controller.controller_get_capabilities", skip(self, _request))]
  async fn controller_get_capabilities(
    &self,
    _request: Request<csi::ControllerGetCapabilitiesRequest>,
  ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
    use csi::controller_service_capability::{rpc, Rpc, Type};

    let capabilities = [
      rpc::Type::CreateDeleteVolume,
      rpc::Type::PublishUnpublishVolume,
      rpc::Type::CreateDeleteSnapshot,
    ]
    .into_iter()
    .map(|ty| csi::ControllerServiceCapability {
      r#type: Some(Type::Rpc(Rpc { r#type: ty as i32 })),
    })
    .collect();

    Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
      capabilities,
    }))
  }

  #[instrument(name = "controller.create_snapshot", skip(self, request))]
  async fn create_snapshot(
    &self,
    request: Request<csi::CreateSnapshotRequest>,
  ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
    let req = request.into_inner();
    if req.name.is_empty() {
      return Err(Status::invalid_argument("Snapshot name not provided"));
    }
    if req.source_volume_id.is_empty() {
      return Err(Status::invalid_argument(
        "Snapshot volume source ID not provided",
      ));
    }

    match self.cloud.get_snapshot_by_name(&req.name).await {
      Ok(snapshot) => {
        return if snapshot.source_volume_id == req.source_volume_id {
          info!(
            name = %req.name,
            volume_id = %req.source_volume_id,
            "snapshot already exists; nothing to do"
          );
          Ok(Response::new(create_snapshot_response(&snapshot)))
        } else {
          Err(Status::already_exists(format!(
            "Snapshot {} already exists for different volume ({})",
            req.name, snapshot.source_volume_id
          )))
        };
      }
      Err(CloudError::NotFound) => (),
      Err(e) => return Err(Status::internal(e.to_string())),
    }

    let opts = SnapshotOptions {
      tags: HashMap::from([(SNAPSHOT_NAME_TAG_KEY.to_string(), req.name.clone())]),
    };
    let snapshot = self
      .cloud
      .create_snapshot(&req.source_volume_id, opts)
      .await
      .map_err(|e| Status::internal(format!("Could not create snapshot {:?}: {e}", req.name)))?;

    info!(snapshot_id = %snapshot.snapshot_id, name = %req.name, "created snapshot");
    Ok(Response::new(create_snapshot_response(&snapshot)))
  }

  #[instrument(name = "controller.delete_snapshot", skip(self, request))]
  async fn delete_snapshot(
    &self,
    request: Request<csi::DeleteSnapshotRequest>,
  ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
    let req = request.into_inner();
    if req.snapshot_id.is_empty() {
      return Err(Status::invalid_argument("Snapshot ID not provided"));
    }

    match self.cloud.delete_snapshot(&req.snapshot_id).await {
      Ok(()) => (),
      Err(CloudError::NotFound) => {
        debug!(snapshot_id = %req.snapshot_id, "snapshot not found, returning with success");
      }
      Err(e) => {
        return Err(Status::internal(format!(
          "Could not delete snapshot ID {:?}: {e}",
          req.snapshot_id
        )))
      }
    }

    Ok(Response::new(csi::DeleteSnapshotResponse {}))
  }

  #[instrument(name = "controller.list_snapshots", skip(self, _request))]
  async fn list_snapshots(
    &self,
    _request: Request<csi::ListSnapshotsRequest>,
  ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
    Err(Status::unimplemented(""))
  }
}

/// Selects one zone given a topology requirement: the first zone-keyed
/// segment in `preferred` wins, then `requisite` is scanned; no match
/// yields an empty string and the provider picks within its region.
fn pick_availability_zone(requirement: Option<&csi::TopologyRequirement>) -> String {
  let Some(requirement) = requirement else {
    return String::new();
  };

  requirement
    .preferred
    .iter()
    .chain(requirement.requisite.iter())
    .find_map(|topology| topology.segments.get(TOPOLOGY_KEY).cloned())
    .unwrap_or_default()
}

fn create_volume_response(disk: &Disk) -> csi::CreateVolumeResponse {
  csi::CreateVolumeResponse {
    volume: Some(csi::Volume {
      capacity_bytes: util::gib_to_bytes(disk.capacity_gib),
      volume_id: disk.volume_id.clone(),
      volume_context: HashMap::from([(FS_TYPE_KEY.to_string(), disk.fs_type.clone())]),
      content_source: None,
      accessible_topology: vec![csi::Topology {
        segments: HashMap::from([(TOPOLOGY_KEY.to_string(), disk.availability_zone.clone())]),
      }],
    }),
  }
}

fn create_snapshot_response(snapshot: &Snapshot) -> csi::CreateSnapshotResponse {
  csi::CreateSnapshotResponse {
    snapshot: Some(csi::Snapshot {
      size_bytes: snapshot.size_bytes,
      snapshot_id: snapshot.snapshot_id.clone(),
      source_volume_id: snapshot.source_volume_id.clone(),
      creation_time: Some(prost_types::Timestamp::from(snapshot.creation_time)),
      // In EBS it is either this or the create fails.
      ready_to_use: true,
    }),
  }
}
