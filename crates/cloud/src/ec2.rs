use crate::{
  backoff::poll_until,
  devices::next_device_name,
  util::{bytes_to_gib, round_up_gib},
  Backoff, CloudError, CloudProvider, Disk, DiskOptions, Snapshot, SnapshotOptions,
  DEFAULT_VOLUME_TYPE, SNAPSHOT_NAME_TAG_KEY, VOLUME_NAME_TAG_KEY, VOLUME_TYPE_GP2,
  VOLUME_TYPE_IO1, VOLUME_TYPE_SC1, VOLUME_TYPE_ST1,
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::{
  error::{ProvideErrorMetadata, SdkError},
  primitives::DateTime,
  types::{
    Filter, ResourceType, SnapshotState, Tag, TagSpecification, VolumeAttachmentState, VolumeState,
    VolumeType,
  },
  Client,
};
use std::{
  collections::HashSet,
  time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info};

/// EC2-backed [`CloudProvider`]. Stateless; every call re-queries provider
/// state, so idempotence survives driver restarts.
pub struct Ec2Cloud {
  client: Client,
  backoff: Backoff,
}

impl Ec2Cloud {
  /// Builds a client for the given region with credentials resolved from
  /// the SDK's standard chain (environment, profile, instance role).
  pub async fn new(region: &str) -> Self {
    let config = aws_config::defaults(BehaviorVersion::latest())
      .region(Region::new(region.to_string()))
      .load()
      .await;

    Ec2Cloud {
      client: Client::new(&config),
      backoff: Backoff::default(),
    }
  }

  async fn wait_volume_state(&self, volume_id: &str, target: VolumeState) -> Result<(), CloudError> {
    let client = self.client.clone();
    let id = volume_id.to_string();
    let wanted = target.clone();

    let reached = poll_until(self.backoff, move || {
      let client = client.clone();
      let id = id.clone();
      let wanted = wanted.clone();
      async move {
        let resp = client
          .describe_volumes()
          .volume_ids(&id)
          .send()
          .await
          .map_err(translate)?;
        let volume = match resp.volumes().first() {
          Some(v) => v,
          None => return Ok(false),
        };

        let state_matches = volume.state() == Some(&wanted);
        // `in-use` alone does not mean the device is usable; the first
        // attachment must also report `attached`.
        if wanted == VolumeState::InUse {
          let attached = volume
            .attachments()
            .first()
            .map(|a| a.state() == Some(&VolumeAttachmentState::Attached))
            .unwrap_or(false);
          Ok(state_matches && attached)
        } else {
          Ok(state_matches)
        }
      }
    })
    .await?;

    if !reached {
      return Err(CloudError::wait_timeout(volume_id, target.as_str()));
    }
    Ok(())
  }

  async fn used_device_names(&self, instance_id: &str) -> Result<HashSet<String>, CloudError> {
    let resp = self
      .client
      .describe_instances()
      .instance_ids(instance_id)
      .send()
      .await
      .map_err(translate)?;

    let instance = resp
      .reservations()
      .iter()
      .flat_map(|r| r.instances())
      .find(|i| i.instance_id() == Some(instance_id))
      .ok_or(CloudError::NotFound)?;

    Ok(
      instance
        .block_device_mappings()
        .iter()
        .filter_map(|m| m.device_name())
        .map(String::from)
        .collect(),
    )
  }

  async fn pick_zone_in_region(&self) -> Result<String, CloudError> {
    let resp = self
      .client
      .describe_availability_zones()
      .send()
      .await
      .map_err(translate)?;

    resp
      .availability_zones()
      .iter()
      .filter_map(|z| z.zone_name())
      .next()
      .map(String::from)
      .ok_or_else(|| CloudError::Provider("region reports no availability zones".into()))
  }
}

#[async_trait]
impl CloudProvider for Ec2Cloud {
  async fn create_disk(&self, name: &str, opts: DiskOptions) -> Result<Disk, CloudError> {
    // Recover idempotence from the name tag before mutating anything.
    match self.get_disk_by_name(name, opts.capacity_bytes).await {
      Ok(disk) => return Ok(disk),
      Err(CloudError::NotFound) => (),
      Err(CloudError::DiskExistsDiffSize) => return Err(CloudError::AlreadyExists),
      Err(e) => return Err(e),
    }

    let capacity_gib = round_up_gib(opts.capacity_bytes);
    let volume_type = match opts.volume_type.as_str() {
      "" => DEFAULT_VOLUME_TYPE,
      t @ (VOLUME_TYPE_GP2 | VOLUME_TYPE_IO1 | VOLUME_TYPE_ST1 | VOLUME_TYPE_SC1) => t,
      other => {
        return Err(CloudError::Provider(format!(
          "invalid volume type {other:?}"
        )))
      }
    };

    let zone = if opts.availability_zone.is_empty() {
      self.pick_zone_in_region().await?
    } else {
      opts.availability_zone.clone()
    };

    let mut tags = Vec::with_capacity(opts.tags.len());
    for (key, value) in &opts.tags {
      tags.push(Tag::builder().key(key).value(value).build());
    }

    let mut request = self
      .client
      .create_volume()
      .availability_zone(&zone)
      .size(capacity_gib as i32)
      .volume_type(VolumeType::from(volume_type))
      .encrypted(opts.encrypted)
      .tag_specifications(
        TagSpecification::builder()
          .resource_type(ResourceType::Volume)
          .set_tags(Some(tags))
          .build(),
      );
    if volume_type == VOLUME_TYPE_IO1 {
      request = request.iops((capacity_gib * opts.iops_per_gb as i64) as i32);
    }
    if !opts.kms_key_id.is_empty() {
      request = request.kms_key_id(&opts.kms_key_id);
    }
    if !opts.snapshot_id.is_empty() {
      request = request.snapshot_id(&opts.snapshot_id);
    }

    let created = request.send().await.map_err(translate)?;
    let volume_id = created
      .volume_id()
      .ok_or_else(|| CloudError::Provider("create volume response missing volume id".into()))?
      .to_string();

    info!(%volume_id, name, capacity_gib, %zone, "created volume");
    self
      .wait_volume_state(&volume_id, VolumeState::Available)
      .await?;

    Ok(Disk {
      volume_id,
      capacity_gib: created.size().unwrap_or(capacity_gib as i32) as i64,
      availability_zone: zone,
      fs_type: String::new(),
    })
  }

  async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError> {
    self
      .client
      .delete_volume()
      .volume_id(volume_id)
      .send()
      .await
      .map_err(translate)?;

    info!(volume_id, "deleted volume");
    Ok(())
  }

  async fn get_disk_by_name(&self, name: &str, capacity_bytes: i64) -> Result<Disk, CloudError> {
    let resp = self
      .client
      .describe_volumes()
      .filters(
        Filter::builder()
          .name(format!("tag:{VOLUME_NAME_TAG_KEY}"))
          .values(name)
          .build(),
      )
      .send()
      .await
      .map_err(translate)?;

    let volumes = resp.volumes();
    let volume = match volumes.len() {
      0 => return Err(CloudError::NotFound),
      1 => &volumes[0],
      _ => return Err(CloudError::MultiDisks),
    };

    let disk = disk_from_volume(volume)?;
    if disk.capacity_gib != bytes_to_gib(capacity_bytes) {
      return Err(CloudError::DiskExistsDiffSize);
    }

    Ok(disk)
  }

  async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError> {
    let resp = self
      .client
      .describe_volumes()
      .volume_ids(volume_id)
      .send()
      .await
      .map_err(translate)?;

    match resp.volumes().first() {
      Some(volume) => disk_from_volume(volume),
      None => Err(CloudError::NotFound),
    }
  }

  async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<String, CloudError> {
    let resp = self
      .client
      .describe_volumes()
      .volume_ids(volume_id)
      .send()
      .await
      .map_err(translate)?;
    let volume = resp.volumes().first().ok_or(CloudError::NotFound)?;

    // An attachment that is not on its way out decides the outcome: same
    // instance means the earlier attach already happened, anything else is
    // a single-writer conflict.
    if let Some(att) = volume
      .attachments()
      .iter()
      .find(|a| !matches!(a.state(), Some(VolumeAttachmentState::Detached)))
    {
      if att.instance_id() == Some(instance_id) {
        let device = att
          .device()
          .ok_or_else(|| CloudError::Provider("attachment reports no device name".into()))?
          .to_string();
        self
          .wait_volume_state(volume_id, VolumeState::InUse)
          .await?;
        return Ok(device);
      }
      return Err(CloudError::AlreadyExists);
    }

    let in_use = self.used_device_names(instance_id).await?;
    let device = next_device_name(&in_use)?;

    self
      .client
      .attach_volume()
      .device(&device)
      .instance_id(instance_id)
      .volume_id(volume_id)
      .send()
      .await
      .map_err(translate)?;

    debug!(volume_id, instance_id, %device, "attach submitted");
    self
      .wait_volume_state(volume_id, VolumeState::InUse)
      .await?;

    info!(volume_id, instance_id, %device, "attached volume");
    Ok(device)
  }

  async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
    let result = self
      .client
      .detach_volume()
      .volume_id(volume_id)
      .instance_id(instance_id)
      .send()
      .await;

    if let Err(err) = result {
      // A volume that is already gone or already detached satisfies the
      // caller's goal state.
      if already_detached(&err) {
        debug!(volume_id, instance_id, "volume already detached");
        return Ok(());
      }
      return Err(translate(err));
    }

    self
      .wait_volume_state(volume_id, VolumeState::Available)
      .await?;

    info!(volume_id, instance_id, "detached volume");
    Ok(())
  }

  async fn is_exist_instance(&self, instance_id: &str) -> bool {
    self.used_device_names(instance_id).await.is_ok()
  }

  async fn create_snapshot(
    &self,
    volume_id: &str,
    opts: SnapshotOptions,
  ) -> Result<Snapshot, CloudError> {
    if let Some(name) = opts.tags.get(SNAPSHOT_NAME_TAG_KEY) {
      match self.get_snapshot_by_name(name).await {
        Ok(snapshot) if snapshot.source_volume_id == volume_id => return Ok(snapshot),
        Ok(_) => return Err(CloudError::AlreadyExists),
        Err(CloudError::NotFound) => (),
        Err(e) => return Err(e),
      }
    }

    let mut tags = Vec::with_capacity(opts.tags.len());
    for (key, value) in &opts.tags {
      tags.push(Tag::builder().key(key).value(value).build());
    }

    let created = self
      .client
      .create_snapshot()
      .volume_id(volume_id)
      .tag_specifications(
        TagSpecification::builder()
          .resource_type(ResourceType::Snapshot)
          .set_tags(Some(tags))
          .build(),
      )
      .send()
      .await
      .map_err(translate)?;

    let snapshot_id = created
      .snapshot_id()
      .ok_or_else(|| CloudError::Provider("create snapshot response missing snapshot id".into()))?
      .to_string();

    info!(%snapshot_id, volume_id, "snapshot submitted");
    self.wait_snapshot_completed(&snapshot_id).await?;

    Ok(Snapshot {
      snapshot_id,
      source_volume_id: volume_id.to_string(),
      size_bytes: crate::util::gib_to_bytes(created.volume_size().unwrap_or(0) as i64),
      creation_time: created
        .start_time()
        .map(system_time)
        .unwrap_or(UNIX_EPOCH),
      ready_to_use: true,
    })
  }

  async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
    self
      .client
      .delete_snapshot()
      .snapshot_id(snapshot_id)
      .send()
      .await
      .map_err(translate)?;

    info!(snapshot_id, "deleted snapshot");
    Ok(())
  }

  async fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot, CloudError> {
    let resp = self
      .client
      .describe_snapshots()
      .filters(
        Filter::builder()
          .name(format!("tag:{SNAPSHOT_NAME_TAG_KEY}"))
          .values(name)
          .build(),
      )
      .send()
      .await
      .map_err(translate)?;

    let snapshots = resp.snapshots();
    match snapshots.len() {
      0 => Err(CloudError::NotFound),
      1 => Ok(snapshot_from(&snapshots[0])),
      _ => Err(CloudError::Provider(format!(
        "multiple snapshots carry the name {name:?}"
      ))),
    }
  }
}

impl Ec2Cloud {
  async fn wait_snapshot_completed(&self, snapshot_id: &str) -> Result<(), CloudError> {
    let client = self.client.clone();
    let id = snapshot_id.to_string();

    let reached = poll_until(self.backoff, move || {
      let client = client.clone();
      let id = id.clone();
      async move {
        let resp = client
          .describe_snapshots()
          .snapshot_ids(&id)
          .send()
          .await
          .map_err(translate)?;
        let snapshot = match resp.snapshots().first() {
          Some(s) => s,
          None => return Ok(false),
        };

        match snapshot.state() {
          Some(SnapshotState::Completed) => Ok(true),
          Some(SnapshotState::Error) => Err(CloudError::Provider(format!(
            "snapshot {id} entered error state"
          ))),
          _ => Ok(false),
        }
      }
    })
    .await?;

    if !reached {
      return Err(CloudError::wait_timeout(snapshot_id, "completed"));
    }
    Ok(())
  }
}

fn disk_from_volume(volume: &aws_sdk_ec2::types::Volume) -> Result<Disk, CloudError> {
  Ok(Disk {
    volume_id: volume
      .volume_id()
      .ok_or_else(|| CloudError::Provider("volume record missing id".into()))?
      .to_string(),
    capacity_gib: volume.size().unwrap_or(0) as i64,
    availability_zone: volume.availability_zone().unwrap_or_default().to_string(),
    fs_type: String::new(),
  })
}

fn snapshot_from(snapshot: &aws_sdk_ec2::types::Snapshot) -> Snapshot {
  Snapshot {
    snapshot_id: snapshot.snapshot_id().unwrap_or_default().to_string(),
    source_volume_id: snapshot.volume_id().unwrap_or_default().to_string(),
    size_bytes: crate::util::gib_to_bytes(snapshot.volume_size().unwrap_or(0) as i64),
    creation_time: snapshot
      .start_time()
      .map(system_time)
      .unwrap_or(UNIX_EPOCH),
    ready_to_use: snapshot.state() == Some(&SnapshotState::Completed),
  }
}

fn system_time(dt: &DateTime) -> SystemTime {
  if dt.secs() >= 0 {
    UNIX_EPOCH + Duration::new(dt.secs() as u64, dt.subsec_nanos())
  } else {
    UNIX_EPOCH
  }
}

fn translate<E, R>(err: SdkError<E, R>) -> CloudError
where
  E: ProvideErrorMetadata,
{
  match err.code() {
    // InvalidVolume.NotFound, InvalidSnapshot.NotFound,
    // InvalidInstanceID.NotFound, ...
    Some(code) if code.contains("NotFound") => CloudError::NotFound,
    code => CloudError::Provider(format!(
      "{}: {}",
      code.unwrap_or("unknown"),
      err.message().unwrap_or("no message")
    )),
  }
}

fn already_detached<E, R>(err: &SdkError<E, R>) -> bool
where
  E: ProvideErrorMetadata,
{
  matches!(
    err.code(),
    Some("IncorrectState") | Some("InvalidAttachment.NotFound")
  ) || matches!(err.code(), Some(code) if code.contains("NotFound"))
}
