//! Generated bindings for the CSI v1 protocol.
//!
//! The `.proto` source lives in `proto/csi.proto` and is compiled by the
//! build script; downstream crates use the raw generated types directly and
//! translate them into their own domain types at the service boundary.

pub mod v1 {
  #![allow(clippy::large_enum_variant)]

  tonic::include_proto!("csi.v1");
}

pub use v1::volume_capability::access_mode::Mode as AccessMode;

impl v1::VolumeCapability {
  /// The access mode of this capability, or `Mode::Unknown` when absent or
  /// out of range.
  pub fn mode(&self) -> AccessMode {
    self
      .access_mode
      .as_ref()
      .map(|m| m.mode())
      .unwrap_or(AccessMode::Unknown)
  }

  /// The requested filesystem type, if this is a mount capability that
  /// carries one.
  pub fn fs_type(&self) -> Option<&str> {
    match &self.access_type {
      Some(v1::volume_capability::AccessType::Mount(m)) if !m.fs_type.is_empty() => {
        Some(&m.fs_type)
      }
      _ => None,
    }
  }
}
