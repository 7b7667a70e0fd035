use thiserror::Error;

/// Outcomes the service layer distinguishes, as tagged variants rather
/// than string matching; anything the services do not recognise maps to
/// `Internal` at the RPC boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CloudError {
  #[error("Resource was not found")]
  NotFound,

  #[error("Resource already exists")]
  AlreadyExists,

  #[error("Multiple disks with same name")]
  MultiDisks,

  #[error("There is already a disk with same name and different size")]
  DiskExistsDiffSize,

  #[error("Timed out waiting for {resource} to reach state {state}")]
  WaitTimeout { resource: String, state: String },

  #[error("provider error: {0}")]
  Provider(String),
}

impl CloudError {
  pub(crate) fn wait_timeout(resource: impl Into<String>, state: impl Into<String>) -> Self {
    CloudError::WaitTimeout {
      resource: resource.into(),
      state: state.into(),
    }
  }
}
