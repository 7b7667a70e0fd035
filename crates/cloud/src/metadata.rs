use crate::CloudError;
use std::time::Duration;
use tracing::info;

/// Well-known link-local address of the instance metadata service.
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// The instance's own identity, read once at startup and immutable for the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct Metadata {
  instance_id: String,
  availability_zone: String,
  region: String,
}

impl Metadata {
  /// Reads instance identity from the metadata endpoint. The base URL is a
  /// parameter so tests can point it at a local server.
  pub async fn probe(base: &str) -> Result<Self, CloudError> {
    let client = reqwest::Client::builder()
      .timeout(METADATA_TIMEOUT)
      .build()
      .map_err(|e| CloudError::Provider(format!("could not build metadata client: {e}")))?;

    let instance_id = fetch(&client, base, "instance-id").await?;
    if instance_id.is_empty() {
      return Err(CloudError::Provider(
        "metadata endpoint returned empty instance id".into(),
      ));
    }

    let availability_zone = fetch(&client, base, "placement/availability-zone").await?;
    let region = region_from_zone(&availability_zone)?;

    info!(%instance_id, %availability_zone, %region, "probed metadata");
    Ok(Metadata {
      instance_id,
      availability_zone,
      region,
    })
  }

  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  pub fn availability_zone(&self) -> &str {
    &self.availability_zone
  }

  pub fn region(&self) -> &str {
    &self.region
  }

  /// Assembles metadata without touching the network; used by tests and by
  /// deployments that inject identity out of band.
  pub fn from_values(
    instance_id: impl Into<String>,
    availability_zone: impl Into<String>,
  ) -> Result<Self, CloudError> {
    let availability_zone = availability_zone.into();
    let region = region_from_zone(&availability_zone)?;
    Ok(Metadata {
      instance_id: instance_id.into(),
      availability_zone,
      region,
    })
  }
}

async fn fetch(client: &reqwest::Client, base: &str, path: &str) -> Result<String, CloudError> {
  let url = format!("{}/latest/meta-data/{}", base.trim_end_matches('/'), path);
  let response = client
    .get(&url)
    .send()
    .await
    .and_then(reqwest::Response::error_for_status)
    .map_err(|e| CloudError::Provider(format!("metadata request {url} failed: {e}")))?;

  response
    .text()
    .await
    .map(|body| body.trim().to_string())
    .map_err(|e| CloudError::Provider(format!("metadata request {url} failed: {e}")))
}

/// An availability zone is its region plus one trailing zone letter.
fn region_from_zone(zone: &str) -> Result<String, CloudError> {
  let trimmed = zone.trim_end_matches(|c: char| c.is_ascii_alphabetic());
  // us-west-2b -> "us-west-2"; reject anything that does not leave a
  // plausible region behind.
  if trimmed.len() < 2 || trimmed.len() == zone.len() {
    return Err(CloudError::Provider(format!(
      "invalid availability zone {zone:?}"
    )));
  }

  Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  #[test_case("us-west-2b", "us-west-2")]
  #[test_case("eu-central-1a", "eu-central-1")]
  #[test_case("ap-southeast-2c", "ap-southeast-2")]
  fn region_is_zone_minus_letter(zone: &str, region: &str) {
    assert_eq!(region_from_zone(zone).unwrap(), region);
  }

  #[test_case(""; "empty")]
  #[test_case("b"; "letter only")]
  #[test_case("us-west-2"; "no zone letter")]
  fn bad_zones_are_rejected(zone: &str) {
    assert!(region_from_zone(zone).is_err());
  }

  #[test]
  fn from_values_derives_region() {
    let md = Metadata::from_values("i-1234567890abcdef0", "us-east-1a").unwrap();
    assert_eq!(md.instance_id(), "i-1234567890abcdef0");
    assert_eq!(md.availability_zone(), "us-east-1a");
    assert_eq!(md.region(), "us-east-1");
  }
}
