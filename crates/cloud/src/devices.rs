use crate::CloudError;
use std::collections::HashSet;

/// Picks the next device name for an attachment.
///
/// EC2 recommends `/dev/xvdba` through `/dev/xvdcz` for EBS attachments;
/// walking the alphabet from the start maximises reuse of kernel block
/// slots freed by earlier detaches. A name counts as taken when the
/// instance reports it in any of its aliased spellings (`/dev/xvd*`,
/// `/dev/sd*`, with or without the `/dev/` prefix).
pub(crate) fn next_device_name(in_use: &HashSet<String>) -> Result<String, CloudError> {
  for first in ['b', 'c'] {
    for second in 'a'..='z' {
      let suffix = format!("{first}{second}");
      let taken = [
        format!("/dev/xvd{suffix}"),
        format!("/dev/sd{suffix}"),
        format!("xvd{suffix}"),
        format!("sd{suffix}"),
      ]
      .iter()
      .any(|alias| in_use.contains(alias));

      if !taken {
        return Ok(format!("/dev/xvd{suffix}"));
      }
    }
  }

  Err(CloudError::Provider(
    "no available device names left on instance".into(),
  ))
}
