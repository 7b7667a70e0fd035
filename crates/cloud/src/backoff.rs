use crate::CloudError;
use std::{future::Future, time::Duration};
use tracing::trace;

/// Exponential backoff schedule for provider state polling.
///
/// The defaults bound a wait at roughly 2600 seconds, which covers the
/// slowest EC2 volume transitions observed in practice.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
  /// Sleep before the second poll; each subsequent sleep is multiplied by
  /// `factor`.
  pub duration: Duration,
  pub factor: f64,
  /// Number of times the predicate is evaluated before giving up.
  pub steps: u32,
}

impl Default for Backoff {
  fn default() -> Self {
    Backoff {
      duration: Duration::from_secs(1),
      factor: 1.8,
      steps: 13,
    }
  }
}

/// Polls `condition` under the backoff schedule until it reports true.
///
/// Returns `Ok(false)` when the schedule is exhausted without the
/// condition holding; the caller owns the timeout classification. Errors
/// from the condition abort the wait immediately. Cancellation is observed
/// at every sleep and at every condition await.
pub async fn poll_until<F, Fut>(backoff: Backoff, mut condition: F) -> Result<bool, CloudError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<bool, CloudError>>,
{
  let mut delay = backoff.duration;
  for step in 0..backoff.steps {
    if condition().await? {
      return Ok(true);
    }

    if step + 1 < backoff.steps {
      trace!(?delay, step, "state not reached yet, backing off");
      tokio::time::sleep(delay).await;
      delay = delay.mul_f64(backoff.factor);
    }
  }

  Ok(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
  };

  #[tokio::test(start_paused = true)]
  fn evaluates_exactly_steps_times_before_giving_up() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();

    let reached = poll_until(Backoff::default(), move || {
      let seen = seen.clone();
      async move {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(false)
      }
    })
    .await
    .unwrap();

    assert!(!reached);
    assert_eq!(calls.load(Ordering::SeqCst), 13);
  }

  #[tokio::test(start_paused = true)]
  fn stops_as_soon_as_the_condition_holds() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();

    let reached = poll_until(Backoff::default(), move || {
      let seen = seen.clone();
      async move { Ok(seen.fetch_add(1, Ordering::SeqCst) == 2) }
    })
    .await
    .unwrap();

    assert!(reached);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  fn errors_abort_the_wait() {
    let result = poll_until(Backoff::default(), || async {
      Err(CloudError::Provider("boom".into()))
    })
    .await;

    assert_eq!(result, Err(CloudError::Provider("boom".into())));
  }

  #[test]
  fn default_schedule_is_bounded() {
    let backoff = Backoff::default();
    let mut total = Duration::ZERO;
    let mut delay = backoff.duration;
    for _ in 1..backoff.steps {
      total += delay;
      delay = delay.mul_f64(backoff.factor);
    }

    // 1s * (1.8^12 - 1) / 0.8, a little over 43 minutes.
    assert!(total > Duration::from_secs(2000) && total < Duration::from_secs(3000));
  }
}
