use crate::cluster::Inner;
use crate::error::SwimError;
use crate::membership::Snapshot;
use crate::swim::{request, JoinRequest, JoinResponse};
use crate::transport::Endpoint;
use itertools::Itertools;
use metrics::{counter, histogram};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Sends join requests to `hosts` one at a time, in random order, until
/// `join_size` of them have answered. Rounds that fall short are retried
/// after a jittered exponential backoff. Returns each joined host with the
/// membership snapshot it sent back.
///
/// Fails with [`SwimError::JoinDurationExceeded`] once `max_join_duration`
/// has passed and with [`SwimError::JoinAborted`] if the node is destroyed
/// meanwhile.
pub(crate) async fn join_cluster(
  inner: &Inner,
  hosts: &[String],
) -> Result<Vec<(String, Snapshot)>, SwimError> {
  let config = inner.config();
  let mut candidates = hosts
    .iter()
    .filter(|h| **h != inner.address)
    .cloned()
    .unique()
    .collect::<Vec<_>>();
  if candidates.is_empty() {
    info!(address = %inner.address, "no peers to join, starting alone");
    return Ok(Vec::new());
  }
  let join_size = config.join_size.min(candidates.len());
  let body = JoinRequest {
    app: config.app.clone(),
    source: inner.address.clone(),
    incarnation_number: inner.state.lock().membership.local_incarnation(),
  };
  let started = Instant::now();
  let mut shutdown = inner.shutdown_signal();
  let mut joined: Vec<(String, Snapshot)> = Vec::new();
  let mut delay = config.join_delay;
  let mut round = 0u32;
  loop {
    round += 1;
    candidates.retain(|c| !joined.iter().any(|(host, _)| host == c));
    candidates.shuffle(&mut thread_rng());
    for host in candidates.iter() {
      if inner.is_destroyed() {
        return Err(SwimError::JoinAborted);
      }
      counter!("swimring_join_attempt").increment(1);
      let res: Result<JoinResponse, _> = request(
        &*inner.channel,
        host,
        Endpoint::Join,
        &body,
        config.join_timeout,
      )
      .await;
      if inner.is_destroyed() {
        return Err(SwimError::JoinAborted);
      }
      if started.elapsed() > config.max_join_duration {
        warn!(
          joined = joined.len(),
          join_size = join_size,
          "join duration exceeded"
        );
        counter!("swimring_join_duration_exceeded").increment(1);
        return Err(SwimError::JoinDurationExceeded(config.max_join_duration));
      }
      match res {
        Ok(res) if res.app != config.app => {
          warn!(host = %host, app = %res.app, "join answered by another app");
        }
        Ok(res) => {
          debug!(
            host = %host,
            members = res.membership.len(),
            "joined"
          );
          joined.push((host.clone(), Snapshot::from(res)));
          if joined.len() >= join_size {
            let elapsed = started.elapsed();
            info!(
              joined = joined.len(),
              rounds = round,
              elapsed = ?elapsed,
              "join complete"
            );
            counter!("swimring_join_complete").increment(1);
            histogram!("swimring_join_ms")
              .record(elapsed.as_secs_f64() * 1000.0);
            return Ok(joined);
          }
        }
        Err(err) => {
          warn!(host = %host, error = %err, "join failed");
          counter!("swimring_join_failed").increment(1);
        }
      }
    }
    let backoff = delay.mul_f64(thread_rng().gen_range(0.5..=1.0));
    debug!(
      round = round,
      joined = joined.len(),
      backoff = ?backoff,
      "join round incomplete"
    );
    tokio::select! {
      _ = tokio::time::sleep(backoff) => {}
      _ = shutdown.changed() => return Err(SwimError::JoinAborted),
    }
    if started.elapsed() > config.max_join_duration {
      warn!(joined = joined.len(), "join duration exceeded");
      counter!("swimring_join_duration_exceeded").increment(1);
      return Err(SwimError::JoinDurationExceeded(config.max_join_duration));
    }
    delay = (delay * 2).min(config.max_join_delay);
  }
}
