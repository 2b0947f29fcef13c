//! Publishing resolved hostnames onto ingress status with optimistic
//! read-modify-write retries.

use std::time::Duration;

use tor_ingress_core::{IngressStore, ServiceKey, StatusWriter};

use crate::error::StatusError;

/// Run `attempt` up to `steps` times, sleeping `delay` between tries, while
/// it fails with a version conflict. Any other failure returns at once.
pub async fn retry_on_conflict<T, F>(
    key: &ServiceKey,
    steps: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<T, StatusError>
where
    F: FnMut() -> Result<T, StatusError>,
{
    for step in 1..=steps {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(StatusError::Store(err)) if err.is_conflict() => {
                tracing::debug!(%key, attempt = step, error = %err, "status update conflict");
                if step < steps {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(StatusError::ConflictExhausted {
        key: key.clone(),
        attempts: steps,
    })
}

/// Write `hostname` into the status of the ingress at `key`, re-reading the
/// latest version on every attempt. Returns `false` when the status already
/// carried exactly this hostname.
pub async fn publish_hostname(
    ingresses: &dyn IngressStore,
    writer: &dyn StatusWriter,
    key: &ServiceKey,
    hostname: &str,
    steps: u32,
    delay: Duration,
) -> Result<bool, StatusError> {
    retry_on_conflict(key, steps, delay, || {
        let Some(mut ingress) = ingresses.get_by_key(key)? else {
            return Err(StatusError::Gone { key: key.clone() });
        };
        if ingress.published_hostnames() == [hostname] {
            return Ok(false);
        }
        ingress.set_hostname(hostname);
        writer.update_status(&ingress)?;
        Ok(true)
    })
    .await
}
