//! Wire shape of a sync attempt.
//!
//! ```text
//! POST <base_url><tag>
//! idempotency-key: <task id>
//! x-sync-tag:      <tag>
//! x-base-version:  <remote lastModified>   (only after reconciliation)
//!
//! <payload>
//! ```
//!
//! | Status        | Meaning                                               |
//! |---------------|-------------------------------------------------------|
//! | 2xx           | applied                                               |
//! | 409, 412      | conflict, body is `{"lastModified": .., "data": ..}`  |
//! | 400, 422      | payload rejected, dead-letter                         |
//! | anything else | retryable, counts against the circuit breaker         |

use crate::conflict::RemoteSnapshot;
use crate::error::SyncError;
use crate::http::{Request, Response};
use crate::sync_task::SyncTask;

pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const HEADER_SYNC_TAG: &str = "x-sync-tag";
pub const HEADER_BASE_VERSION: &str = "x-base-version";

/// Non-failure outcomes, i.e. the remote answered deliberately.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Answer {
    Applied,
    Conflict(RemoteSnapshot),
    Rejected(String),
}

pub(crate) fn build_request(base_url: &str, task: &SyncTask) -> Request {
    let mut request = Request::post(format!("{}{}", base_url.trim_end_matches('/'), task.tag), task.payload.clone())
        .with_header(HEADER_IDEMPOTENCY_KEY, task.id.clone())
        .with_header(HEADER_SYNC_TAG, task.tag.clone());
    if let Some(version) = task.base_version {
        request = request.with_header(HEADER_BASE_VERSION, version.to_string());
    }
    if task.payload_json().is_some() {
        request = request.with_header("content-type", "application/json");
    }
    request
}

/// Map a response onto an answer, or a retryable error for the breaker.
pub(crate) fn classify(response: &Response) -> Result<Answer, SyncError> {
    match response.status {
        200..=299 => Ok(Answer::Applied),
        409 | 412 => match serde_json::from_slice::<RemoteSnapshot>(&response.body) {
            Ok(snapshot) => Ok(Answer::Conflict(snapshot)),
            Err(e) => Ok(Answer::Rejected(format!(
                "conflict response without a usable remote snapshot: {}",
                e
            ))),
        },
        400 | 422 => {
            let detail = String::from_utf8_lossy(&response.body);
            Ok(Answer::Rejected(format!("remote rejected payload ({}): {}", response.status, detail.trim())))
        }
        status => Err(SyncError::Network(format!("remote responded {}", status))),
    }
}
