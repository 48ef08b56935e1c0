//! Completed-transfer record persistence via the external REST collaborator.
//!
//! One POST per completed inbound transfer, fire-and-forget: a failure is
//! logged and never rolls back or retries the transfer itself.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// The record shape the collaborator's `/api/transfers` endpoint accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "fileSize")]
    pub file_size: u64,
    #[serde(rename = "fileType")]
    pub file_type: String,
    pub sender_id: String,
    pub receiver_id: String,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin client around the collaborator's transfer-history endpoint.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn endpoint_url(&self) -> String {
        format!("{}/api/transfers", self.base_url.trim_end_matches('/'))
    }

    /// Persist one record on a detached task. The transfer outcome shown to
    /// the user is already final when this is called; only the persistence
    /// call can fail, and that failure stays local.
    pub fn persist(&self, record: TransferRecord) {
        let client = self.client.clone();
        let url = self.endpoint_url();
        let token = self.token.clone();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .bearer_auth(&token)
                .timeout(REQUEST_TIMEOUT)
                .json(&record)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => debug!(
                    event = "transfer_record_persisted",
                    file = %record.file_name,
                    "Transfer record stored"
                ),
                Err(e) => warn!(
                    event = "transfer_record_persist_failure",
                    file = %record.file_name,
                    error = %e,
                    "Failed to persist transfer record; transfer outcome unaffected"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_collaborator_field_names() {
        let record = TransferRecord {
            file_name: "report.pdf".into(),
            file_size: 32768,
            file_type: "application/pdf".into(),
            sender_id: "1".into(),
            receiver_id: "2".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["fileName"], "report.pdf");
        assert_eq!(json["fileSize"], 32768);
        assert_eq!(json["sender_id"], "1");
        assert_eq!(json["receiver_id"], "2");
    }

    #[test]
    fn endpoint_url_tolerates_trailing_slash() {
        let with = HistoryClient::new("http://127.0.0.1:8000/", "t");
        let without = HistoryClient::new("http://127.0.0.1:8000", "t");
        assert_eq!(with.endpoint_url(), "http://127.0.0.1:8000/api/transfers");
        assert_eq!(with.endpoint_url(), without.endpoint_url());
    }
}
