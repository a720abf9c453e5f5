//! Request outcome record kept by the stats recorder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::CapturedRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured request (body excluded).
    pub request: CapturedRequest,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Record {
    /// Start a record now; `finish` stamps the end time.
    pub fn begin(uid: impl Into<String>, request: CapturedRequest) -> Record {
        Record {
            uid: uid.into(),
            error: None,
            request,
            begin: Utc::now(),
            end: Utc::now(),
        }
    }

    pub fn finish(mut self, error: Option<String>) -> Record {
        self.end = Utc::now();
        self.error = error;
        self
    }
}
