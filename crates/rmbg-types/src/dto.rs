//! Request and response DTOs for the HTTP API and the outbound callback.

use crate::{CallbackSpec, JobRecord, JobStatus, JobTimings};
use serde::{Deserialize, Serialize};

/// Optional structured part of a submission (`request_data` form field).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub callback_auth: Option<String>,
    #[serde(default)]
    pub custom_data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl SubmitRequest {
    /// Callback spec for the descriptor; `None` unless a callback_url was given.
    pub fn callback_spec(&self) -> Option<CallbackSpec> {
        self.callback_url.as_ref().map(|url| CallbackSpec {
            url: url.clone(),
            auth_token: self.callback_auth.clone(),
            custom_data: self.custom_data.clone(),
        })
    }
}

/// Response to a successful submission (HTTP 202).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: JobStatus,
}

/// Response to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_time: Option<f64>,
}

impl From<&JobRecord> for TaskStatusResponse {
    fn from(record: &JobRecord) -> Self {
        let timings = record.timings;
        Self {
            task_id: record.task_id.clone(),
            status: record.status,
            result_url: record.result_url.clone(),
            error: record.error.clone(),
            processing_time: timings.map(|t| t.processing_time),
            model_time: timings.and_then(|t| t.model_time),
            queue_time: timings.map(|t| t.queue_time),
        }
    }
}

/// Overall service health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthComponents {
    pub api: ComponentHealth,
    pub worker: ComponentHealth,
    pub broker: ComponentHealth,
}

impl HealthComponents {
    /// Broker down means nothing can be accepted; a missing worker only delays jobs.
    pub fn overall(&self) -> HealthStatus {
        if self.api != ComponentHealth::Healthy || self.broker != ComponentHealth::Healthy {
            HealthStatus::Unhealthy
        } else if self.worker != ComponentHealth::Healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub components: HealthComponents,
}

/// Error body returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One status notification for the callback client.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackNotice {
    pub task_id: String,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub timings: Option<JobTimings>,
}

impl CallbackNotice {
    pub fn processing(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: JobStatus::Processing,
            result_url: None,
            error: None,
            timings: None,
        }
    }

    /// Terminal notice built from the record just written.
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            status: record.status,
            result_url: record.result_url.clone(),
            error: record.error.clone(),
            timings: record.timings,
        }
    }

    /// JSON body: caller metadata first, then the core fields (which win on collision).
    pub fn to_body(
        &self,
        custom_data: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> serde_json::Value {
        let mut body = custom_data.cloned().unwrap_or_default();
        body.insert("task_id".to_string(), self.task_id.clone().into());
        body.insert("status".to_string(), self.status.as_str().into());
        if let Some(ref url) = self.result_url {
            body.insert("result_url".to_string(), url.clone().into());
        }
        if let Some(ref err) = self.error {
            body.insert("error".to_string(), err.clone().into());
        }
        if let Some(t) = self.timings {
            body.insert("processing_time".to_string(), t.processing_time.into());
            body.insert("queue_time".to_string(), t.queue_time.into());
            if let Some(m) = t.model_time {
                body.insert("model_time".to_string(), m.into());
            }
        }
        serde_json::Value::Object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobDescriptor;
    use serde_json::json;

    #[test]
    fn pending_status_omits_optional_fields() {
        let d = JobDescriptor::new("/tmp/a.png", None, None);
        let res = TaskStatusResponse::from(&JobRecord::pending(&d));
        let v = serde_json::to_value(&res).unwrap();
        assert_eq!(v, json!({ "task_id": d.task_id, "status": "pending" }));
    }

    #[test]
    fn submit_request_rejects_unknown_fields() {
        let err = serde_json::from_str::<SubmitRequest>(r#"{"callback":"x"}"#);
        assert!(err.is_err());
        let ok: SubmitRequest =
            serde_json::from_str(r#"{"callback_url":"https://a.test/cb","custom_data":{"k":1}}"#)
                .unwrap();
        let spec = ok.callback_spec().unwrap();
        assert_eq!(spec.url, "https://a.test/cb");
        assert_eq!(spec.custom_data.unwrap()["k"], 1);
    }

    #[test]
    fn callback_body_core_fields_win() {
        let mut custom = serde_json::Map::new();
        custom.insert("status".to_string(), json!("spoofed"));
        custom.insert("user_id".to_string(), json!("123"));
        let notice = CallbackNotice::processing("t1");
        let body = notice.to_body(Some(&custom));
        assert_eq!(body["status"], "processing");
        assert_eq!(body["user_id"], "123");
        assert_eq!(body["task_id"], "t1");
        assert!(body.get("result_url").is_none());
    }

    #[test]
    fn overall_health_follows_components() {
        let mut c = HealthComponents {
            api: ComponentHealth::Healthy,
            worker: ComponentHealth::Healthy,
            broker: ComponentHealth::Healthy,
        };
        assert_eq!(c.overall(), HealthStatus::Healthy);
        c.worker = ComponentHealth::Unhealthy;
        assert_eq!(c.overall(), HealthStatus::Degraded);
        c.broker = ComponentHealth::Unhealthy;
        assert_eq!(c.overall(), HealthStatus::Unhealthy);
    }
}
