use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::ProviderConfig,
    error::{PipelineError, PipelineResult},
    models::{AspectRatio, Observation, TaskKind, TaskResult, TaskStatus},
};

/// Parameters for one provider job.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobRequest {
    Video {
        prompt: String,
        aspect_ratio: AspectRatio,
        /// Clip length in seconds, sent as a string ("10" or "15").
        n_frames: String,
        remove_watermark: bool,
        upload_method: &'static str,
    },
    Character {
        origin_task_id: String,
        timestamps: String,
        character_prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        character_user_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        safety_instruction: Option<String>,
    },
}

impl JobRequest {
    pub fn video(prompt: impl Into<String>, aspect_ratio: AspectRatio, seconds: u32) -> Self {
        Self::Video {
            prompt: prompt.into(),
            aspect_ratio,
            n_frames: seconds.to_string(),
            remove_watermark: true,
            upload_method: "s3",
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Video { .. } => TaskKind::Video,
            Self::Character { .. } => TaskKind::Character,
        }
    }
}

/// External video-generation service. Implementations make exactly one
/// network call per method and never retry.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submits a job and returns the provider's task id.
    async fn submit_job(&self, job: &JobRequest) -> PipelineResult<String>;

    async fn query_status(&self, provider_task_id: &str) -> PipelineResult<Observation>;
}

#[derive(Clone)]
pub struct KieClient {
    config: ProviderConfig,
    http_client: reqwest::Client,
}

#[derive(Serialize)]
struct CreateTaskRequest<'a> {
    model: &'a str,
    input: &'a JobRequest,
}

#[derive(Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default, alias = "msg")]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedTask {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordInfo {
    state: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    result_json: Option<String>,
    #[serde(default)]
    fail_msg: Option<String>,
}

impl KieClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn model_for(&self, kind: TaskKind) -> &str {
        match kind {
            TaskKind::Video => &self.config.video_model,
            TaskKind::Character => &self.config.character_model,
        }
    }

    async fn read_envelope<T>(response: reqwest::Response) -> PipelineResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Provider(format!("http {status}: {error_text}")));
        }

        let envelope: Envelope<T> = response.json().await?;
        if envelope.code != 200 {
            return Err(PipelineError::Provider(
                envelope
                    .message
                    .unwrap_or_else(|| format!("provider returned code {}", envelope.code)),
            ));
        }
        envelope
            .data
            .ok_or_else(|| PipelineError::Provider("provider response has no data".to_string()))
    }
}

#[async_trait]
impl GenerationProvider for KieClient {
    async fn submit_job(&self, job: &JobRequest) -> PipelineResult<String> {
        let model = self.model_for(job.kind());
        let response = self
            .http_client
            .post(self.url("/api/v1/jobs/createTask"))
            .bearer_auth(&self.config.api_key)
            .json(&CreateTaskRequest { model, input: job })
            .timeout(Duration::from_secs(60))
            .send()
            .await?;

        let created: CreatedTask = Self::read_envelope(response).await?;
        info!(model, task_id = %created.task_id, "provider job created");
        Ok(created.task_id)
    }

    async fn query_status(&self, provider_task_id: &str) -> PipelineResult<Observation> {
        let response = self
            .http_client
            .get(self.url("/api/v1/jobs/recordInfo"))
            .query(&[("taskId", provider_task_id)])
            .bearer_auth(&self.config.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        let info: RecordInfo = Self::read_envelope(response).await?;
        observation_from(info)
    }
}

fn observation_from(info: RecordInfo) -> PipelineResult<Observation> {
    let status: TaskStatus = info
        .state
        .parse()
        .map_err(|e: anyhow::Error| PipelineError::Provider(e.to_string()))?;

    // resultJson is itself a JSON document encoded as a string.
    let result = match info.result_json.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(
            serde_json::from_str::<TaskResult>(raw)
                .map_err(|e| PipelineError::Provider(format!("malformed resultJson: {e}")))?,
        ),
        _ => None,
    };

    Ok(Observation {
        status,
        progress: info.progress.unwrap_or_default().round() as i64,
        result,
        fail_message: info.fail_msg.filter(|m| !m.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: serde_json::Value) -> RecordInfo {
        let envelope: Envelope<RecordInfo> = serde_json::from_value(json).unwrap();
        envelope.data.unwrap()
    }

    #[test]
    fn parses_successful_record_with_nested_result_json() {
        let info = record(serde_json::json!({
            "code": 200,
            "message": "success",
            "data": {
                "taskId": "abc",
                "state": "success",
                "progress": 100,
                "resultJson": "{\"resultUrls\":[\"https://cdn/x.mp4\"]}",
                "failMsg": ""
            }
        }));

        let obs = observation_from(info).unwrap();
        assert_eq!(obs.status, TaskStatus::Success);
        assert_eq!(obs.progress, 100);
        assert_eq!(obs.result_url(), Some("https://cdn/x.mp4"));
        assert_eq!(obs.fail_message, None);
    }

    #[test]
    fn parses_character_result_and_in_progress_states() {
        let info = record(serde_json::json!({
            "code": 200,
            "msg": "ok",
            "data": { "state": "success", "resultJson": "{\"character_id\":\"char_9\"}" }
        }));
        assert_eq!(observation_from(info).unwrap().character_id(), Some("char_9"));

        let info = record(serde_json::json!({
            "code": 200,
            "data": { "state": "generating", "progress": 42.6, "resultJson": "" }
        }));
        let obs = observation_from(info).unwrap();
        assert_eq!(obs.status, TaskStatus::Generating);
        assert_eq!(obs.progress, 43);
        assert!(obs.result.is_none());
    }

    #[test]
    fn unknown_state_is_a_provider_error() {
        let info = record(serde_json::json!({ "code": 200, "data": { "state": "exploded" } }));
        assert!(matches!(observation_from(info), Err(PipelineError::Provider(_))));
    }

    #[test]
    fn job_requests_serialize_to_provider_input() {
        let video = JobRequest::video("a dad in a driveway", AspectRatio::Portrait, 15);
        assert_eq!(video.kind(), TaskKind::Video);
        assert_eq!(
            serde_json::to_value(&video).unwrap(),
            serde_json::json!({
                "prompt": "a dad in a driveway",
                "aspect_ratio": "portrait",
                "n_frames": "15",
                "remove_watermark": true,
                "upload_method": "s3"
            })
        );

        let character = JobRequest::Character {
            origin_task_id: "p-1".into(),
            timestamps: "1,4".into(),
            character_prompt: "tired dad".into(),
            character_user_name: None,
            safety_instruction: None,
        };
        assert_eq!(character.kind(), TaskKind::Character);
        assert_eq!(
            serde_json::to_value(&character).unwrap(),
            serde_json::json!({
                "origin_task_id": "p-1",
                "timestamps": "1,4",
                "character_prompt": "tired dad"
            })
        );
    }
}
