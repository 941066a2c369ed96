//! In-process stand-ins for the external collaborators.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use axum::{routing::get, Router};

use crate::{
    error::{PipelineError, PipelineResult},
    llm::PromptGenerator,
    models::{CreativeUnit, Observation, Stage, Task, TaskKind, TaskResult, TaskStatus},
    now_ms,
    provider::{GenerationProvider, JobRequest},
};

pub fn unit(stage: Stage) -> CreativeUnit {
    let now = now_ms();
    CreativeUnit {
        id: uuid::Uuid::new_v4().to_string(),
        name: Some("test".into()),
        situation: "dad in driveway".into(),
        prompt: Some("a dad squints at his car".into()),
        video_task_id: None,
        video_duration_secs: 15,
        character_name: None,
        character_id: None,
        character_task_id: None,
        next_prompt: None,
        next_task_id: None,
        stage,
        created_at_ms: now,
        updated_at_ms: now,
    }
}

pub fn task(unit_id: &str, provider_task_id: &str, kind: TaskKind) -> Task {
    let now = now_ms();
    Task {
        id: uuid::Uuid::new_v4().to_string(),
        unit_id: unit_id.to_string(),
        provider_task_id: provider_task_id.to_string(),
        kind,
        status: TaskStatus::Waiting,
        progress: 0,
        result_url: None,
        local_path: None,
        character_id: None,
        fail_message: None,
        warning: None,
        stalled: false,
        observed_at_ms: None,
        created_at_ms: now,
        updated_at_ms: now,
    }
}

pub fn success(url: &str) -> Observation {
    Observation {
        status: TaskStatus::Success,
        progress: 100,
        result: Some(TaskResult {
            result_urls: vec![url.to_string()],
            character_id: None,
        }),
        fail_message: None,
    }
}

pub fn generating(progress: i64) -> Observation {
    Observation {
        status: TaskStatus::Generating,
        progress,
        ..Default::default()
    }
}

#[derive(Clone, Debug)]
pub enum Scripted {
    Status(Observation),
    TransportError,
    ProviderError,
}

/// Generation provider that replays a script of status answers, then keeps
/// reporting `generating`.
pub struct FakeProvider {
    script: Mutex<VecDeque<Scripted>>,
    submitted: Mutex<Vec<JobRequest>>,
    status_calls: AtomicUsize,
    reject_submissions: AtomicBool,
}

impl FakeProvider {
    pub fn with_script(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            submitted: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
            reject_submissions: AtomicBool::new(false),
        }
    }

    pub fn pending() -> Self {
        Self::with_script([])
    }

    pub fn push(&self, step: Scripted) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn reject_submissions(&self) {
        self.reject_submissions.store(true, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<JobRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for FakeProvider {
    async fn submit_job(&self, job: &JobRequest) -> PipelineResult<String> {
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(PipelineError::Provider("insufficient credits".into()));
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(job.clone());
        Ok(format!("prov-{}", submitted.len()))
    }

    async fn query_status(&self, _provider_task_id: &str) -> PipelineResult<Observation> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Scripted::Status(obs)) => Ok(obs),
            Some(Scripted::TransportError) => Err(PipelineError::Transport("connection reset".into())),
            Some(Scripted::ProviderError) => Err(PipelineError::Provider("code 500".into())),
            None => Ok(generating(50)),
        }
    }
}

/// Prompt generator returning canned text and recording each request.
pub struct FakeLlm {
    reply: Mutex<PipelineResult<String>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeLlm {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Mutex::new(Ok(text.to_string())),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: Mutex::new(Err(PipelineError::Provider("overloaded".into()))),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply_with(&self, text: &str) {
        *self.reply.lock().unwrap() = Ok(text.to_string());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PromptGenerator for FakeLlm {
    async fn generate(&self, system: &str, user: &str) -> PipelineResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        match &*self.reply.lock().unwrap() {
            Ok(text) => Ok(text.clone()),
            Err(_) => Err(PipelineError::Provider("overloaded".into())),
        }
    }
}

/// Serves `body` at `/x.mp4` on a random local port; every other path is 404.
/// Returns the base url.
pub async fn serve_artifacts(body: &'static [u8]) -> String {
    let app = Router::new().route("/x.mp4", get(move || async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
