use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{
    coordinator::{CharacterRequest, Coordinator, SituationOutcome, StageView, UnitDetail, VideoOptions},
    error::{AppError, AppResult},
    materializer::VIDEOS_ROUTE,
    models::{CreativeUnit, Stage, TaskView, UnitEvent},
};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub provider_configured: bool,
    pub llm_configured: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    data_dir: String,
    db_path: String,
    provider_configured: bool,
    llm_configured: bool,
    active_polls: usize,
}

#[derive(Deserialize)]
struct CreateUnitRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    situation: String,
}

#[derive(Deserialize)]
struct RegeneratePromptRequest {
    #[serde(default)]
    situation: Option<String>,
}

#[derive(Deserialize)]
struct VideoRequest {
    #[serde(default)]
    prompt: String,
    #[serde(flatten)]
    options: VideoOptions,
}

#[derive(Deserialize)]
struct NextVideoRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(flatten)]
    options: VideoOptions,
}

#[derive(Serialize)]
struct PromptResponse {
    prompt: String,
}

#[derive(Serialize)]
struct TaskCreated {
    task_id: String,
}

/// Builds the HTTP surface. Materialized videos are served from `videos_dir`.
pub fn router(state: AppState, videos_dir: PathBuf) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/units", post(create_unit).get(list_units))
        .route("/units/{id}", get(get_unit).delete(delete_unit))
        .route("/units/{id}/events", get(list_events))
        .route("/units/{id}/stages/{stage}", get(get_stage))
        .route("/units/{id}/prompt", post(regenerate_prompt))
        .route("/units/{id}/video", post(submit_video))
        .route("/units/{id}/character", post(create_character))
        .route("/units/{id}/continue", post(continue_with_character))
        .route("/units/{id}/next-video", post(submit_next_video))
        .route("/tasks/{id}", get(get_task))
        .nest_service(VIDEOS_ROUTE, ServeDir::new(videos_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: "adreel-pipeline",
        data_dir: state.data_dir.display().to_string(),
        db_path: state.db_path.display().to_string(),
        provider_configured: state.provider_configured,
        llm_configured: state.llm_configured,
        active_polls: state.coordinator.poller().active_count(),
    })
}

async fn create_unit(
    State(state): State<AppState>,
    Json(req): Json<CreateUnitRequest>,
) -> AppResult<Json<SituationOutcome>> {
    let outcome = state.coordinator.submit_situation(req.name, &req.situation).await?;
    Ok(Json(outcome))
}

async fn list_units(State(state): State<AppState>) -> AppResult<Json<Vec<CreativeUnit>>> {
    Ok(Json(state.coordinator.list_units().await?))
}

async fn get_unit(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<UnitDetail>> {
    Ok(Json(state.coordinator.get_unit(&id).await?))
}

async fn delete_unit(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    state.coordinator.delete_unit(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn list_events(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<Vec<UnitEvent>>> {
    Ok(Json(state.coordinator.list_events(&id).await?))
}

async fn get_stage(
    State(state): State<AppState>,
    Path((id, stage)): Path<(String, String)>,
) -> AppResult<Json<StageView>> {
    let stage: Stage = stage
        .parse()
        .map_err(|err: anyhow::Error| AppError::BadRequest(err.to_string()))?;
    Ok(Json(state.coordinator.stage_view(&id, stage).await?))
}

async fn regenerate_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RegeneratePromptRequest>,
) -> AppResult<Json<PromptResponse>> {
    let prompt = state.coordinator.regenerate_prompt(&id, req.situation).await?;
    Ok(Json(PromptResponse { prompt }))
}

async fn submit_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<VideoRequest>,
) -> AppResult<Json<TaskCreated>> {
    let task_id = state.coordinator.submit_prompt(&id, &req.prompt, req.options).await?;
    Ok(Json(TaskCreated { task_id }))
}

async fn create_character(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CharacterRequest>,
) -> AppResult<Json<TaskCreated>> {
    let task_id = state.coordinator.create_character(&id, req).await?;
    Ok(Json(TaskCreated { task_id }))
}

async fn continue_with_character(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PromptResponse>> {
    let prompt = state.coordinator.continue_with_character(&id).await?;
    Ok(Json(PromptResponse { prompt }))
}

async fn submit_next_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<NextVideoRequest>,
) -> AppResult<Json<TaskCreated>> {
    let task_id = state.coordinator.submit_next_clip(&id, req.prompt, req.options).await?;
    Ok(Json(TaskCreated { task_id }))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<TaskView>> {
    Ok(Json(state.coordinator.poll_status(&id).await?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::{
        config::PollConfig,
        materializer::Materializer,
        poller::Poller,
        store::Store,
        testing::{FakeLlm, FakeProvider},
    };

    async fn spawn_app(dir: &tempfile::TempDir) -> String {
        let store = Store::init(dir.path().join("db.sqlite3")).unwrap();
        let provider = Arc::new(FakeProvider::pending());
        let videos_dir = dir.path().join("videos");
        std::fs::create_dir_all(&videos_dir).unwrap();
        std::fs::write(videos_dir.join("clip.mp4"), b"local bytes").unwrap();

        let poller = Poller::new(
            store.clone(),
            provider.clone(),
            Materializer::new(store.clone(), &videos_dir),
            PollConfig {
                initial_delay: Duration::from_secs(60),
                ..PollConfig::default()
            },
        );
        let coordinator = Coordinator::new(
            store.clone(),
            provider,
            Arc::new(FakeLlm::replying("a generated prompt")),
            poller,
            15,
        );
        let state = AppState {
            coordinator: Arc::new(coordinator),
            data_dir: dir.path().to_path_buf(),
            db_path: store.db_path().to_path_buf(),
            provider_configured: false,
            llm_configured: true,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state, videos_dir);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_reports_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_app(&dir).await;

        let body: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["service"], "adreel-pipeline");
        assert_eq!(body["provider_configured"], false);
        assert_eq!(body["active_polls"], 0);
    }

    #[tokio::test]
    async fn unit_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_app(&dir).await;
        let client = reqwest::Client::new();

        let created: Value = client
            .post(format!("{base}/units"))
            .json(&json!({ "situation": "dad in driveway" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["prompt"], "a generated prompt");
        let unit_id = created["unit_id"].as_str().unwrap().to_string();

        let res = client
            .post(format!("{base}/units/{unit_id}/video"))
            .json(&json!({ "prompt": "a generated prompt", "aspect_ratio": "landscape" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        let task_id = res.json::<Value>().await.unwrap()["task_id"].as_str().unwrap().to_string();

        let task: Value = client
            .get(format!("{base}/tasks/{task_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(task["status"], "waiting");
        assert_eq!(task["kind"], "video");

        let res = client
            .post(format!("{base}/units/{unit_id}/video"))
            .json(&json!({ "prompt": "again" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 409);

        let stage: Value = client
            .get(format!("{base}/units/{unit_id}/stages/situation"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stage["text"], "dad in driveway");
        assert_eq!(stage["current_stage"], "video");

        let res = client.delete(format!("{base}/units/{unit_id}")).send().await.unwrap();
        assert_eq!(res.status(), 200);
        let res = client.get(format!("{base}/units/{unit_id}")).send().await.unwrap();
        assert_eq!(res.status(), 404);
    }

    #[tokio::test]
    async fn errors_use_the_shared_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_app(&dir).await;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("{base}/units/nope/character"))
            .json(&json!({ "description": "dad", "timestamps": "1,6" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 400);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("window"));

        let res = client.get(format!("{base}/units/nope/stages/ending")).send().await.unwrap();
        assert_eq!(res.status(), 400);

        let res = client.get(format!("{base}/tasks/nope")).send().await.unwrap();
        assert_eq!(res.status(), 404);
    }

    #[tokio::test]
    async fn serves_materialized_videos() {
        let dir = tempfile::tempdir().unwrap();
        let base = spawn_app(&dir).await;

        let res = reqwest::get(format!("{base}/videos/clip.mp4")).await.unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.bytes().await.unwrap().as_ref(), b"local bytes");
    }
}
