//! Stage sequencing for creative units.
//!
//! The coordinator owns every precondition of the five-step pipeline
//! (situation → prompt → video → character → next). It validates inputs
//! before touching a collaborator, submits provider jobs, records tasks,
//! hands them to the [`Poller`] and moves the stage marker forward. It never
//! waits for a provider job to finish; completion is observed by the poller.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{PipelineError, PipelineResult},
    llm::{continuation_request, PromptGenerator, VIDEO_PROMPT_SYSTEM},
    models::{
        AspectRatio, CreativeUnit, Stage, Task, TaskStatus, TaskView, TimestampWindow, UnitEvent,
        CLIP_LENGTHS,
    },
    now_ms,
    poller::Poller,
    provider::{GenerationProvider, JobRequest},
    store::Store,
};

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct VideoOptions {
    #[serde(default)]
    pub aspect_ratio: Option<AspectRatio>,
    #[serde(default)]
    pub duration_secs: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CharacterRequest {
    pub description: String,
    pub timestamps: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub safety_instruction: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SituationOutcome {
    pub unit_id: String,
    pub prompt: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnitDetail {
    #[serde(flatten)]
    pub unit: CreativeUnit,
    pub tasks: Vec<TaskView>,
}

/// Read-only view of one step, used when navigating back through a unit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageView {
    pub stage: Stage,
    pub current_stage: Stage,
    pub text: Option<String>,
    pub task: Option<TaskView>,
}

pub struct Coordinator {
    store: Store,
    provider: Arc<dyn GenerationProvider>,
    llm: Arc<dyn PromptGenerator>,
    poller: Poller,
    default_video_seconds: u32,
    claims: Mutex<HashSet<(String, Stage)>>,
    /// Units whose deletion is in progress; no poller may start for them.
    deleting: Mutex<HashSet<String>>,
}

/// Exclusive right to submit for one (unit, stage) slot; released on drop.
struct SlotClaim<'a> {
    claims: &'a Mutex<HashSet<(String, Stage)>>,
    key: (String, Stage),
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Marks a unit as being deleted until dropped.
struct Tombstone<'a> {
    deleting: &'a Mutex<HashSet<String>>,
    unit_id: String,
}

impl Drop for Tombstone<'_> {
    fn drop(&mut self) {
        self.deleting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.unit_id);
    }
}

impl Coordinator {
    pub fn new(
        store: Store,
        provider: Arc<dyn GenerationProvider>,
        llm: Arc<dyn PromptGenerator>,
        poller: Poller,
        default_video_seconds: u32,
    ) -> Self {
        Self {
            store,
            provider,
            llm,
            poller,
            default_video_seconds,
            claims: Mutex::new(HashSet::new()),
            deleting: Mutex::new(HashSet::new()),
        }
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    /// situation → prompt. The unit is only created once the prompt exists.
    pub async fn submit_situation(
        &self,
        name: Option<String>,
        situation: &str,
    ) -> PipelineResult<SituationOutcome> {
        let situation = non_empty(situation, "situation")?;
        let prompt = self.llm.generate(VIDEO_PROMPT_SYSTEM, &situation).await?;

        let now = now_ms();
        let unit = CreativeUnit {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.and_then(|n| non_empty(&n, "name").ok()),
            situation,
            prompt: Some(prompt.clone()),
            video_task_id: None,
            video_duration_secs: self.default_video_seconds,
            character_name: None,
            character_id: None,
            character_task_id: None,
            next_prompt: None,
            next_task_id: None,
            stage: Stage::Prompt,
            created_at_ms: now,
            updated_at_ms: now,
        };
        let unit_id = unit.id.clone();
        self.store.insert_unit(unit).await?;
        self.event(&unit_id, "prompt_generated", serde_json::json!({ "chars": prompt.len() }))
            .await;
        info!(unit_id = %unit_id, "creative unit created");

        Ok(SituationOutcome { unit_id, prompt })
    }

    /// Re-runs situation → prompt for an existing unit, optionally with an
    /// edited situation.
    pub async fn regenerate_prompt(&self, unit_id: &str, situation: Option<String>) -> PipelineResult<String> {
        let unit = self.load_unit(unit_id).await?;
        let situation = match situation {
            Some(s) => non_empty(&s, "situation")?,
            None => unit.situation.clone(),
        };
        let prompt = self.llm.generate(VIDEO_PROMPT_SYSTEM, &situation).await?;

        let stored = prompt.clone();
        self.update_unit(unit_id, move |u| {
            u.situation = situation;
            u.prompt = Some(stored);
            u.advance_to(Stage::Prompt);
        })
        .await?;
        self.event(unit_id, "prompt_generated", serde_json::json!({ "chars": prompt.len() }))
            .await;
        Ok(prompt)
    }

    /// prompt → video. Returns the new task id; completion is observed by the poller.
    pub async fn submit_prompt(&self, unit_id: &str, prompt: &str, options: VideoOptions) -> PipelineResult<String> {
        let prompt = non_empty(prompt, "prompt")?;
        let seconds = self.clip_seconds(options)?;
        let unit = self.load_unit(unit_id).await?;
        if unit.stage < Stage::Prompt {
            return Err(PipelineError::validation("generate a prompt before submitting a video"));
        }
        if unit.stage > Stage::Video {
            return Err(PipelineError::validation(
                "the first clip is locked once a character has been cut from it",
            ));
        }
        self.submit_video(&unit, Stage::Video, prompt, options.aspect_ratio.unwrap_or_default(), seconds)
            .await
    }

    /// Idempotent status read. Re-attaches a poller when a non-terminal task
    /// has none (after a restart or a stall); never calls the provider itself.
    pub async fn poll_status(&self, task_id: &str) -> PipelineResult<TaskView> {
        let task = self.load_task(task_id).await?;
        if !task.status.is_terminal() && !self.poller.is_active(&task.id) {
            // Checked and started under the lock so a concurrent delete either
            // sees the new loop or keeps it from starting.
            let deleting = self.deleting.lock().unwrap_or_else(|e| e.into_inner());
            if !deleting.contains(&task.unit_id) {
                self.poller.start(&task);
            }
        }
        Ok(TaskView::from(&task))
    }

    /// video → character.
    pub async fn create_character(&self, unit_id: &str, req: CharacterRequest) -> PipelineResult<String> {
        let window = TimestampWindow::parse(&req.timestamps)?;
        let description = non_empty(&req.description, "character description")?;

        let unit = self.load_unit(unit_id).await?;
        let video = self.finished_task(&unit, Stage::Video).await?;
        window.fits_within(unit.video_duration_secs)?;

        let _claim = self.claim(&unit.id, Stage::Character)?;
        self.ensure_slot_free(&unit, Stage::Character).await?;

        let username = req.username.and_then(|u| non_empty(&u, "username").ok());
        let job = JobRequest::Character {
            origin_task_id: video.provider_task_id.clone(),
            timestamps: window.to_param(),
            character_prompt: description,
            character_user_name: username.clone(),
            safety_instruction: req.safety_instruction.and_then(|s| non_empty(&s, "safety instruction").ok()),
        };
        let task = self.submit(&unit.id, &job).await?;

        let task_id = task.id.clone();
        self.update_unit(&unit.id, move |u| {
            u.character_name = username;
            u.character_id = None;
            u.character_task_id = Some(task_id);
            u.advance_to(Stage::Character);
        })
        .await?;
        self.event(
            &unit.id,
            "character_submitted",
            serde_json::json!({ "task_id": task.id, "timestamps": window.to_param() }),
        )
        .await;
        self.poller.start(&task);
        Ok(task.id)
    }

    /// character → next. Produces the continuation prompt for the second clip.
    pub async fn continue_with_character(&self, unit_id: &str) -> PipelineResult<String> {
        let unit = self.load_unit(unit_id).await?;
        let character = self.finished_task(&unit, Stage::Character).await?;
        let identifier = unit
            .character_name
            .clone()
            .or_else(|| character.character_id.clone())
            .ok_or_else(|| PipelineError::validation("character has neither a name nor a provider id"))?;
        let base_prompt = unit
            .prompt
            .clone()
            .ok_or_else(|| PipelineError::validation("unit has no first-clip prompt"))?;

        let (system, user) = continuation_request(&base_prompt, &identifier, &unit.situation);
        let prompt = self.llm.generate(&system, &user).await?;

        let stored = prompt.clone();
        let character_id = character.character_id.clone();
        self.update_unit(unit_id, move |u| {
            u.next_prompt = Some(stored);
            u.character_id = character_id;
            u.advance_to(Stage::Next);
        })
        .await?;
        self.event(unit_id, "continuation_generated", serde_json::json!({ "character": identifier }))
            .await;
        Ok(prompt)
    }

    /// Submits the next clip. Uses the stored continuation prompt unless one is given.
    pub async fn submit_next_clip(
        &self,
        unit_id: &str,
        prompt: Option<String>,
        options: VideoOptions,
    ) -> PipelineResult<String> {
        let seconds = self.clip_seconds(options)?;
        let unit = self.load_unit(unit_id).await?;
        if unit.stage < Stage::Next {
            return Err(PipelineError::validation("generate the continuation prompt first"));
        }
        let prompt = match prompt {
            Some(p) => non_empty(&p, "prompt")?,
            None => unit
                .next_prompt
                .clone()
                .ok_or_else(|| PipelineError::validation("unit has no continuation prompt"))?,
        };
        self.submit_video(&unit, Stage::Next, prompt, options.aspect_ratio.unwrap_or_default(), seconds)
            .await
    }

    /// Backward navigation: a pure read of an earlier (or the current) stage.
    pub async fn stage_view(&self, unit_id: &str, stage: Stage) -> PipelineResult<StageView> {
        let unit = self.load_unit(unit_id).await?;
        if stage > unit.stage {
            return Err(PipelineError::validation(format!(
                "unit has not reached the {stage} stage yet"
            )));
        }

        let text = match stage {
            Stage::Situation => Some(unit.situation.clone()),
            Stage::Prompt | Stage::Video => unit.prompt.clone(),
            Stage::Character => unit.character_name.clone(),
            Stage::Next => unit.next_prompt.clone(),
        };
        let task = match unit.task_for(stage) {
            Some(task_id) => self.store.get_task(task_id).await?.as_ref().map(TaskView::from),
            None => None,
        };

        Ok(StageView {
            stage,
            current_stage: unit.stage,
            text,
            task,
        })
    }

    pub async fn get_unit(&self, unit_id: &str) -> PipelineResult<UnitDetail> {
        let unit = self.load_unit(unit_id).await?;
        let tasks = self.store.list_unit_tasks(unit_id).await?;
        Ok(UnitDetail {
            unit,
            tasks: tasks.iter().map(TaskView::from).collect(),
        })
    }

    pub async fn list_units(&self) -> PipelineResult<Vec<CreativeUnit>> {
        Ok(self.store.list_units().await?)
    }

    pub async fn list_events(&self, unit_id: &str) -> PipelineResult<Vec<UnitEvent>> {
        self.load_unit(unit_id).await?;
        Ok(self.store.list_events(unit_id).await?)
    }

    /// Stops every poller of the unit, then deletes it with its tasks, events
    /// and materialized files.
    pub async fn delete_unit(&self, unit_id: &str) -> PipelineResult<()> {
        let _tombstone = self.tombstone(unit_id);
        let tasks = self.store.list_unit_tasks(unit_id).await?;
        for task in &tasks {
            self.poller.cancel(&task.id).await;
        }
        if !self.store.delete_unit(unit_id).await? {
            return Err(PipelineError::not_found(format!("unit {unit_id} not found")));
        }

        let materializer = self.poller.materializer();
        for local_path in tasks.iter().filter_map(|t| t.local_path.as_deref()) {
            if let Err(err) = materializer.remove(local_path).await {
                warn!(unit_id, local_path, error = %err, "failed to remove materialized video");
            }
        }
        info!(unit_id, "creative unit deleted");
        Ok(())
    }

    async fn submit_video(
        &self,
        unit: &CreativeUnit,
        slot: Stage,
        prompt: String,
        aspect_ratio: AspectRatio,
        seconds: u32,
    ) -> PipelineResult<String> {
        let _claim = self.claim(&unit.id, slot)?;
        self.ensure_slot_free(unit, slot).await?;

        let job = JobRequest::video(prompt.clone(), aspect_ratio, seconds);
        let task = self.submit(&unit.id, &job).await?;

        let task_id = task.id.clone();
        self.update_unit(&unit.id, move |u| {
            if slot == Stage::Next {
                u.next_prompt = Some(prompt);
                u.next_task_id = Some(task_id);
            } else {
                u.prompt = Some(prompt);
                u.video_task_id = Some(task_id);
                u.video_duration_secs = seconds;
                u.advance_to(Stage::Video);
            }
        })
        .await?;
        self.event(
            &unit.id,
            "video_submitted",
            serde_json::json!({ "task_id": task.id, "slot": slot, "seconds": seconds }),
        )
        .await;
        self.poller.start(&task);
        Ok(task.id)
    }

    /// Submits `job` to the provider and records the resulting task as `waiting`.
    async fn submit(&self, unit_id: &str, job: &JobRequest) -> PipelineResult<Task> {
        let provider_task_id = self.provider.submit_job(job).await?;
        let now = now_ms();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            unit_id: unit_id.to_string(),
            provider_task_id,
            kind: job.kind(),
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
        };
        self.store.insert_task(task.clone()).await?;
        info!(
            unit_id,
            task_id = %task.id,
            provider_task_id = %task.provider_task_id,
            kind = task.kind.as_str(),
            "task submitted"
        );
        Ok(task)
    }

    fn tombstone(&self, unit_id: &str) -> Tombstone<'_> {
        self.deleting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(unit_id.to_string());
        Tombstone {
            deleting: &self.deleting,
            unit_id: unit_id.to_string(),
        }
    }

    fn claim(&self, unit_id: &str, stage: Stage) -> PipelineResult<SlotClaim<'_>> {
        let key = (unit_id.to_string(), stage);
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if !claims.insert(key.clone()) {
            return Err(PipelineError::Conflict(format!(
                "a {stage} submission for unit {unit_id} is already in progress"
            )));
        }
        Ok(SlotClaim {
            claims: &self.claims,
            key,
        })
    }

    /// Rejects a submission while the slot's previous task is still running.
    /// Stalled tasks no longer count as running.
    async fn ensure_slot_free(&self, unit: &CreativeUnit, slot: Stage) -> PipelineResult<()> {
        let Some(task_id) = unit.task_for(slot) else {
            return Ok(());
        };
        match self.store.get_task(task_id).await? {
            Some(task) if !task.status.is_terminal() && !task.stalled => Err(PipelineError::Conflict(format!(
                "{slot} task {task_id} is still {}",
                task.status.as_str()
            ))),
            _ => Ok(()),
        }
    }

    /// The task in `slot`, which must have succeeded.
    async fn finished_task(&self, unit: &CreativeUnit, slot: Stage) -> PipelineResult<Task> {
        let task_id = unit
            .task_for(slot)
            .ok_or_else(|| PipelineError::validation(format!("unit has no {slot} task yet")))?;
        let task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Success {
            return Err(PipelineError::validation(format!(
                "{slot} task is {}, not success",
                task.status.as_str()
            )));
        }
        Ok(task)
    }

    fn clip_seconds(&self, options: VideoOptions) -> PipelineResult<u32> {
        let seconds = options.duration_secs.unwrap_or(self.default_video_seconds);
        if !CLIP_LENGTHS.contains(&seconds) {
            return Err(PipelineError::validation(format!(
                "duration must be one of {CLIP_LENGTHS:?} seconds"
            )));
        }
        Ok(seconds)
    }

    async fn load_unit(&self, unit_id: &str) -> PipelineResult<CreativeUnit> {
        self.store
            .get_unit(unit_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("unit {unit_id} not found")))
    }

    async fn load_task(&self, task_id: &str) -> PipelineResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("task {task_id} not found")))
    }

    async fn update_unit<F>(&self, unit_id: &str, apply: F) -> PipelineResult<CreativeUnit>
    where
        F: FnOnce(&mut CreativeUnit) + Send + 'static,
    {
        self.store
            .update_unit(unit_id, apply)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("unit {unit_id} not found")))
    }

    async fn event(&self, unit_id: &str, message: &str, data: serde_json::Value) {
        if let Err(err) = self.store.record_event(unit_id, "info", message, data).await {
            warn!(unit_id, error = ?err, "failed to record event");
        }
    }
}

fn non_empty(value: &str, what: &str) -> PipelineResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::validation(format!("{what} is required")));
    }
    Ok(trimmed.to_string())
}
