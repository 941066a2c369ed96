use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Video,
    Character,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Character => "character",
        }
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "character" => Ok(Self::Character),
            other => anyhow::bail!("unknown task kind {other:?}"),
        }
    }
}

/// Task state, spelled exactly as the generation provider reports it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Waiting,
    Queuing,
    Generating,
    Success,
    Fail,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Queuing => "queuing",
            Self::Generating => "generating",
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "queuing" => Ok(Self::Queuing),
            "generating" => Ok(Self::Generating),
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            other => anyhow::bail!("unknown task status {other:?}"),
        }
    }
}

/// Pipeline step of a creative unit. Declaration order is advancement order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Situation,
    Prompt,
    Video,
    Character,
    Next,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Situation => "situation",
            Self::Prompt => "prompt",
            Self::Video => "video",
            Self::Character => "character",
            Self::Next => "next",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "situation" => Ok(Self::Situation),
            "prompt" => Ok(Self::Prompt),
            "video" => Ok(Self::Video),
            "character" => Ok(Self::Character),
            "next" => Ok(Self::Next),
            other => anyhow::bail!("unknown stage {other:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub unit_id: String,
    pub provider_task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: i64,
    pub result_url: Option<String>,
    pub local_path: Option<String>,
    pub character_id: Option<String>,
    pub fail_message: Option<String>,
    pub warning: Option<String>,
    pub stalled: bool,
    pub observed_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// What the caller sees when asking about a task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: i64,
    pub result_url: Option<String>,
    pub local_path: Option<String>,
    pub character_id: Option<String>,
    pub fail_message: Option<String>,
    pub warning: Option<String>,
    pub stalled: bool,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: task.kind,
            status: task.status,
            progress: task.progress,
            result_url: task.result_url.clone(),
            local_path: task.local_path.clone(),
            character_id: task.character_id.clone(),
            fail_message: task.fail_message.clone(),
            warning: task.warning.clone(),
            stalled: task.stalled,
        }
    }
}

/// One status reading from the generation provider.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    pub status: TaskStatus,
    pub progress: i64,
    pub result: Option<TaskResult>,
    pub fail_message: Option<String>,
}

impl Observation {
    /// Primary artifact URL, only meaningful on success.
    pub fn result_url(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.result_urls.first())
            .map(String::as_str)
    }

    pub fn character_id(&self) -> Option<&str> {
        self.result.as_ref().and_then(|r| r.character_id.as_deref())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct TaskResult {
    #[serde(default, rename = "resultUrls")]
    pub result_urls: Vec<String>,
    #[serde(default)]
    pub character_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CreativeUnit {
    pub id: String,
    pub name: Option<String>,
    pub situation: String,
    pub prompt: Option<String>,
    pub video_task_id: Option<String>,
    pub video_duration_secs: u32,
    pub character_name: Option<String>,
    pub character_id: Option<String>,
    pub character_task_id: Option<String>,
    pub next_prompt: Option<String>,
    pub next_task_id: Option<String>,
    pub stage: Stage,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl CreativeUnit {
    /// Moves the stage marker forward to `target`; never moves it back.
    pub fn advance_to(&mut self, target: Stage) -> bool {
        if target > self.stage {
            self.stage = target;
            true
        } else {
            false
        }
    }

    /// Task slot that a submission for `stage` occupies.
    pub fn task_for(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Video => self.video_task_id.as_deref(),
            Stage::Character => self.character_task_id.as_deref(),
            Stage::Next => self.next_task_id.as_deref(),
            Stage::Situation | Stage::Prompt => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnitEvent {
    pub id: i64,
    pub unit_id: String,
    pub ts_ms: i64,
    pub level: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    #[default]
    Portrait,
    Landscape,
}

/// Accepted clip lengths, in seconds.
pub const CLIP_LENGTHS: [u32; 2] = [10, 15];

pub const MIN_CHARACTER_WINDOW_MS: i64 = 1_000;
pub const MAX_CHARACTER_WINDOW_MS: i64 = 4_000;

/// Slice of the source video a character is cut from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampWindow {
    start_ms: i64,
    end_ms: i64,
}

impl TimestampWindow {
    /// Parses `"start,end"` in seconds and checks the window spans 1 to 4 seconds.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let (start, end) = raw
            .split_once(',')
            .ok_or_else(|| PipelineError::validation(format!("timestamps {raw:?} must look like \"start,end\"")))?;
        let start_ms = parse_seconds(start)?;
        let end_ms = parse_seconds(end)?;

        let len = end_ms - start_ms;
        if !(MIN_CHARACTER_WINDOW_MS..=MAX_CHARACTER_WINDOW_MS).contains(&len) {
            return Err(PipelineError::validation(format!(
                "timestamp window {raw:?} must span 1 to 4 seconds"
            )));
        }
        Ok(Self { start_ms, end_ms })
    }

    /// Checks the window lies inside a clip of `video_secs` seconds.
    pub fn fits_within(&self, video_secs: u32) -> Result<(), PipelineError> {
        if self.end_ms > i64::from(video_secs) * 1_000 {
            return Err(PipelineError::validation(format!(
                "timestamp window {} ends after the {video_secs}s source video",
                self.to_param()
            )));
        }
        Ok(())
    }

    pub fn len_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    /// Provider wire form, e.g. `"5,9"` or `"1.5,4"`.
    pub fn to_param(&self) -> String {
        format!("{},{}", format_seconds(self.start_ms), format_seconds(self.end_ms))
    }
}

fn parse_seconds(raw: &str) -> Result<i64, PipelineError> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| PipelineError::validation(format!("{raw:?} is not a number of seconds")))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(PipelineError::validation(format!(
            "{raw:?} is not a valid timestamp"
        )));
    }
    Ok((secs * 1_000.0).round() as i64)
}

fn format_seconds(ms: i64) -> String {
    if ms % 1_000 == 0 {
        (ms / 1_000).to_string()
    } else {
        (ms as f64 / 1_000.0).to_string()
    }
}
