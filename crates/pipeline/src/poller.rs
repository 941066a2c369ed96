//! Background observation loops that drive provider tasks to a terminal state.
//!
//! Each task gets at most one loop. Loops are owned by a registry keyed by
//! task id so they can be started, inspected and cancelled from anywhere
//! (request handlers, unit deletion, shutdown) instead of being tied to the
//! lifetime of whoever submitted the job.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::PollConfig,
    materializer::Materializer,
    models::{Task, TaskKind, TaskStatus},
    provider::GenerationProvider,
    store::Store,
};

struct PollHandle {
    generation: u64,
    token: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Poller {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    provider: Arc<dyn GenerationProvider>,
    materializer: Materializer,
    config: PollConfig,
    handles: Mutex<HashMap<String, PollHandle>>,
    next_generation: AtomicU64,
}

/// Identity of one loop, carried by the loop itself.
struct LoopTarget {
    task_id: String,
    unit_id: String,
    provider_task_id: String,
    kind: TaskKind,
    generation: u64,
}

impl Poller {
    pub fn new(
        store: Store,
        provider: Arc<dyn GenerationProvider>,
        materializer: Materializer,
        config: PollConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                materializer,
                config,
                handles: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Starts polling `task`. Returns `false` without doing anything when a
    /// loop for the task is already running or the task is terminal.
    pub fn start(&self, task: &Task) -> bool {
        if task.status.is_terminal() {
            return false;
        }

        let mut handles = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
        if handles.contains_key(&task.id) {
            debug!(task_id = %task.id, "poller already active");
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let target = LoopTarget {
            task_id: task.id.clone(),
            unit_id: task.unit_id.clone(),
            provider_task_id: task.provider_task_id.clone(),
            kind: task.kind,
            generation,
        };
        let join = tokio::spawn(run(self.inner.clone(), target, token.clone()));
        handles.insert(
            task.id.clone(),
            PollHandle {
                generation,
                token,
                join,
            },
        );
        info!(task_id = %task.id, provider_task_id = %task.provider_task_id, "poller started");
        true
    }

    pub fn materializer(&self) -> &Materializer {
        &self.inner.materializer
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stops the loop for `task_id` and waits for it to exit. A status query
    /// already in flight is allowed to finish, but its result is discarded;
    /// once this returns the loop writes nothing more.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let handle = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
        let Some(handle) = handle else {
            return false;
        };

        handle.token.cancel();
        if let Err(err) = handle.join.await {
            warn!(task_id, error = %err, "poller exited abnormally");
        }
        info!(task_id, "poller cancelled");
        true
    }

    /// Cancels every running loop.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, PollHandle)> = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();

        for (_, handle) in &handles {
            handle.token.cancel();
        }
        for (task_id, handle) in handles {
            if let Err(err) = handle.join.await {
                warn!(task_id = %task_id, error = %err, "poller exited abnormally");
            }
        }
    }

    /// Re-attaches loops to every task the provider has not finished yet.
    pub async fn resume_pending(&self) -> anyhow::Result<usize> {
        let pending = self.inner.store.list_pending_tasks().await?;
        Ok(pending.iter().filter(|task| self.start(task)).count())
    }
}

async fn run(inner: Arc<Inner>, target: LoopTarget, token: CancellationToken) {
    poll_until_done(&inner, &target, &token).await;

    let mut handles = inner.handles.lock().unwrap_or_else(|e| e.into_inner());
    if handles
        .get(&target.task_id)
        .is_some_and(|h| h.generation == target.generation)
    {
        handles.remove(&target.task_id);
    }
}

async fn poll_until_done(inner: &Inner, target: &LoopTarget, token: &CancellationToken) {
    let task_id = target.task_id.as_str();
    let started = Instant::now();
    let mut delay = inner.config.initial_delay;
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = inner.config.interval;
        ticks += 1;

        if started.elapsed() >= inner.config.max_duration {
            warn!(task_id, ticks, "task still not terminal; marking stalled");
            if let Err(err) = inner.store.mark_stalled(task_id).await {
                warn!(task_id, error = ?err, "failed to mark task stalled");
            }
            return;
        }

        let result = inner.provider.query_status(&target.provider_task_id).await;
        if token.is_cancelled() {
            return;
        }

        match result {
            Ok(obs) => {
                debug!(task_id, tick = ticks, status = obs.status.as_str(), progress = obs.progress, "observed");
                match inner.store.record_observation(task_id, &obs).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(task_id, ticks, "task row deleted or already final; stopping");
                        return;
                    }
                    Err(err) => {
                        warn!(task_id, error = ?err, "failed to record observation");
                        continue;
                    }
                }

                match obs.status {
                    TaskStatus::Success => {
                        info!(task_id, ticks, "task succeeded");
                        if token.is_cancelled() {
                            return;
                        }
                        if target.kind == TaskKind::Video {
                            match obs.result_url() {
                                Some(url) => materialize(inner, target, url).await,
                                None => {
                                    flag_materialization(inner, target, "provider reported success without a result url")
                                        .await
                                }
                            }
                        }
                        return;
                    }
                    TaskStatus::Fail => {
                        info!(task_id, ticks, fail_message = ?obs.fail_message, "task failed");
                        return;
                    }
                    TaskStatus::Waiting | TaskStatus::Queuing | TaskStatus::Generating => {}
                }
            }
            Err(err) => {
                // Network blips and provider hiccups must not fail a running job.
                warn!(task_id, tick = ticks, error = %err, "status query failed; retrying");
            }
        }
    }
}

async fn materialize(inner: &Inner, target: &LoopTarget, url: &str) {
    if let Err(err) = inner.materializer.materialize(&target.task_id, url).await {
        flag_materialization(inner, target, &err.to_string()).await;
    }
}

/// Leaves the task `success` but records why no local copy exists.
async fn flag_materialization(inner: &Inner, target: &LoopTarget, message: &str) {
    let task_id = target.task_id.as_str();
    warn!(task_id, error = %message, "materialization failed; playback falls back to the remote url");
    if let Err(err) = inner.store.set_warning(task_id, message).await {
        warn!(task_id, error = ?err, "failed to record materialization warning");
    }
    let event = inner
        .store
        .record_event(
            &target.unit_id,
            "warn",
            "materialization_failed",
            serde_json::json!({ "task_id": task_id, "error": message }),
        )
        .await;
    if let Err(err) = event {
        warn!(task_id, error = ?err, "failed to record event");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        models::{Observation, Stage},
        testing::{self, FakeProvider, Scripted},
    };

    fn fast() -> PollConfig {
        PollConfig {
            initial_delay: Duration::from_millis(5),
            interval: Duration::from_millis(5),
            max_duration: Duration::from_secs(30),
        }
    }

    async fn setup(
        provider: Arc<FakeProvider>,
        config: PollConfig,
    ) -> (tempfile::TempDir, Store, Poller, Task) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path().join("db.sqlite3")).unwrap();
        let unit = testing::unit(Stage::Video);
        store.insert_unit(unit.clone()).await.unwrap();
        let task = testing::task(&unit.id, "p-1", TaskKind::Video);
        store.insert_task(task.clone()).await.unwrap();
        let materializer = Materializer::new(store.clone(), dir.path().join("videos"));
        let poller = Poller::new(store.clone(), provider, materializer, config);
        (dir, store, poller, task)
    }

    async fn wait_idle(poller: &Poller, task_id: &str) {
        for _ in 0..400 {
            if !poller.is_active(task_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("poller for {task_id} never finished");
    }

    #[tokio::test]
    async fn transport_errors_do_not_fail_a_running_task() {
        let cdn = testing::serve_artifacts(b"video").await;
        let url = format!("{cdn}/x.mp4");
        let provider = Arc::new(FakeProvider::with_script([
            Scripted::TransportError,
            Scripted::TransportError,
            Scripted::TransportError,
            Scripted::Status(testing::success(&url)),
        ]));
        let (_dir, store, poller, task) = setup(provider.clone(), fast()).await;

        assert!(poller.start(&task));
        wait_idle(&poller, &task.id).await;

        assert_eq!(provider.status_calls(), 4);
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.result_url.as_deref(), Some(url.as_str()));
        assert!(stored.local_path.is_some());
        assert_eq!(stored.warning, None);
    }

    #[tokio::test]
    async fn provider_errors_are_retried_like_transport_errors() {
        let cdn = testing::serve_artifacts(b"video").await;
        let url = format!("{cdn}/x.mp4");
        let provider = Arc::new(FakeProvider::with_script([
            Scripted::ProviderError,
            Scripted::ProviderError,
            Scripted::Status(testing::success(&url)),
        ]));
        let (_dir, store, poller, task) = setup(provider.clone(), fast()).await;

        poller.start(&task);
        wait_idle(&poller, &task.id).await;

        assert_eq!(provider.status_calls(), 3);
        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert!(stored.local_path.is_some());
    }

    #[tokio::test]
    async fn success_without_a_url_is_flagged() {
        let provider = Arc::new(FakeProvider::with_script([Scripted::Status(Observation {
            status: TaskStatus::Success,
            progress: 100,
            ..Default::default()
        })]));
        let (_dir, store, poller, task) = setup(provider, fast()).await;

        poller.start(&task);
        wait_idle(&poller, &task.id).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.local_path, None);
        assert!(stored.warning.is_some());
        let events = store.list_events(&task.unit_id).await.unwrap();
        assert_eq!(events.last().map(|e| e.message.as_str()), Some("materialization_failed"));
    }

    #[tokio::test]
    async fn loop_stops_once_its_row_is_gone() {
        let provider = Arc::new(FakeProvider::pending());
        let (_dir, store, poller, task) = setup(provider.clone(), fast()).await;

        poller.start(&task);
        while provider.status_calls() < 1 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(store.delete_unit(&task.unit_id).await.unwrap());
        wait_idle(&poller, &task.id).await;

        let calls = provider.status_calls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.status_calls(), calls);
    }

    #[tokio::test]
    async fn starting_twice_is_a_no_op() {
        let provider = Arc::new(FakeProvider::pending());
        let (_dir, _store, poller, task) = setup(provider, fast()).await;

        assert!(poller.start(&task));
        assert!(!poller.start(&task));
        assert_eq!(poller.active_count(), 1);
        assert!(poller.cancel(&task.id).await);
        assert!(!poller.is_active(&task.id));
        assert!(!poller.cancel(&task.id).await);
    }

    #[tokio::test]
    async fn no_writes_after_cancel_returns() {
        let provider = Arc::new(FakeProvider::pending());
        let (_dir, store, poller, task) = setup(provider.clone(), fast()).await;

        poller.start(&task);
        while provider.status_calls() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        poller.cancel(&task.id).await;

        let before = store.get_task(&task.id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(before.updated_at_ms, after.updated_at_ms);
        assert_eq!(before.observed_at_ms, after.observed_at_ms);
    }

    #[tokio::test]
    async fn provider_fail_stops_the_loop() {
        let provider = Arc::new(FakeProvider::with_script([
            Scripted::Status(Observation {
                status: TaskStatus::Queuing,
                ..Default::default()
            }),
            Scripted::Status(Observation {
                status: TaskStatus::Fail,
                fail_message: Some("content policy".into()),
                ..Default::default()
            }),
        ]));
        let (_dir, store, poller, task) = setup(provider.clone(), fast()).await;

        poller.start(&task);
        wait_idle(&poller, &task.id).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Fail);
        assert_eq!(stored.fail_message.as_deref(), Some("content policy"));
        assert_eq!(stored.result_url, None);
        assert_eq!(provider.status_calls(), 2);
    }

    #[tokio::test]
    async fn failed_download_is_only_a_warning() {
        let cdn = testing::serve_artifacts(b"").await;
        let url = format!("{cdn}/missing.mp4");
        let provider = Arc::new(FakeProvider::with_script([Scripted::Status(testing::success(&url))]));
        let (_dir, store, poller, task) = setup(provider, fast()).await;

        poller.start(&task);
        wait_idle(&poller, &task.id).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.result_url.as_deref(), Some(url.as_str()));
        assert_eq!(stored.local_path, None);
        assert!(stored.warning.is_some());

        let events = store.list_events(&task.unit_id).await.unwrap();
        assert_eq!(events.last().map(|e| e.message.as_str()), Some("materialization_failed"));
    }

    #[tokio::test]
    async fn gives_up_after_the_ceiling_and_can_resume() {
        let provider = Arc::new(FakeProvider::pending());
        let config = PollConfig {
            max_duration: Duration::from_millis(20),
            ..fast()
        };
        let (_dir, store, poller, task) = setup(provider, config).await;

        poller.start(&task);
        wait_idle(&poller, &task.id).await;

        let stored = store.get_task(&task.id).await.unwrap().unwrap();
        assert!(stored.stalled);
        assert_eq!(stored.status, TaskStatus::Generating);

        assert_eq!(poller.resume_pending().await.unwrap(), 1);
        assert!(poller.is_active(&task.id));
        poller.shutdown().await;
        assert_eq!(poller.active_count(), 0);
    }
}
