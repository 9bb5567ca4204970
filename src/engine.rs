//! The reconciliation pass.
//!
//! One pass fetches every Todoist task, scans the vault for tagged lines,
//! creates remote tasks for new lines, then walks every linked line and
//! settles completion first and content second. The caller owns the
//! [`SyncState`] and persists it after the pass.

use crate::config::{ConflictPolicy, TodoistConfig};
use crate::error::SyncError;
use crate::integrations::todoist::{CreateTaskOptions, DueUpdate, TaskGateway, TaskUpdate};
use crate::models::{ParsedTask, Project, RemoteTask};
use crate::scanner;
use crate::storage::{self, NoteStore};
use crate::sync_state::{SyncState, SyncedTaskRecord};
use crate::task_line::{self, TaskCodec};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

const NOT_CONFIGURED: &str = "Todoist API token is not configured";
const ALREADY_RUNNING: &str = "Sync already in progress";

#[derive(Clone, Debug, PartialEq)]
pub struct SyncSettings {
    pub marker: String,
    pub default_project: Option<String>,
    pub conflict_policy: ConflictPolicy,
}

impl SyncSettings {
    pub fn from_config(config: &TodoistConfig) -> Self {
        Self {
            marker: config.sync_marker.clone(),
            default_project: config.default_project_id(),
            conflict_policy: config.conflict_policy,
        }
    }
}

/// A task whose two sides disagree, queued under [`ConflictPolicy::Ask`].
#[derive(Clone, Debug, PartialEq)]
pub struct Conflict {
    pub remote_id: String,
    pub file_path: String,
    pub line_index: usize,
    pub local_text: String,
    pub remote_text: String,
    pub local_completed: bool,
    pub remote_completed: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncResult {
    pub created: usize,
    pub updated: usize,
    pub completed: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
    /// Conflicts for the host to show; the host clears them afterwards.
    pub pending_conflicts: Vec<Conflict>,
}

impl SyncResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            ..Self::default()
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Created {} | Updated {} | Completed {} | Conflicts {} | Errors {}",
            self.created,
            self.updated,
            self.completed,
            self.conflicts,
            self.errors.len()
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateLineOutcome {
    pub success: bool,
    pub message: String,
}

impl CreateLineOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Counter changes produced by reconciling one linked task.
#[derive(Debug, Default)]
struct Effect {
    completed: bool,
    updated: bool,
    conflict: Option<Conflict>,
}

impl Effect {
    fn completed() -> Self {
        Self {
            completed: true,
            ..Self::default()
        }
    }

    fn updated() -> Self {
        Self {
            updated: true,
            ..Self::default()
        }
    }

    fn conflict(conflict: Conflict) -> Self {
        Self {
            conflict: Some(conflict),
            ..Self::default()
        }
    }
}

/// Clears the in-progress flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine<G, S> {
    gateway: Option<G>,
    store: S,
    codec: TaskCodec,
    settings: SyncSettings,
    in_progress: AtomicBool,
}

impl<G, S> SyncEngine<G, S>
where
    G: TaskGateway,
    S: NoteStore,
{
    /// `gateway` is `None` until a credential is configured; passes then
    /// fail fast without touching the vault.
    pub fn new(gateway: Option<G>, store: S, settings: SyncSettings) -> Result<Self, SyncError> {
        let codec = TaskCodec::new(&settings.marker)?;
        Ok(Self {
            gateway,
            store,
            codec,
            settings,
            in_progress: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn verify_credential(&self) -> Result<bool, SyncError> {
        self.gateway()?.verify_credential()
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, SyncError> {
        self.gateway()?.list_projects()
    }

    fn gateway(&self) -> Result<&G, SyncError> {
        self.gateway
            .as_ref()
            .ok_or_else(|| SyncError::Config(NOT_CONFIGURED.to_string()))
    }

    /// Runs one reconciliation pass against `state`.
    ///
    /// A call made while another pass is running returns at once with a
    /// single error and zero counters.
    pub fn perform_sync(&self, state: &mut SyncState) -> SyncResult {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("event=sync_pass module=engine status=rejected reason=in_progress");
            return SyncResult::failed(ALREADY_RUNNING);
        }
        let _guard = PassGuard(&self.in_progress);

        let Some(gateway) = self.gateway.as_ref() else {
            return SyncResult::failed(NOT_CONFIGURED);
        };

        let remote_tasks = match gateway.list_tasks() {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!("event=sync_pass module=engine status=aborted phase=fetch error={err}");
                return SyncResult::failed(format!("Failed to fetch Todoist tasks: {}", err.message()));
            }
        };
        let remote_by_id: HashMap<String, RemoteTask> = remote_tasks
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();

        let mut linked: BTreeMap<String, ParsedTask> = BTreeMap::new();
        let mut unlinked = Vec::new();
        for task in scanner::scan_all(&self.store, &self.codec) {
            match task.remote_id.clone() {
                Some(id) => {
                    linked.insert(id, task);
                }
                None => unlinked.push(task),
            }
        }

        let now = Utc::now();
        let mut result = SyncResult::default();
        let mut created_ids = HashSet::new();

        for task in &unlinked {
            if let Some(id) = self.create_remote(gateway, state, task, now, &mut result) {
                created_ids.insert(id);
            }
        }

        for (id, local) in &linked {
            match self.reconcile_linked(gateway, state, id, local, remote_by_id.get(id), now) {
                Ok(effect) => {
                    if effect.completed {
                        result.completed += 1;
                    }
                    if effect.updated {
                        result.updated += 1;
                    }
                    if let Some(conflict) = effect.conflict {
                        result.conflicts += 1;
                        result.pending_conflicts.push(conflict);
                    }
                }
                Err(err) => push_error(
                    &mut result,
                    format!(
                        "Failed to sync task {id} ({}:{}): {}",
                        local.file_path,
                        local.line_index + 1,
                        err.message()
                    ),
                ),
            }
        }

        let before = state.records.len();
        state.records.retain(|id, _| {
            linked.contains_key(id) || remote_by_id.contains_key(id) || created_ids.contains(id)
        });
        let pruned = before - state.records.len();

        state.last_full_sync_at = Some(now);
        info!(
            "event=sync_pass module=engine status=ok remote={} local={} created={} updated={} completed={} conflicts={} errors={} pruned={}",
            remote_by_id.len(),
            linked.len() + unlinked.len(),
            result.created,
            result.updated,
            result.completed,
            result.conflicts,
            result.errors.len(),
            pruned
        );
        result
    }

    /// Creates the remote task for an unlinked line and links the line to it.
    /// Returns the new id when the create call succeeded.
    fn create_remote(
        &self,
        gateway: &G,
        state: &mut SyncState,
        task: &ParsedTask,
        now: DateTime<Utc>,
        result: &mut SyncResult,
    ) -> Option<String> {
        if task.content.is_empty() {
            debug!(
                "event=create_skip module=engine reason=empty_content path={} line={}",
                task.file_path, task.line_index
            );
            return None;
        }

        let options = CreateTaskOptions {
            project_id: self.settings.default_project.clone(),
            priority: task.priority,
            due_date: task.due_date,
            labels: task.labels.clone(),
            description: (!task.description.is_empty()).then(|| task.description.clone()),
        };
        let created = match gateway.create_task(&task.content, &options) {
            Ok(created) => created,
            Err(err) => {
                push_error(
                    result,
                    format!(
                        "Failed to create task ({}:{}): {}",
                        task.file_path,
                        task.line_index + 1,
                        err.message()
                    ),
                );
                return None;
            }
        };
        result.created += 1;

        if let Err(err) = self.link_created(gateway, state, task, &created.id, now) {
            push_error(
                result,
                format!(
                    "Created task {} but could not finish linking ({}:{}): {}",
                    created.id,
                    task.file_path,
                    task.line_index + 1,
                    err.message()
                ),
            );
        }
        Some(created.id)
    }

    fn link_created(
        &self,
        gateway: &G,
        state: &mut SyncState,
        task: &ParsedTask,
        remote_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.rewrite_task_line(task, |line| task_line::attach_remote_id(line, remote_id))?;
        state.upsert(record_for(task, remote_id, false, now));

        if task.completed {
            gateway.close_task(remote_id)?;
            state.upsert(record_for(task, remote_id, true, now));
        }
        Ok(())
    }

    fn reconcile_linked(
        &self,
        gateway: &G,
        state: &mut SyncState,
        id: &str,
        local: &ParsedTask,
        remote: Option<&RemoteTask>,
        now: DateTime<Utc>,
    ) -> Result<Effect, SyncError> {
        let looked_up;
        let remote = match remote {
            Some(remote) => remote,
            // Closed tasks drop out of the active list; only a lookup tells
            // a completion apart from a deletion.
            None if local.completed => return self.resolve_remote_deletion(state, id, local),
            None => match gateway.get_task(id)? {
                Some(task) => {
                    looked_up = task;
                    &looked_up
                }
                None => return self.resolve_remote_deletion(state, id, local),
            },
        };

        match (local.completed, remote.completed) {
            (true, false) => {
                match gateway.close_task(id) {
                    Ok(_) => {}
                    Err(err) if err.is_not_found() => {
                        return self.resolve_remote_deletion(state, id, local);
                    }
                    Err(err) => return Err(err),
                }
                state.upsert(record_for(local, id, true, now));
                Ok(Effect::completed())
            }
            (false, true) => match self.settings.conflict_policy {
                ConflictPolicy::LocalWins => {
                    match gateway.reopen_task(id) {
                        Ok(_) => {}
                        Err(err) if err.is_not_found() => {
                            return self.resolve_remote_deletion(state, id, local);
                        }
                        Err(err) => return Err(err),
                    }
                    state.upsert(record_for(local, id, false, now));
                    Ok(Effect::updated())
                }
                ConflictPolicy::RemoteWins | ConflictPolicy::Ask => {
                    self.rewrite_task_line(local, |line| task_line::set_completed(line, true))?;
                    let mut done = local.clone();
                    done.completed = true;
                    state.upsert(record_for(&done, id, true, now));

                    let mut effect = Effect::completed();
                    if self.settings.conflict_policy == ConflictPolicy::Ask {
                        effect.conflict = Some(conflict_for(id, local, remote));
                    }
                    Ok(effect)
                }
            },
            _ => self.reconcile_content(gateway, state, id, local, remote, now),
        }
    }

    fn reconcile_content(
        &self,
        gateway: &G,
        state: &mut SyncState,
        id: &str,
        local: &ParsedTask,
        remote: &RemoteTask,
        now: DateTime<Utc>,
    ) -> Result<Effect, SyncError> {
        let (pulled_line, pulled) = self.pull_remote(local, remote);
        let differs = local.content != pulled.content
            || local.priority != pulled.priority
            || local.due_date != pulled.due_date;
        if !differs {
            state.upsert(record_for(local, id, remote.completed, now));
            return Ok(Effect::default());
        }

        match self.settings.conflict_policy {
            ConflictPolicy::LocalWins => {
                let update = TaskUpdate {
                    content: Some(local.content.clone()),
                    priority: Some(local.priority),
                    due: Some(match local.due_date {
                        Some(date) => DueUpdate::Set(date),
                        None => DueUpdate::Clear,
                    }),
                    labels: Some(local.labels.clone()),
                };
                gateway.update_task(id, &update)?;
                state.upsert(record_for(local, id, remote.completed, now));
                Ok(Effect::updated())
            }
            ConflictPolicy::RemoteWins => {
                self.rewrite_task_line(local, |_| pulled_line)?;
                state.upsert(record_for(&pulled, id, remote.completed, now));
                Ok(Effect::updated())
            }
            ConflictPolicy::Ask => Ok(Effect::conflict(conflict_for(id, local, remote))),
        }
    }

    /// The line as it would read with the remote content, priority and due
    /// date written into it, and what that line parses back to. Remote text
    /// carrying hashtags, date tokens or odd spacing only settles once it
    /// has been through the codec.
    fn pull_remote(&self, local: &ParsedTask, remote: &RemoteTask) -> (String, ParsedTask) {
        let mut pulled = local.clone();
        pulled.content = remote.content.clone();
        pulled.priority = remote.priority;
        pulled.due_date = remote.due_date;
        let line = self.codec.serialize_line(&pulled);

        let parsed = match self.codec.parse_line(
            &line,
            local.line_index,
            &local.file_path,
            local.source_modified_at,
        ) {
            Some(mut parsed) => {
                parsed.description = local.description.clone();
                parsed
            }
            None => {
                pulled.raw_line = line.clone();
                pulled
            }
        };
        (line, parsed)
    }

    /// Marks a line whose remote task is gone as completed and forgets it.
    /// A line that is already checked is just forgotten.
    fn resolve_remote_deletion(
        &self,
        state: &mut SyncState,
        id: &str,
        local: &ParsedTask,
    ) -> Result<Effect, SyncError> {
        if local.completed {
            state.remove(id);
            return Ok(Effect::default());
        }
        self.rewrite_task_line(local, |line| task_line::set_completed(line, true))?;
        state.remove(id);
        Ok(Effect::completed())
    }

    /// Rewrites the line `task` was scanned from, provided it still carries
    /// the same remote id.
    fn rewrite_task_line<F>(&self, task: &ParsedTask, edit: F) -> Result<(), SyncError>
    where
        F: FnOnce(&str) -> String,
    {
        let mut matched = false;
        let found = storage::update_line(&self.store, &task.file_path, task.line_index, |line| {
            if task_line::remote_id(line) == task.remote_id && task_line::is_task_line(line) {
                matched = true;
                edit(line)
            } else {
                line.to_string()
            }
        })?;
        if !found || !matched {
            return Err(SyncError::Io(format!(
                "line {} of {} changed since the scan",
                task.line_index + 1,
                task.file_path
            )));
        }
        Ok(())
    }

    /// Creates a Todoist task from one line of a note and links the line.
    ///
    /// Plain text and list items become a new checkbox line; checkbox lines
    /// get the marker if they lack it.
    pub fn create_from_line(
        &self,
        state: &mut SyncState,
        file_path: &str,
        line_index: usize,
        raw_line: &str,
    ) -> CreateLineOutcome {
        let Some(gateway) = self.gateway.as_ref() else {
            return CreateLineOutcome::failure(NOT_CONFIGURED);
        };
        if task_line::remote_id(raw_line).is_some() {
            return CreateLineOutcome::failure("Task already synced with Todoist");
        }

        let line = if task_line::is_task_line(raw_line) {
            self.codec.ensure_marker(raw_line)
        } else {
            let indent = task_line::leading_whitespace(raw_line);
            let (_, text) = task_line::split_list_prefix(raw_line.trim_start());
            let text = text.trim();
            if text.is_empty() {
                return CreateLineOutcome::failure("Line is empty");
            }
            self.codec.ensure_marker(&format!("{indent}- [ ] {text}"))
        };

        let now = Utc::now();
        let Some(task) = self.codec.parse_line(&line, line_index, file_path, now) else {
            return CreateLineOutcome::failure("Line is not a task");
        };
        if task.content.is_empty() {
            return CreateLineOutcome::failure("Task has no text");
        }

        let options = CreateTaskOptions {
            project_id: self.settings.default_project.clone(),
            priority: task.priority,
            due_date: task.due_date,
            labels: task.labels.clone(),
            description: None,
        };
        let created = match gateway.create_task(&task.content, &options) {
            Ok(created) => created,
            Err(err) => {
                warn!("event=create_line module=engine status=error error={err}");
                return CreateLineOutcome::failure(format!(
                    "Failed to create task: {}",
                    err.message()
                ));
            }
        };

        let linked_line = task_line::attach_remote_id(&line, &created.id);
        match storage::update_line(&self.store, file_path, line_index, |_| linked_line) {
            Ok(true) => {}
            Ok(false) => {
                return CreateLineOutcome::failure(format!(
                    "Created task {} but line {} of {file_path} no longer exists",
                    created.id,
                    line_index + 1
                ));
            }
            Err(err) => {
                return CreateLineOutcome::failure(format!(
                    "Created task {} but could not update {file_path}: {err}",
                    created.id
                ));
            }
        }

        state.upsert(SyncedTaskRecord {
            remote_id: created.id.clone(),
            file_path: file_path.to_string(),
            line_index,
            fingerprint: String::new(),
            last_synced_at: now,
            local_completed: task.completed,
            remote_completed: created.completed,
        });
        info!("event=create_line module=engine status=ok");
        CreateLineOutcome {
            success: true,
            message: format!("Created Todoist task {}", created.id),
        }
    }
}

fn record_for(
    task: &ParsedTask,
    remote_id: &str,
    remote_completed: bool,
    now: DateTime<Utc>,
) -> SyncedTaskRecord {
    SyncedTaskRecord {
        remote_id: remote_id.to_string(),
        file_path: task.file_path.clone(),
        line_index: task.line_index,
        fingerprint: task_line::fingerprint(task),
        last_synced_at: now,
        local_completed: task.completed,
        remote_completed,
    }
}

fn conflict_for(id: &str, local: &ParsedTask, remote: &RemoteTask) -> Conflict {
    Conflict {
        remote_id: id.to_string(),
        file_path: local.file_path.clone(),
        line_index: local.line_index,
        local_text: local.content.clone(),
        remote_text: remote.content.clone(),
        local_completed: local.completed,
        remote_completed: remote.completed,
    }
}

fn push_error(result: &mut SyncResult, message: String) {
    warn!("event=sync_task module=engine status=error");
    result.errors.push(message);
}
