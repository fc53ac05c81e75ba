use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::TaskError;
use crate::types::{
    CascadedTransition, NewTask, Phase, PhaseStatus, Project, ProjectStatus, RegistrationToken,
    Task, TaskFieldUpdate, TaskHistory, TaskPriority, TaskStatus, TransitionOutcome,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

const TASK_COLUMNS: &str = "id, project_id, phase_id, title, description, status, priority, \
     worker_prompt, qa_prompt, branch_name, commit_hash, worker_id, reviewer_id, \
     qa_result, output_path, error_message, version, created_at, updated_at, \
     started_at, completed_at";

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp / id helpers ───────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_default()
}

fn parse_uuid_opt(s: Option<String>) -> Option<Uuid> {
    s.and_then(|v| Uuid::parse_str(&v).ok())
}

// ── Row mappers ──────────────────────────────────────────────────────────

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(1)?;
    let phase_id: String = row.get(2)?;
    let status: String = row.get(5)?;
    let priority: String = row.get(6)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;
    Ok(Task {
        id: parse_uuid(&id),
        project_id: parse_uuid(&project_id),
        phase_id: parse_uuid(&phase_id),
        title: row.get(3)?,
        description: row.get(4)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Waiting),
        priority: TaskPriority::parse(&priority).unwrap_or(TaskPriority::Medium),
        worker_prompt: row.get(7)?,
        qa_prompt: row.get(8)?,
        depends_on: Vec::new(),
        branch_name: row.get(9)?,
        commit_hash: row.get(10)?,
        worker_id: parse_uuid_opt(row.get(11)?),
        reviewer_id: parse_uuid_opt(row.get(12)?),
        qa_result: row.get(13)?,
        output_path: row.get(14)?,
        error_message: row.get(15)?,
        version: row.get(16)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        started_at: parse_ts_opt(row.get(19)?),
        completed_at: parse_ts_opt(row.get(20)?),
    })
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Project {
        id: parse_uuid(&id),
        name: row.get(1)?,
        description: row.get(2)?,
        repo_path: row.get(3)?,
        status: match status.as_str() {
            "active" => ProjectStatus::Active,
            "paused" => ProjectStatus::Paused,
            "completed" => ProjectStatus::Completed,
            _ => ProjectStatus::Design,
        },
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_phase(row: &rusqlite::Row<'_>) -> rusqlite::Result<Phase> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(1)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(Phase {
        id: parse_uuid(&id),
        project_id: parse_uuid(&project_id),
        name: row.get(2)?,
        description: row.get(3)?,
        branch_name: row.get(4)?,
        order_index: row.get(5)?,
        status: match status.as_str() {
            "active" => PhaseStatus::Active,
            "completed" => PhaseStatus::Completed,
            _ => PhaseStatus::Pending,
        },
        created_at: parse_ts(&created_at),
    })
}

fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskHistory> {
    let task_id: String = row.get(1)?;
    let from_status: String = row.get(2)?;
    let to_status: String = row.get(3)?;
    let extra: Option<String> = row.get(6)?;
    let timestamp: String = row.get(7)?;
    Ok(TaskHistory {
        id: row.get(0)?,
        task_id: parse_uuid(&task_id),
        from_status: TaskStatus::parse(&from_status).unwrap_or(TaskStatus::Waiting),
        to_status: TaskStatus::parse(&to_status).unwrap_or(TaskStatus::Waiting),
        actor: row.get(4)?,
        reason: row.get(5)?,
        extra: extra.and_then(|e| serde_json::from_str(&e).ok()),
        timestamp: parse_ts(&timestamp),
    })
}

fn row_to_registration_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistrationToken> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(3)?;
    let revoked: i64 = row.get(5)?;
    Ok(RegistrationToken {
        id: parse_uuid(&id),
        token: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_ts(&created_at),
        expires_at: parse_ts_opt(row.get(4)?),
        revoked: revoked != 0,
    })
}

// ── Transaction-scoped helpers ───────────────────────────────────────────
// These take a plain Connection so they work both under the outer Mutex
// and inside an explicit transaction (Transaction derefs to Connection).

fn conn_get_task(conn: &Connection, task_id: Uuid) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id.to_string()],
            row_to_task,
        )
        .optional()
        .context("get_task")?;
    match task {
        None => Ok(None),
        Some(mut t) => {
            t.depends_on = conn_dependency_ids(conn, t.id)?;
            Ok(Some(t))
        }
    }
}

fn conn_dependency_ids(conn: &Connection, task_id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn
        .prepare("SELECT dependency_id FROM task_dependencies WHERE task_id = ?1 ORDER BY dependency_id")?;
    let ids = stmt
        .query_map(params![task_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("dependency_ids")?;
    Ok(ids.iter().map(|s| parse_uuid(s)).collect())
}

fn conn_incomplete_dependency_count(conn: &Connection, task_id: Uuid) -> Result<i64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM task_dependencies d \
             JOIN tasks t ON t.id = d.dependency_id \
             WHERE d.task_id = ?1 AND t.status != 'done'",
            params![task_id.to_string()],
            |r| r.get(0),
        )
        .context("incomplete_dependency_count")?;
    Ok(count)
}

fn conn_dependents_with_status(
    conn: &Connection,
    task_id: Uuid,
    status: TaskStatus,
) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks \
         WHERE status = ?1 AND id IN \
           (SELECT task_id FROM task_dependencies WHERE dependency_id = ?2) \
         ORDER BY created_at ASC, id ASC"
    ))?;
    let tasks = stmt
        .query_map(params![status.as_str(), task_id.to_string()], row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("dependents_with_status")?;
    Ok(tasks)
}

fn conn_insert_history(
    conn: &Connection,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    actor: &str,
    reason: Option<&str>,
    extra: Option<&serde_json::Value>,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO task_history (task_id, from_status, to_status, actor, reason, extra, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            task_id.to_string(),
            from.as_str(),
            to.as_str(),
            actor,
            reason,
            extra.map(ToString::to_string),
            now,
        ],
    )
    .context("insert_history")?;
    Ok(())
}

fn conn_set_status(
    conn: &Connection,
    task_id: Uuid,
    to: TaskStatus,
    now: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3",
        params![to.as_str(), now, task_id.to_string()],
    )
    .context("set_status")?;
    Ok(())
}

/// Re-classify waiting/blocked dependents after `task_id` reached `done`:
/// any dependent whose dependencies are now all met advances to `ready`.
fn conn_promote_dependents(
    conn: &Connection,
    task_id: Uuid,
    now: &str,
) -> Result<Vec<CascadedTransition>> {
    let mut cascades = Vec::new();
    for from in [TaskStatus::Waiting, TaskStatus::Blocked] {
        for dependent in conn_dependents_with_status(conn, task_id, from)? {
            if conn_incomplete_dependency_count(conn, dependent.id)? != 0 {
                continue;
            }
            let reason = format!("All dependencies met (triggered by task {task_id})");
            conn_insert_history(
                conn,
                dependent.id,
                from,
                TaskStatus::Ready,
                "system",
                Some(&reason),
                None,
                now,
            )?;
            conn_set_status(conn, dependent.id, TaskStatus::Ready, now)?;
            cascades.push(CascadedTransition {
                task_id: dependent.id,
                project_id: dependent.project_id,
                from,
                to: TaskStatus::Ready,
                reason,
            });
        }
    }
    Ok(cascades)
}

/// Mark every waiting dependent of a rejected task as blocked.
fn conn_block_dependents(
    conn: &Connection,
    task_id: Uuid,
    now: &str,
) -> Result<Vec<CascadedTransition>> {
    let mut cascades = Vec::new();
    for dependent in conn_dependents_with_status(conn, task_id, TaskStatus::Waiting)? {
        let reason = format!("Dependency rejected (task {task_id})");
        conn_insert_history(
            conn,
            dependent.id,
            TaskStatus::Waiting,
            TaskStatus::Blocked,
            "system",
            Some(&reason),
            None,
            now,
        )?;
        conn_set_status(conn, dependent.id, TaskStatus::Blocked, now)?;
        cascades.push(CascadedTransition {
            task_id: dependent.id,
            project_id: dependent.project_id,
            from: TaskStatus::Waiting,
            to: TaskStatus::Blocked,
            reason,
        });
    }
    Ok(cascades)
}

fn extra_uuid(extra: Option<&serde_json::Value>, key: &str) -> Option<Uuid> {
    extra?
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn extra_str(extra: Option<&serde_json::Value>, key: &str) -> Option<String> {
    extra?
        .get(key)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
}

// ── Db impl ──────────────────────────────────────────────────────────────

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────────────────

    pub fn insert_project(&self, name: &str, description: &str, repo_path: &str) -> Result<Project> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO projects (id, name, description, repo_path, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'design', ?5, ?5)",
            params![id.to_string(), name, description, repo_path, now.to_rfc3339()],
        )
        .context("insert_project")?;
        Ok(Project {
            id,
            name: name.to_string(),
            description: description.to_string(),
            repo_path: repo_path.to_string(),
            status: ProjectStatus::Design,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, name, description, repo_path, status, created_at, updated_at \
             FROM projects WHERE id = ?1",
            params![id.to_string()],
            row_to_project,
        )
        .optional()
        .context("get_project")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, name, description, repo_path, status, created_at, updated_at \
             FROM projects ORDER BY created_at ASC, id ASC",
        )?;
        let projects = stmt
            .query_map([], row_to_project)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_projects")?;
        Ok(projects)
    }

    pub fn set_project_status(&self, id: Uuid, status: ProjectStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let status = match status {
            ProjectStatus::Design => "design",
            ProjectStatus::Active => "active",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Completed => "completed",
        };
        conn.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, Utc::now().to_rfc3339(), id.to_string()],
        )
        .context("set_project_status")?;
        Ok(())
    }

    // ── Phases ───────────────────────────────────────────────────────────

    pub fn insert_phase(
        &self,
        project_id: Uuid,
        name: &str,
        description: Option<&str>,
        branch_name: &str,
        order_index: i64,
    ) -> Result<Phase> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO phases (id, project_id, name, description, branch_name, order_index, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                id.to_string(),
                project_id.to_string(),
                name,
                description,
                branch_name,
                order_index,
                now.to_rfc3339(),
            ],
        )
        .context("insert_phase")?;
        Ok(Phase {
            id,
            project_id,
            name: name.to_string(),
            description: description.map(ToString::to_string),
            branch_name: branch_name.to_string(),
            order_index,
            status: PhaseStatus::Pending,
            created_at: now,
        })
    }

    pub fn list_phases(&self, project_id: Uuid) -> Result<Vec<Phase>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, project_id, name, description, branch_name, order_index, status, created_at \
             FROM phases WHERE project_id = ?1 ORDER BY order_index ASC",
        )?;
        let phases = stmt
            .query_map(params![project_id.to_string()], row_to_phase)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_phases")?;
        Ok(phases)
    }

    pub fn get_phase(&self, id: Uuid) -> Result<Option<Phase>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, project_id, name, description, branch_name, order_index, status, created_at \
             FROM phases WHERE id = ?1",
            params![id.to_string()],
            row_to_phase,
        )
        .optional()
        .context("get_phase")
    }

    // ── Task creation / reads ────────────────────────────────────────────

    /// Create a task. Dependencies are validated for existence and the
    /// proposed edges are cycle-checked before anything is persisted.
    pub fn create_task(&self, new: &NewTask) -> Result<Task, TaskError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        let id = Uuid::new_v4();
        if !new.depends_on.is_empty() {
            let missing = validate_dependencies_exist_inner(&conn, &new.depends_on)
                .map_err(TaskError::Storage)?;
            if !missing.is_empty() {
                return Err(TaskError::DependencyNotFound(missing));
            }
            if detect_cycle_inner(&conn, id, &new.depends_on).map_err(TaskError::Storage)? {
                return Err(TaskError::CircularDependency);
            }
        }

        let status = if new.depends_on.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Waiting
        };
        let now = Utc::now().to_rfc3339();

        let tx = conn.transaction().context("begin create_task").map_err(TaskError::Storage)?;
        tx.execute(
            "INSERT INTO tasks (id, project_id, phase_id, title, description, status, priority, \
             worker_prompt, qa_prompt, branch_name, version, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11)",
            params![
                id.to_string(),
                new.project_id.to_string(),
                new.phase_id.to_string(),
                new.title,
                new.description,
                status.as_str(),
                new.priority.as_str(),
                new.worker_prompt,
                new.qa_prompt,
                new.branch_name,
                now,
            ],
        )
        .context("insert_task")
        .map_err(TaskError::Storage)?;

        for dep in &new.depends_on {
            tx.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, dependency_id) VALUES (?1, ?2)",
                params![id.to_string(), dep.to_string()],
            )
            .context("insert_dependency")
            .map_err(TaskError::Storage)?;
        }

        // A dependency-free task skips straight through waiting; the ledger
        // records that passage so every status it ever held is traceable.
        if status == TaskStatus::Ready {
            conn_insert_history(
                &tx,
                id,
                TaskStatus::Waiting,
                TaskStatus::Ready,
                "system",
                Some("No dependencies at creation"),
                None,
                &now,
            )
            .map_err(TaskError::Storage)?;
        }

        let task = conn_get_task(&tx, id)
            .map_err(TaskError::Storage)?
            .ok_or(TaskError::NotFound)?;
        tx.commit().context("commit create_task").map_err(TaskError::Storage)?;
        Ok(task)
    }

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn_get_task(&conn, id)
    }

    pub fn list_by_project(
        &self,
        project_id: Uuid,
        status: Option<TaskStatus>,
        phase_id: Option<Uuid>,
        priority: Option<TaskPriority>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE project_id = ?1 \
             AND (?2 IS NULL OR status = ?2) \
             AND (?3 IS NULL OR phase_id = ?3) \
             AND (?4 IS NULL OR priority = ?4) \
             ORDER BY created_at DESC, id DESC LIMIT ?5 OFFSET ?6"
        ))?;
        let mut tasks = stmt
            .query_map(
                params![
                    project_id.to_string(),
                    status.map(TaskStatus::as_str),
                    phase_id.map(|p| p.to_string()),
                    priority.map(TaskPriority::as_str),
                    limit,
                    offset,
                ],
                row_to_task,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_by_project")?;
        for task in &mut tasks {
            task.depends_on = conn_dependency_ids(&conn, task.id)?;
        }
        Ok(tasks)
    }

    /// All `ready` tasks for a project, critical first, then oldest first.
    /// The tie-break is stable.
    pub fn list_ready_by_priority(&self, project_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE project_id = ?1 AND status = 'ready' \
             ORDER BY CASE priority \
                 WHEN 'critical' THEN 0 \
                 WHEN 'high' THEN 1 \
                 WHEN 'medium' THEN 2 \
                 ELSE 3 END, \
               created_at ASC, id ASC"
        ))?;
        let tasks = stmt
            .query_map(params![project_id.to_string()], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_ready_by_priority")?;
        Ok(tasks)
    }

    pub fn count_by_status(&self, project_id: Uuid) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM tasks WHERE project_id = ?1 GROUP BY status",
        )?;
        let rows = stmt
            .query_map(params![project_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("count_by_status")?;
        Ok(rows.into_iter().collect())
    }

    // ── Dependency queries ───────────────────────────────────────────────

    /// Return the subset of `ids` that do not exist.
    pub fn validate_dependencies_exist(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        validate_dependencies_exist_inner(&conn, ids)
    }

    /// Would adding `depends_on` edges to `new_task_id` close a cycle?
    /// Iterative DFS over the stored adjacency list.
    pub fn detect_cycle(&self, new_task_id: Uuid, depends_on: &[Uuid]) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        detect_cycle_inner(&conn, new_task_id, depends_on)
    }

    pub fn dependency_ids(&self, task_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn_dependency_ids(&conn, task_id)
    }

    /// True iff every dependency of the task has status `done`.
    pub fn check_dependencies_met(&self, task_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(conn_incomplete_dependency_count(&conn, task_id)? == 0)
    }

    pub fn find_waiting_dependents(&self, task_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn_dependents_with_status(&conn, task_id, TaskStatus::Waiting)
    }

    pub fn find_blocked_dependents(&self, task_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn_dependents_with_status(&conn, task_id, TaskStatus::Blocked)
    }

    // ── History ──────────────────────────────────────────────────────────

    pub fn list_history(&self, task_id: Uuid) -> Result<Vec<TaskHistory>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, task_id, from_status, to_status, actor, reason, extra, timestamp \
             FROM task_history WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let history = stmt
            .query_map(params![task_id.to_string()], row_to_history)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_history")?;
        Ok(history)
    }

    // ── Field updates ────────────────────────────────────────────────────

    /// Update editable fields. Allowed only while the task is `waiting` or
    /// `ready`; checks the optimistic version when supplied.
    pub fn update_task_fields(
        &self,
        task_id: Uuid,
        update: &TaskFieldUpdate,
    ) -> Result<Task, TaskError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("begin update").map_err(TaskError::Storage)?;

        let task = conn_get_task(&tx, task_id)
            .map_err(TaskError::Storage)?
            .ok_or(TaskError::NotFound)?;

        if let Some(expected) = update.expected_version {
            if task.version != expected {
                return Err(TaskError::VersionConflict {
                    expected,
                    current: task.version,
                });
            }
        }
        if !matches!(task.status, TaskStatus::Waiting | TaskStatus::Ready) {
            return Err(TaskError::NotUpdatable);
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE tasks SET \
               title = COALESCE(?1, title), \
               description = COALESCE(?2, description), \
               priority = COALESCE(?3, priority), \
               worker_prompt = COALESCE(?4, worker_prompt), \
               qa_prompt = COALESCE(?5, qa_prompt), \
               version = version + 1, \
               updated_at = ?6 \
             WHERE id = ?7",
            params![
                update.title,
                update.description,
                update.priority.map(TaskPriority::as_str),
                update.worker_prompt,
                update.qa_prompt,
                now,
                task_id.to_string(),
            ],
        )
        .context("update_task_fields")
        .map_err(TaskError::Storage)?;

        let updated = conn_get_task(&tx, task_id)
            .map_err(TaskError::Storage)?
            .ok_or(TaskError::NotFound)?;
        tx.commit().context("commit update").map_err(TaskError::Storage)?;
        Ok(updated)
    }

    // ── Transition application ───────────────────────────────────────────

    /// Apply a validated state transition atomically: optimistic version
    /// check, transition-table check, history row, status/version bump,
    /// record-level effects for the target state, and dependency cascades.
    /// History and status always commit together or not at all.
    pub fn apply_transition(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        reason: Option<&str>,
        actor: &str,
        extra: Option<&serde_json::Value>,
        expected_version: Option<i64>,
    ) -> Result<TransitionOutcome, TaskError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("begin transition").map_err(TaskError::Storage)?;

        let task = conn_get_task(&tx, task_id)
            .map_err(TaskError::Storage)?
            .ok_or(TaskError::NotFound)?;
        let from = task.status;

        if let Some(expected) = expected_version {
            if task.version != expected {
                return Err(TaskError::VersionConflict {
                    expected,
                    current: task.version,
                });
            }
        }
        if !from.can_transition(to) {
            return Err(TaskError::InvalidTransition { from, to });
        }
        // The reviewer must differ from the executing worker. Callers can
        // supply reviewer_id directly (manual transition endpoint), so the
        // check runs here, on every path, not just in the scheduler.
        if to == TaskStatus::Review {
            let reviewer = extra_uuid(extra, "reviewer_id").or(task.reviewer_id);
            if let (Some(reviewer), Some(worker)) = (reviewer, task.worker_id) {
                if reviewer == worker {
                    return Err(TaskError::ReviewerIsExecutor { worker_id: worker });
                }
            }
        }

        let now = Utc::now();
        let now_str = now.to_rfc3339();

        conn_insert_history(&tx, task_id, from, to, actor, reason, extra, &now_str)
            .map_err(TaskError::Storage)?;
        conn_set_status(&tx, task_id, to, &now_str).map_err(TaskError::Storage)?;

        let mut cascades = Vec::new();
        match to {
            TaskStatus::InProgress => {
                tx.execute(
                    "UPDATE tasks SET worker_id = COALESCE(?1, worker_id), started_at = ?2 WHERE id = ?3",
                    params![
                        extra_uuid(extra, "worker_id").map(|u| u.to_string()),
                        now_str,
                        task_id.to_string(),
                    ],
                )
                .context("stamp in_progress")
                .map_err(TaskError::Storage)?;
            }
            TaskStatus::Review => {
                tx.execute(
                    "UPDATE tasks SET reviewer_id = COALESCE(?1, reviewer_id), \
                     output_path = COALESCE(?2, output_path) WHERE id = ?3",
                    params![
                        extra_uuid(extra, "reviewer_id").map(|u| u.to_string()),
                        extra_str(extra, "output_path"),
                        task_id.to_string(),
                    ],
                )
                .context("stamp reviewer")
                .map_err(TaskError::Storage)?;
            }
            TaskStatus::Done => {
                tx.execute(
                    "UPDATE tasks SET completed_at = ?1, \
                     qa_result = COALESCE(?2, qa_result) WHERE id = ?3",
                    params![now_str, extra_str(extra, "qa_result"), task_id.to_string()],
                )
                .context("stamp completed_at")
                .map_err(TaskError::Storage)?;
                cascades = conn_promote_dependents(&tx, task_id, &now_str)
                    .map_err(TaskError::Storage)?;
            }
            TaskStatus::Rejected => {
                tx.execute(
                    "UPDATE tasks SET error_message = ?1, \
                     qa_result = COALESCE(?2, qa_result) WHERE id = ?3",
                    params![reason, extra_str(extra, "qa_result"), task_id.to_string()],
                )
                .context("stamp error_message")
                .map_err(TaskError::Storage)?;
                cascades = conn_block_dependents(&tx, task_id, &now_str)
                    .map_err(TaskError::Storage)?;
            }
            _ => {}
        }

        let updated = conn_get_task(&tx, task_id)
            .map_err(TaskError::Storage)?
            .ok_or(TaskError::NotFound)?;
        tx.commit().context("commit transition").map_err(TaskError::Storage)?;

        Ok(TransitionOutcome {
            task: updated,
            from,
            cascades,
        })
    }

    /// Record or clear the commit hash after a git side effect. Counts as a
    /// mutation, so the version advances.
    pub fn set_commit_hash(&self, task_id: Uuid, hash: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE tasks SET commit_hash = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3",
            params![hash, Utc::now().to_rfc3339(), task_id.to_string()],
        )
        .context("set_commit_hash")?;
        Ok(())
    }

    // ── Registration tokens ──────────────────────────────────────────────

    pub fn create_registration_token(
        &self,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<RegistrationToken> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = hex::encode(token_bytes);
        let id = Uuid::new_v4();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO registration_tokens (id, token, name, created_at, expires_at, revoked) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                id.to_string(),
                token,
                name,
                now.to_rfc3339(),
                expires_at.map(|e| e.to_rfc3339()),
            ],
        )
        .context("create_registration_token")?;
        Ok(RegistrationToken {
            id,
            token,
            name: name.to_string(),
            created_at: now,
            expires_at,
            revoked: false,
        })
    }

    pub fn find_registration_token(&self, token: &str) -> Result<Option<RegistrationToken>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, token, name, created_at, expires_at, revoked \
             FROM registration_tokens WHERE token = ?1",
            params![token],
            row_to_registration_token,
        )
        .optional()
        .context("find_registration_token")
    }

    pub fn list_registration_tokens(&self) -> Result<Vec<RegistrationToken>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, token, name, created_at, expires_at, revoked \
             FROM registration_tokens ORDER BY created_at ASC, id ASC",
        )?;
        let tokens = stmt
            .query_map([], row_to_registration_token)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_registration_tokens")?;
        Ok(tokens)
    }

    /// Returns true when a row was revoked.
    pub fn revoke_registration_token(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE registration_tokens SET revoked = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .context("revoke_registration_token")?;
        Ok(n > 0)
    }

    /// True when the token exists, is not revoked and has not expired.
    pub fn registration_token_valid(&self, token: &str) -> Result<bool> {
        let Some(row) = self.find_registration_token(token)? else {
            return Ok(false);
        };
        if row.revoked {
            return Ok(false);
        }
        if let Some(expires) = row.expires_at {
            if expires <= Utc::now() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn validate_dependencies_exist_inner(conn: &Connection, ids: &[Uuid]) -> Result<Vec<Uuid>> {
    let mut missing = Vec::new();
    for id in ids {
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()
            .context("validate_dependencies_exist")?;
        if found.is_none() {
            missing.push(*id);
        }
    }
    Ok(missing)
}

fn detect_cycle_inner(conn: &Connection, new_task_id: Uuid, depends_on: &[Uuid]) -> Result<bool> {
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut stack: Vec<Uuid> = depends_on.to_vec();
    while let Some(current) = stack.pop() {
        if current == new_task_id {
            return Ok(true);
        }
        if !visited.insert(current) {
            continue;
        }
        stack.extend(conn_dependency_ids(conn, current)?);
    }
    Ok(false)
}
