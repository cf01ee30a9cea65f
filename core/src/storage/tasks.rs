//! Task store: CRUD plus upcoming-window queries.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Done,
    Cancelled,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> TaskStatus {
        match s {
            "done" => TaskStatus::Done,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Todo,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub status: TaskStatus,
    pub due_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct TaskStore<'a> {
    db: &'a Database,
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

impl<'a> TaskStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        TaskStore { db }
    }

    /// Lowest positive integer not currently assigned to an active
    /// (`todo`) task.
    fn next_id(&self) -> Result<i64> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT id FROM tasks WHERE status = 'todo' ORDER BY id")?;
        let used: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        let mut candidate = 1i64;
        for id in used {
            if id == candidate {
                candidate += 1;
            } else if id > candidate {
                break;
            }
        }
        Ok(candidate)
    }

    pub fn create(&self, title: &str, due_date: Option<&str>) -> Result<i64> {
        let id = self.next_id()?;
        let now = now_iso();
        let conn = self.db.lock();
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        conn.execute(
            "INSERT INTO tasks (id, title, status, due_date, created_at, updated_at)
             VALUES (?1, ?2, 'todo', ?3, ?4, ?4)",
            params![id, title, due_date, now],
        )?;
        Ok(id)
    }

    pub fn list(&self, include_done: bool) -> Result<Vec<Task>> {
        let conn = self.db.lock();
        let sql = if include_done {
            "SELECT id, title, status, due_date, created_at, updated_at FROM tasks
             ORDER BY due_date IS NULL, due_date, id"
        } else {
            "SELECT id, title, status, due_date, created_at, updated_at FROM tasks
             WHERE status = 'todo'
             ORDER BY due_date IS NULL, due_date, id"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| row_to_task(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, title, status, due_date, created_at, updated_at FROM tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update(
        &self,
        id: i64,
        title: Option<&str>,
        status: Option<TaskStatus>,
        due_date: Option<Option<&str>>,
    ) -> Result<bool> {
        let conn = self.db.lock();
        let mut sets = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(t) = title {
            sets.push("title = ?");
            values.push(Box::new(t.to_string()));
        }
        if let Some(s) = status {
            sets.push("status = ?");
            values.push(Box::new(s.as_str().to_string()));
        }
        if let Some(d) = due_date {
            sets.push("due_date = ?");
            values.push(Box::new(d.map(|s| s.to_string())));
        }
        if sets.is_empty() {
            return Ok(self.get_conn(&conn, id)?.is_some());
        }
        sets.push("updated_at = ?");
        values.push(Box::new(now_iso()));

        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id));
        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let affected = conn.execute(&sql, params.as_slice())?;
        Ok(affected > 0)
    }

    fn get_conn(&self, conn: &rusqlite::Connection, id: i64) -> Result<Option<Task>> {
        conn.query_row(
            "SELECT id, title, status, due_date, created_at, updated_at FROM tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.db.lock();
        let affected = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Open tasks due within `days` days, plus undated ones. Already
    /// overdue tasks are included; there is no lower bound on due date.
    pub fn get_upcoming(&self, days: i64, limit: i64) -> Result<Vec<Task>> {
        let cutoff = (Utc::now() + chrono::Duration::days(days))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, status, due_date, created_at, updated_at FROM tasks
             WHERE status = 'todo' AND (due_date IS NULL OR due_date <= ?1)
             ORDER BY due_date IS NULL, due_date, id
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![cutoff, limit], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status: String = row.get(2)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        status: TaskStatus::parse(&status),
        due_date: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_lowest_unused_id() {
        let db = Database::open_in_memory().unwrap();
        let store = TaskStore::new(&db);
        let a = store.create("Buy milk", None).unwrap();
        let b = store.create("Buy eggs", None).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        store.update(a, None, Some(TaskStatus::Done), None).unwrap();
        let c = store.create("Buy bread", None).unwrap();
        assert_eq!(c, 1);
    }

    #[test]
    fn list_orders_by_due_date_then_id() {
        let db = Database::open_in_memory().unwrap();
        let store = TaskStore::new(&db);
        store.create("No due date", None).unwrap();
        store.create("Due later", Some("2099-01-02")).unwrap();
        store.create("Due sooner", Some("2099-01-01")).unwrap();
        let tasks = store.list(false).unwrap();
        assert_eq!(tasks[0].title, "Due sooner");
        assert_eq!(tasks[1].title, "Due later");
        assert_eq!(tasks[2].title, "No due date");
    }

    #[test]
    fn update_and_delete_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let store = TaskStore::new(&db);
        let id = store.create("Task", None).unwrap();
        assert!(store.update(id, Some("Renamed"), None, None).unwrap());
        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.title, "Renamed");
        assert!(store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
    }
}
