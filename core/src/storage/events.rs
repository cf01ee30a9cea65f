//! Event store: CRUD plus recurrence expansion for upcoming-window
//! queries.

use chrono::{Datelike, Duration, NaiveDateTime};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    fn as_str(self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        }
    }

    fn parse(s: &str) -> Option<Frequency> {
        match s {
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            "yearly" => Some(Frequency::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: i64,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub recurrence: Option<RecurrenceRule>,
    pub created_at: String,
    pub updated_at: String,
}

/// One concrete occurrence of an event within a query window.
#[derive(Debug, Clone, Serialize)]
pub struct Occurrence {
    pub event_id: i64,
    pub title: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub frequency: Option<String>,
}

pub struct EventStore<'a> {
    db: &'a Database,
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Parse a timestamp accepting both `HH:MM` and `HH:MM:SS` time parts.
fn parse_dt(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .ok()
}

fn fmt_dt(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next =
        chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid month");
    let first_of_this = chrono::NaiveDate::from_ymd_opt(year, month, 1).expect("valid month");
    (first_of_next - first_of_this).num_days() as u32
}

/// Add `months` months to `dt`, clamping the day to the last valid day
/// of the resulting month.
fn add_months(dt: NaiveDateTime, months: i64) -> NaiveDateTime {
    let total = dt.month0() as i64 + months;
    let year = dt.year() + total.div_euclid(12) as i32;
    let month = (total.rem_euclid(12)) as u32 + 1;
    let day = dt.day().min(days_in_month(year, month));
    let date = chrono::NaiveDate::from_ymd_opt(year, month, day).expect("clamped day is valid");
    date.and_time(dt.time())
}

fn advance(dt: NaiveDateTime, frequency: Frequency, interval: i64) -> NaiveDateTime {
    match frequency {
        Frequency::Daily => dt + Duration::days(interval),
        Frequency::Weekly => dt + Duration::weeks(interval),
        Frequency::Monthly => add_months(dt, interval),
        Frequency::Yearly => add_months(dt, 12 * interval),
    }
}

/// Expand a recurring event's occurrences within `[window_start,
/// window_end]`, hard-capped at 1000 iterations.
pub fn expand_recurrence(
    start: NaiveDateTime,
    end: Option<NaiveDateTime>,
    frequency: Frequency,
    interval: i64,
    rec_end: Option<NaiveDateTime>,
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
) -> Vec<(NaiveDateTime, Option<NaiveDateTime>)> {
    let duration = end.map(|e| e - start);
    let mut current = start;
    let mut out = Vec::new();

    for _ in 0..1000 {
        if let Some(re) = rec_end {
            if current > re {
                break;
            }
        }
        if current > window_end {
            break;
        }
        if current >= window_start && current <= window_end {
            out.push((current, duration.map(|d| current + d)));
        }
        current = advance(current, frequency, interval);
    }
    out
}

impl<'a> EventStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        EventStore { db }
    }

    fn next_id(&self) -> Result<i64> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT id FROM events ORDER BY id")?;
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

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        title: &str,
        start_time: &str,
        end_time: Option<&str>,
        location: Option<&str>,
        notes: Option<&str>,
        frequency: Option<Frequency>,
        interval: i64,
        end_date: Option<&str>,
    ) -> Result<i64> {
        let id = self.next_id()?;
        let now = now_iso();
        let conn = self.db.lock();
        conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        conn.execute(
            "INSERT INTO events (id, title, start_time, end_time, location, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![id, title, start_time, end_time, location, notes, now],
        )?;
        if let Some(freq) = frequency {
            conn.execute(
                "INSERT INTO recurrence_rules (event_id, frequency, interval, end_date)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, freq.as_str(), interval.max(1), end_date],
            )?;
        }
        Ok(id)
    }

    pub fn list(&self) -> Result<Vec<Event>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.title, e.start_time, e.end_time, e.location, e.notes,
                    e.created_at, e.updated_at, r.frequency, r.interval, r.end_date
             FROM events e LEFT JOIN recurrence_rules r ON r.event_id = e.id
             ORDER BY e.start_time, e.id",
        )?;
        let rows = stmt
            .query_map([], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get(&self, id: i64) -> Result<Option<Event>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT e.id, e.title, e.start_time, e.end_time, e.location, e.notes,
                    e.created_at, e.updated_at, r.frequency, r.interval, r.end_date
             FROM events e LEFT JOIN recurrence_rules r ON r.event_id = e.id
             WHERE e.id = ?1",
            params![id],
            row_to_event,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update(
        &self,
        id: i64,
        title: Option<&str>,
        start_time: Option<&str>,
        end_time: Option<Option<&str>>,
        location: Option<Option<&str>>,
        notes: Option<Option<&str>>,
    ) -> Result<bool> {
        let conn = self.db.lock();
        let mut sets = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(t) = title {
            sets.push("title = ?");
            values.push(Box::new(t.to_string()));
        }
        if let Some(s) = start_time {
            sets.push("start_time = ?");
            values.push(Box::new(s.to_string()));
        }
        if let Some(e) = end_time {
            sets.push("end_time = ?");
            values.push(Box::new(e.map(|s| s.to_string())));
        }
        if let Some(l) = location {
            sets.push("location = ?");
            values.push(Box::new(l.map(|s| s.to_string())));
        }
        if let Some(n) = notes {
            sets.push("notes = ?");
            values.push(Box::new(n.map(|s| s.to_string())));
        }
        if sets.is_empty() {
            let exists: bool = conn
                .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |_| Ok(true))
                .optional()?
                .unwrap_or(false);
            return Ok(exists);
        }
        sets.push("updated_at = ?");
        values.push(Box::new(now_iso()));
        let sql = format!("UPDATE events SET {} WHERE id = ?", sets.join(", "));
        values.push(Box::new(id));
        let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let affected = conn.execute(&sql, params.as_slice())?;
        Ok(affected > 0)
    }

    /// Deletion cascades to the recurrence rule via `ON DELETE CASCADE`.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.db.lock();
        let affected = conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn get_upcoming(&self, days: i64, limit: i64) -> Result<Vec<Occurrence>> {
        let events = self.list()?;
        let window_start = chrono::Utc::now().naive_utc();
        let window_end = window_start + Duration::days(days);

        let mut occurrences = Vec::new();
        for event in events {
            let Some(start) = parse_dt(&event.start_time) else { continue };
            let end = event.end_time.as_deref().and_then(parse_dt);

            if let Some(rule) = &event.recurrence {
                let rec_end = rule.end_date.as_deref().and_then(parse_dt);
                for (occ_start, occ_end) in expand_recurrence(
                    start,
                    end,
                    rule.frequency,
                    rule.interval,
                    rec_end,
                    window_start,
                    window_end,
                ) {
                    occurrences.push(Occurrence {
                        event_id: event.id,
                        title: event.title.clone(),
                        start_time: fmt_dt(occ_start),
                        end_time: occ_end.map(fmt_dt),
                        frequency: Some(rule.frequency.as_str().to_string()),
                    });
                }
            } else if start >= window_start && start <= window_end {
                occurrences.push(Occurrence {
                    event_id: event.id,
                    title: event.title.clone(),
                    start_time: fmt_dt(start),
                    end_time: end.map(fmt_dt),
                    frequency: None,
                });
            }
        }

        occurrences.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        occurrences.truncate(limit.max(0) as usize);
        Ok(occurrences)
    }
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let frequency: Option<String> = row.get(8)?;
    let recurrence = frequency.and_then(|f| Frequency::parse(&f)).map(|frequency| RecurrenceRule {
        frequency,
        interval: row.get(9).unwrap_or(1),
        end_date: row.get(10).unwrap_or(None),
    });
    Ok(Event {
        id: row.get(0)?,
        title: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        location: row.get(4)?,
        notes: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        recurrence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekly_recurrence_emits_expected_gap() {
        let db = Database::open_in_memory().unwrap();
        let store = EventStore::new(&db);
        store
            .create(
                "Standup",
                "2024-06-03T09:00:00",
                None,
                None,
                None,
                Some(Frequency::Weekly),
                1,
                None,
            )
            .unwrap();

        let start = parse_dt("2024-06-03T09:00:00").unwrap();
        let occurrences = expand_recurrence(
            start,
            None,
            Frequency::Weekly,
            1,
            None,
            start,
            start + Duration::days(30),
        );
        assert!(occurrences.len() >= 4);
        let gap = occurrences[1].0 - occurrences[0].0;
        assert_eq!(gap, Duration::weeks(1));
    }

    #[test]
    fn monthly_recurrence_clamps_day_of_month() {
        let start = parse_dt("2024-01-31T10:00:00").unwrap();
        let occurrences = expand_recurrence(
            start,
            None,
            Frequency::Monthly,
            1,
            None,
            start,
            start + Duration::days(100),
        );
        // Jan 31 -> Feb 29 (2024 is a leap year) -> Mar 31
        assert_eq!(occurrences[1].0.day(), 29);
        assert_eq!(occurrences[1].0.month(), 2);
    }

    #[test]
    fn non_recurring_event_emitted_only_within_window() {
        let db = Database::open_in_memory().unwrap();
        let store = EventStore::new(&db);
        let far_future = (chrono::Utc::now().naive_utc() + Duration::days(400))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        store
            .create("Future thing", &far_future, None, None, None, None, 1, None)
            .unwrap();
        let upcoming = store.get_upcoming(7, 10).unwrap();
        assert!(upcoming.is_empty());
    }

    #[test]
    fn delete_cascades_to_recurrence_rule() {
        let db = Database::open_in_memory().unwrap();
        let store = EventStore::new(&db);
        let id = store
            .create(
                "Weekly thing",
                "2024-06-03T09:00:00",
                None,
                None,
                None,
                Some(Frequency::Weekly),
                1,
                None,
            )
            .unwrap();
        store.delete(id).unwrap();
        let conn = db.lock();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM recurrence_rules WHERE event_id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
