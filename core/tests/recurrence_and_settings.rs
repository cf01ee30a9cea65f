//! Standalone tests for the recurrence algorithm and the settings
//! model-resolution chain, independent of the transport layer.

use chrono::{Datelike, NaiveDateTime};
use mist_core::config::Paths;
use mist_core::storage::events::{expand_recurrence, Frequency};
use mist_core::storage::Storage;

fn dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

#[test]
fn weekly_recurrence_yields_occurrences_one_week_apart() {
    let start = dt("2026-01-05 09:00:00");
    let window_end = dt("2026-02-05 09:00:00");
    let occurrences = expand_recurrence(start, None, Frequency::Weekly, 1, None, start, window_end);

    assert!(occurrences.len() >= 4);
    for pair in occurrences.windows(2) {
        let gap = pair[1].0 - pair[0].0;
        assert_eq!(gap, chrono::Duration::days(7));
    }
}

#[test]
fn monthly_recurrence_respects_interval_and_cap() {
    let start = dt("2026-01-31 08:00:00");
    let window_end = dt("2027-01-31 08:00:00");
    let occurrences = expand_recurrence(start, None, Frequency::Monthly, 2, None, start, window_end);

    // every other month from Jan 31: Jan, Mar, May, Jul, Sep, Nov, Jan
    assert_eq!(occurrences.len(), 7);
    assert_eq!(occurrences[1].0.month(), 3);
}

#[test]
fn recurrence_stops_at_explicit_end_date() {
    let start = dt("2026-01-01 10:00:00");
    let rec_end = dt("2026-01-15 10:00:00");
    let window_end = dt("2026-03-01 10:00:00");
    let occurrences = expand_recurrence(start, None, Frequency::Daily, 1, Some(rec_end), start, window_end);
    assert_eq!(occurrences.len(), 15);
    let _ = occurrences[0].0.year();
}

#[test]
fn settings_model_resolution_prefers_command_override() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path());
    let storage = Storage::open_in_memory(&paths).unwrap();
    {
        let mut settings = storage.settings.lock().unwrap();
        settings.set("model", serde_json::json!("llama3")).unwrap();
        settings.set("model_reflect", serde_json::json!("gemma3:27b")).unwrap();
    }
    let settings = storage.settings.lock().unwrap();
    assert_eq!(settings.get_model(Some("reflect")), "gemma3:27b");
    assert_eq!(settings.get_model(Some("chat")), "llama3");
    assert_eq!(settings.get_model(None), "llama3");
}
