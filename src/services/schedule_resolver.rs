use crate::error::CoreResult;
use crate::models::{LifecycleState, PlaylistItem, PluginInstance, Schedule};
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::collections::HashMap;

/// A playlist item with everything needed to decide whether it is on air.
#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub item: PlaylistItem,
    pub instance: PluginInstance,
    pub definition_active: bool,
    pub schedules: Vec<Schedule>,
}

/// Parse an IANA zone name. Empty or unknown names fall back to UTC.
pub fn parse_timezone(name: &str) -> Tz {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return chrono_tz::UTC;
    }
    match trimmed.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!("Invalid timezone '{}', falling back to UTC", trimmed);
            chrono_tz::UTC
        }
    }
}

/// Canonical zone name to persist for a user-supplied value.
pub fn normalize_timezone(name: &str) -> String {
    parse_timezone(name).name().to_string()
}

/// Accepts `HH:MM` or `HH:MM:SS` and returns `HH:MM:SS`.
pub fn normalize_time(value: &str) -> Option<String> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
        .map(|t| t.format("%H:%M:%S").to_string())
}

fn parse_wall_clock(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M:%S").ok()
}

/// True when `now` falls on one of the schedule's days and inside its
/// window, evaluated in the schedule's own timezone.
pub fn schedule_matches(schedule: &Schedule, now: DateTime<Utc>) -> bool {
    let tz = parse_timezone(&schedule.timezone);
    let local = now.with_timezone(&tz);

    let weekday_bit = 1 << local.weekday().num_days_from_sunday();
    if schedule.day_mask & weekday_bit == 0 {
        return false;
    }

    let (Some(start), Some(end)) = (
        parse_wall_clock(&schedule.start_time),
        parse_wall_clock(&schedule.end_time),
    ) else {
        tracing::warn!(
            "Schedule {} has malformed window {}-{}, skipping",
            schedule.id,
            schedule.start_time,
            schedule.end_time
        );
        return false;
    };

    // Second resolution, same as comparing HH:MM:SS strings.
    let Some(now_time) = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
    else {
        return false;
    };

    if end < start {
        // Window wraps past midnight.
        now_time >= start || now_time <= end
    } else {
        start <= now_time && now_time <= end
    }
}

/// An item with no active schedules is always on; otherwise any one
/// matching active schedule turns it on.
pub fn is_item_active(schedules: &[Schedule], now: DateTime<Utc>) -> bool {
    let mut active = schedules.iter().filter(|s| s.is_active).peekable();
    if active.peek().is_none() {
        return true;
    }
    active.any(|s| schedule_matches(s, now))
}

/// Eligible entries for `now`, in playlist order. Important items
/// suppress the normal rotation while any of them is active.
pub fn resolve_active(entries: Vec<PlaylistEntry>, now: DateTime<Utc>) -> Vec<PlaylistEntry> {
    let (important, normal): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .filter(|e| e.item.is_visible && e.definition_active && e.instance.is_servable())
        .filter(|e| is_item_active(&e.schedules, now))
        .partition(|e| e.item.importance);

    if important.is_empty() {
        normal
    } else {
        important
    }
}

/// Load the device's default playlist with instances and schedules,
/// ordered by `order_index`.
pub fn load_default_playlist(
    conn: &mut SqliteConnection,
    device_id: i32,
) -> CoreResult<Vec<PlaylistEntry>> {
    use crate::schema::{playlist_items, playlists, plugin_definitions, plugin_instances, schedules};

    let playlist_id: Option<i32> = playlists::table
        .filter(playlists::device_id.eq(device_id))
        .filter(playlists::is_default.eq(true))
        .select(playlists::id)
        .first(conn)
        .optional()?;

    let Some(playlist_id) = playlist_id else {
        return Ok(Vec::new());
    };

    let rows: Vec<(PlaylistItem, PluginInstance, String)> = playlist_items::table
        .inner_join(plugin_instances::table.inner_join(plugin_definitions::table))
        .filter(playlist_items::playlist_id.eq(playlist_id))
        .order(playlist_items::order_index.asc())
        .select((
            PlaylistItem::as_select(),
            PluginInstance::as_select(),
            plugin_definitions::lifecycle_state,
        ))
        .load(conn)?;

    let item_ids: Vec<i32> = rows.iter().map(|(item, _, _)| item.id).collect();
    let mut by_item: HashMap<i32, Vec<Schedule>> = HashMap::new();
    for schedule in schedules::table
        .filter(schedules::playlist_item_id.eq_any(&item_ids))
        .order(schedules::id.asc())
        .select(Schedule::as_select())
        .load::<Schedule>(conn)?
    {
        by_item
            .entry(schedule.playlist_item_id)
            .or_default()
            .push(schedule);
    }

    Ok(rows
        .into_iter()
        .map(|(item, instance, definition_state)| PlaylistEntry {
            schedules: by_item.remove(&item.id).unwrap_or_default(),
            definition_active: definition_state == LifecycleState::Active.as_str(),
            item,
            instance,
        })
        .collect())
}

/// ActiveItems(device, now).
pub fn active_items(
    conn: &mut SqliteConnection,
    device_id: i32,
    now: DateTime<Utc>,
) -> CoreResult<Vec<PlaylistEntry>> {
    let entries = load_default_playlist(conn, device_id)?;
    Ok(resolve_active(entries, now))
}

/// Devices whose currently active items include the instance.
pub fn reachable_device_ids(
    conn: &mut SqliteConnection,
    instance_id: i32,
    now: DateTime<Utc>,
) -> CoreResult<Vec<i32>> {
    use crate::schema::{playlist_items, playlists};

    let candidates: Vec<i32> = playlists::table
        .inner_join(playlist_items::table)
        .filter(playlists::is_default.eq(true))
        .filter(playlist_items::plugin_instance_id.eq(instance_id))
        .select(playlists::device_id)
        .distinct()
        .load(conn)?;

    let mut reachable = Vec::new();
    for device_id in candidates {
        let active = active_items(conn, device_id, now)?;
        if active.iter().any(|e| e.instance.id == instance_id) {
            reachable.push(device_id);
        }
    }
    Ok(reachable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn ts() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn schedule(day_mask: i32, start: &str, end: &str, tz: &str) -> Schedule {
        Schedule {
            id: 1,
            playlist_item_id: 1,
            name: String::new(),
            day_mask,
            start_time: start.to_string(),
            end_time: end.to_string(),
            timezone: tz.to_string(),
            is_active: true,
            created_at: ts(),
            updated_at: ts(),
        }
    }

    fn entry(id: i32, importance: bool, schedules: Vec<Schedule>) -> PlaylistEntry {
        PlaylistEntry {
            item: PlaylistItem {
                id,
                playlist_id: 1,
                plugin_instance_id: id,
                order_index: id,
                is_visible: true,
                importance,
                duration_override: None,
                created_at: ts(),
                updated_at: ts(),
            },
            instance: PluginInstance {
                id,
                definition_id: 1,
                name: format!("instance {}", id),
                settings: "{}".to_string(),
                refresh_interval: 900,
                needs_config_update: false,
                lifecycle_state: "active".to_string(),
                created_at: ts(),
                updated_at: ts(),
            },
            definition_active: true,
            schedules,
        }
    }

    // 2025-01-05 is a Sunday.
    fn utc(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, h, m, s).unwrap()
    }

    #[test]
    fn test_day_mask_against_every_weekday() {
        for weekday in 0..7u32 {
            let now = utc(5 + weekday, 12, 0, 0);
            for mask in 0..128i32 {
                let s = schedule(mask, "00:00:00", "23:59:59", "UTC");
                let expected = mask & (1 << weekday) != 0;
                assert_eq!(
                    schedule_matches(&s, now),
                    expected,
                    "mask {:07b} weekday {}",
                    mask,
                    weekday
                );
            }
        }
    }

    #[test]
    fn test_overnight_window() {
        let s = schedule(127, "22:00:00", "06:00:00", "UTC");
        assert!(schedule_matches(&s, utc(6, 23, 30, 0)));
        assert!(schedule_matches(&s, utc(6, 5, 0, 0)));
        assert!(!schedule_matches(&s, utc(6, 12, 0, 0)));
    }

    #[test]
    fn test_window_bounds_are_inclusive() {
        let s = schedule(127, "09:00:00", "17:00:00", "UTC");
        assert!(schedule_matches(&s, utc(6, 9, 0, 0)));
        assert!(schedule_matches(&s, utc(6, 17, 0, 0)));
        assert!(!schedule_matches(&s, utc(6, 17, 0, 1)));
        assert!(!schedule_matches(&s, utc(6, 8, 59, 59)));
    }

    #[test]
    fn test_schedule_evaluated_in_its_timezone() {
        // 03:00 UTC Monday is 22:00 Sunday in New York.
        let sunday_only = 1;
        let s = schedule(sunday_only, "21:00:00", "23:00:00", "America/New_York");
        assert!(schedule_matches(&s, utc(6, 3, 0, 0)));

        let in_utc = schedule(sunday_only, "21:00:00", "23:00:00", "UTC");
        assert!(!schedule_matches(&in_utc, utc(6, 3, 0, 0)));
    }

    #[test]
    fn test_invalid_timezone_degrades_to_utc() {
        let s = schedule(127, "10:00:00", "11:00:00", "Mars/Olympus_Mons");
        assert!(schedule_matches(&s, utc(6, 10, 30, 0)));
        assert_eq!(normalize_timezone(""), "UTC");
        assert_eq!(normalize_timezone(" Europe/Berlin "), "Europe/Berlin");
    }

    #[test]
    fn test_item_without_schedules_is_always_active() {
        let entries = vec![entry(1, false, vec![])];
        for hour in [0, 6, 12, 23] {
            assert_eq!(resolve_active(entries.clone(), utc(7, hour, 0, 0)).len(), 1);
        }
    }

    #[test]
    fn test_inactive_schedules_are_ignored() {
        let mut s = schedule(0, "00:00:00", "00:00:01", "UTC");
        s.is_active = false;
        let entries = vec![entry(1, false, vec![s])];
        assert_eq!(resolve_active(entries, utc(7, 12, 0, 0)).len(), 1);
    }

    #[test]
    fn test_any_matching_schedule_activates_item() {
        let morning = schedule(127, "06:00:00", "09:00:00", "UTC");
        let evening = schedule(127, "18:00:00", "21:00:00", "UTC");
        let entries = vec![entry(1, false, vec![morning, evening])];
        assert_eq!(resolve_active(entries.clone(), utc(7, 19, 0, 0)).len(), 1);
        assert!(resolve_active(entries, utc(7, 12, 0, 0)).is_empty());
    }

    #[test]
    fn test_importance_overrides_rotation() {
        let entries = vec![
            entry(1, false, vec![]),
            entry(2, true, vec![]),
            entry(3, false, vec![]),
            entry(4, false, vec![]),
        ];
        let active = resolve_active(entries, utc(7, 12, 0, 0));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].item.id, 2);
    }

    #[test]
    fn test_inactive_important_item_does_not_suppress() {
        let off_window = schedule(127, "01:00:00", "02:00:00", "UTC");
        let entries = vec![entry(1, false, vec![]), entry(2, true, vec![off_window])];
        let active = resolve_active(entries, utc(7, 12, 0, 0));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].item.id, 1);
    }

    #[test]
    fn test_needs_config_update_excluded_even_when_scheduled() {
        let mut e = entry(1, false, vec![schedule(127, "00:00:00", "23:59:59", "UTC")]);
        e.instance.needs_config_update = true;
        assert!(resolve_active(vec![e], utc(7, 12, 0, 0)).is_empty());
    }

    #[test]
    fn test_hidden_and_deactivated_items_excluded() {
        let mut hidden = entry(1, false, vec![]);
        hidden.item.is_visible = false;
        let mut deactivated = entry(2, false, vec![]);
        deactivated.instance.lifecycle_state = "deactivated".to_string();
        let mut orphaned_definition = entry(3, false, vec![]);
        orphaned_definition.definition_active = false;
        let kept = entry(4, false, vec![]);

        let active = resolve_active(
            vec![hidden, deactivated, orphaned_definition, kept],
            utc(7, 12, 0, 0),
        );
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].item.id, 4);
    }

    #[test]
    fn test_order_is_preserved() {
        let entries = vec![entry(1, false, vec![]), entry(2, false, vec![]), entry(3, false, vec![])];
        let ids: Vec<i32> = resolve_active(entries, utc(7, 12, 0, 0))
            .iter()
            .map(|e| e.item.order_index)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_normalize_time() {
        assert_eq!(normalize_time("7:05").as_deref(), Some("07:05:00"));
        assert_eq!(normalize_time("22:00:30").as_deref(), Some("22:00:30"));
        assert_eq!(normalize_time("25:00"), None);
        assert_eq!(normalize_time("noon"), None);
    }
}
