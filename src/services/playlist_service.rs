use crate::error::{CoreError, CoreResult};
use crate::models::{NewPlaylist, NewPlaylistItem, NewSchedule, Playlist, PlaylistItem, Schedule};
use crate::services::schedule_resolver::{normalize_time, normalize_timezone};
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Deserialize;

pub const ALL_DAYS: i32 = 0b111_1111;

#[derive(Debug, Clone, Deserialize)]
pub struct ItemOptions {
    pub plugin_instance_id: i32,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    #[serde(default)]
    pub importance: bool,
    pub duration_override: Option<i32>,
}

fn default_visible() -> bool {
    true
}

impl ItemOptions {
    pub fn for_instance(plugin_instance_id: i32) -> Self {
        Self {
            plugin_instance_id,
            is_visible: true,
            importance: false,
            duration_override: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleInput {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_day_mask")]
    pub day_mask: i32,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default = "default_visible")]
    pub is_active: bool,
}

fn default_day_mask() -> i32 {
    ALL_DAYS
}

/// Return the device's default playlist, creating it if missing.
pub fn ensure_default_playlist(conn: &mut SqliteConnection, device: i32) -> CoreResult<Playlist> {
    use crate::schema::playlists::dsl::*;

    let existing = playlists
        .filter(device_id.eq(device))
        .filter(is_default.eq(true))
        .select(Playlist::as_select())
        .first(conn)
        .optional()?;

    if let Some(playlist) = existing {
        return Ok(playlist);
    }

    Ok(diesel::insert_into(playlists)
        .values(&NewPlaylist {
            device_id: device,
            name: "Default".to_string(),
            is_default: true,
        })
        .returning(Playlist::as_select())
        .get_result(conn)?)
}

pub fn list_items(conn: &mut SqliteConnection, playlist: i32) -> CoreResult<Vec<PlaylistItem>> {
    use crate::schema::playlist_items::dsl::*;

    Ok(playlist_items
        .filter(playlist_id.eq(playlist))
        .order(order_index.asc())
        .select(PlaylistItem::as_select())
        .load(conn)?)
}

/// Append an item to the device's default playlist at position N+1.
pub fn add_item(
    conn: &mut SqliteConnection,
    device: i32,
    options: ItemOptions,
) -> CoreResult<PlaylistItem> {
    if let Some(d) = options.duration_override {
        if d <= 0 {
            return Err(CoreError::data("duration_override must be positive"));
        }
    }

    conn.immediate_transaction(|conn| {
        use crate::schema::playlist_items::dsl::*;

        let playlist = ensure_default_playlist(conn, device)?;
        let current_max: Option<i32> = playlist_items
            .filter(playlist_id.eq(playlist.id))
            .select(diesel::dsl::max(order_index))
            .first(conn)?;

        Ok(diesel::insert_into(playlist_items)
            .values(&NewPlaylistItem {
                playlist_id: playlist.id,
                plugin_instance_id: options.plugin_instance_id,
                order_index: current_max.unwrap_or(0) + 1,
                is_visible: options.is_visible,
                importance: options.importance,
                duration_override: options.duration_override,
            })
            .returning(PlaylistItem::as_select())
            .get_result(conn)?)
    })
}

/// Renumber a playlist's items to 1..N keeping their relative order.
/// Items are updated in ascending order so each target slot is already free.
pub fn compact(conn: &mut SqliteConnection, playlist: i32) -> CoreResult<usize> {
    use crate::schema::playlist_items::dsl::*;

    let items = list_items(conn, playlist)?;
    let mut changed = 0;
    for (position, item) in items.iter().enumerate() {
        let wanted = position as i32 + 1;
        if item.order_index != wanted {
            diesel::update(playlist_items.find(item.id))
                .set(order_index.eq(wanted))
                .execute(conn)?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Delete an item and close the gap it leaves.
pub fn remove_item(conn: &mut SqliteConnection, item_id: i32) -> CoreResult<()> {
    conn.immediate_transaction(|conn| {
        use crate::schema::playlist_items::dsl::*;

        let item: PlaylistItem = playlist_items
            .find(item_id)
            .select(PlaylistItem::as_select())
            .first(conn)
            .optional()?
            .ok_or_else(|| CoreError::not_found(format!("playlist item {}", item_id)))?;

        diesel::delete(playlist_items.find(item_id)).execute(conn)?;
        compact(conn, item.playlist_id)?;
        Ok(())
    })
}

/// Move an item to `position` (1-based, clamped to the playlist length).
pub fn move_item(conn: &mut SqliteConnection, item_id: i32, position: i32) -> CoreResult<()> {
    conn.immediate_transaction(|conn| {
        use crate::schema::playlist_items::dsl::*;

        let item: PlaylistItem = playlist_items
            .find(item_id)
            .select(PlaylistItem::as_select())
            .first(conn)
            .optional()?
            .ok_or_else(|| CoreError::not_found(format!("playlist item {}", item_id)))?;

        let mut ordered: Vec<i32> = list_items(conn, item.playlist_id)?
            .into_iter()
            .map(|i| i.id)
            .filter(|candidate| *candidate != item_id)
            .collect();
        let slot = (position.max(1) as usize - 1).min(ordered.len());
        ordered.insert(slot, item_id);

        // Park everything on negative indexes first so the unique
        // (playlist_id, order_index) constraint never sees a collision.
        diesel::update(playlist_items.filter(playlist_id.eq(item.playlist_id)))
            .set(order_index.eq(order_index * -1))
            .execute(conn)?;

        let now = Utc::now().naive_utc();
        for (idx, each) in ordered.iter().enumerate() {
            diesel::update(playlist_items.find(*each))
                .set((order_index.eq(idx as i32 + 1), updated_at.eq(now)))
                .execute(conn)?;
        }
        Ok(())
    })
}

/// Attach a schedule window to an item. Times are stored as HH:MM:SS and
/// the zone under its canonical name.
pub fn add_schedule(
    conn: &mut SqliteConnection,
    item_id: i32,
    input: ScheduleInput,
) -> CoreResult<Schedule> {
    use crate::schema::schedules;

    if !(0..=ALL_DAYS).contains(&input.day_mask) {
        return Err(CoreError::data(format!("day_mask {} out of range", input.day_mask)));
    }
    let start = normalize_time(&input.start_time)
        .ok_or_else(|| CoreError::data(format!("invalid start_time '{}'", input.start_time)))?;
    let end = normalize_time(&input.end_time)
        .ok_or_else(|| CoreError::data(format!("invalid end_time '{}'", input.end_time)))?;

    Ok(diesel::insert_into(schedules::table)
        .values(&NewSchedule {
            playlist_item_id: item_id,
            name: input.name,
            day_mask: input.day_mask,
            start_time: start,
            end_time: end,
            timezone: normalize_timezone(&input.timezone),
            is_active: input.is_active,
        })
        .returning(Schedule::as_select())
        .get_result(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::schedule_resolver;
    use crate::test_support::{self, TestDb};
    use chrono::TimeZone;

    fn indexes(conn: &mut SqliteConnection, playlist: i32) -> Vec<(i32, i32)> {
        list_items(conn, playlist)
            .unwrap()
            .into_iter()
            .map(|i| (i.plugin_instance_id, i.order_index))
            .collect()
    }

    #[test]
    fn test_remove_compacts_order() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let device = test_support::device(&mut conn, "hall");
        let mut items = Vec::new();
        for n in 0..4 {
            let instance = test_support::webhook_instance(&mut conn, &format!("w{}", n));
            items.push(add_item(&mut conn, device.id, ItemOptions::for_instance(instance.id)).unwrap());
        }
        let playlist = items[0].playlist_id;

        remove_item(&mut conn, items[1].id).unwrap();
        let after: Vec<i32> = indexes(&mut conn, playlist).iter().map(|(_, o)| *o).collect();
        assert_eq!(after, vec![1, 2, 3]);

        remove_item(&mut conn, items[0].id).unwrap();
        let after = indexes(&mut conn, playlist);
        assert_eq!(
            after,
            vec![
                (items[2].plugin_instance_id, 1),
                (items[3].plugin_instance_id, 2)
            ]
        );
    }

    #[test]
    fn test_move_item_keeps_dense_order() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let device = test_support::device(&mut conn, "den");
        let mut items = Vec::new();
        for n in 0..3 {
            let instance = test_support::webhook_instance(&mut conn, &format!("m{}", n));
            items.push(add_item(&mut conn, device.id, ItemOptions::for_instance(instance.id)).unwrap());
        }

        move_item(&mut conn, items[2].id, 1).unwrap();
        let order: Vec<i32> = list_items(&mut conn, items[0].playlist_id)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(order, vec![items[2].id, items[0].id, items[1].id]);

        move_item(&mut conn, items[2].id, 99).unwrap();
        let order = indexes(&mut conn, items[0].playlist_id);
        assert_eq!(order.iter().map(|(_, o)| *o).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(order[2].0, items[2].plugin_instance_id);
    }

    #[test]
    fn test_schedule_input_is_normalized() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let (device, _) = test_support::device_showing(&mut conn, "office");
        let playlist = ensure_default_playlist(&mut conn, device.id).unwrap();
        let item = &list_items(&mut conn, playlist.id).unwrap()[0];

        let schedule = add_schedule(
            &mut conn,
            item.id,
            ScheduleInput {
                name: "nights".to_string(),
                day_mask: ALL_DAYS,
                start_time: "22:00".to_string(),
                end_time: "6:00".to_string(),
                timezone: "Not/AZone".to_string(),
                is_active: true,
            },
        )
        .unwrap();
        assert_eq!(schedule.start_time, "22:00:00");
        assert_eq!(schedule.end_time, "06:00:00");
        assert_eq!(schedule.timezone, "UTC");

        let noon = chrono::Utc.with_ymd_and_hms(2025, 3, 4, 12, 0, 0).unwrap();
        let late = chrono::Utc.with_ymd_and_hms(2025, 3, 4, 23, 30, 0).unwrap();
        assert!(schedule_resolver::active_items(&mut conn, device.id, noon)
            .unwrap()
            .is_empty());
        assert_eq!(
            schedule_resolver::active_items(&mut conn, device.id, late)
                .unwrap()
                .len(),
            1
        );

        let bad = add_schedule(
            &mut conn,
            item.id,
            ScheduleInput {
                name: String::new(),
                day_mask: 200,
                start_time: "01:00".to_string(),
                end_time: "02:00".to_string(),
                timezone: String::new(),
                is_active: true,
            },
        );
        assert!(matches!(bad, Err(CoreError::Data(_))));
    }
}
