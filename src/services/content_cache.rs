use crate::error::CoreResult;
use crate::models::{NewRenderedContent, RenderedContent};
use chrono::{Duration, NaiveDateTime};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::collections::HashSet;

/// One render result to record for an (instance, device) pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub instance_id: i32,
    pub device_id: Option<i32>,
    pub width: i32,
    pub height: i32,
    pub bit_depth: i32,
    pub image_path: String,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub content: RenderedContent,
    /// False when the stored hash already matched.
    pub changed: bool,
    /// File the row pointed at before, when it was replaced.
    pub replaced_path: Option<String>,
}

/// Get(instance, device). `None` as device addresses the device-agnostic row.
pub fn get(
    conn: &mut SqliteConnection,
    instance: i32,
    device: Option<i32>,
) -> CoreResult<Option<RenderedContent>> {
    use crate::schema::rendered_content::dsl::*;

    let query = rendered_content
        .filter(plugin_instance_id.eq(instance))
        .into_boxed();
    let query = match device {
        Some(d) => query.filter(device_id.eq(d)),
        None => query.filter(device_id.is_null()),
    };

    Ok(query
        .select(RenderedContent::as_select())
        .first(conn)
        .optional()?)
}

/// Device-specific content, else the device-agnostic render.
pub fn get_for_device(
    conn: &mut SqliteConnection,
    instance: i32,
    device: i32,
) -> CoreResult<Option<RenderedContent>> {
    match get(conn, instance, Some(device))? {
        Some(found) => Ok(Some(found)),
        None => get(conn, instance, None),
    }
}

pub fn is_stale(content: &RenderedContent, now: NaiveDateTime, freshness_secs: i64) -> bool {
    now - content.last_checked_at > Duration::seconds(freshness_secs)
}

/// Bookkeeping for a render that produced the bytes already stored.
pub fn touch(conn: &mut SqliteConnection, content_id: i32, now: NaiveDateTime) -> CoreResult<RenderedContent> {
    use crate::schema::rendered_content::dsl::*;

    Ok(diesel::update(rendered_content.find(content_id))
        .set((rendered_at.eq(now), last_checked_at.eq(now)))
        .returning(RenderedContent::as_select())
        .get_result(conn)?)
}

/// Put(...). Same hash only refreshes timestamps; a new hash swaps the
/// file, keeps the old hash as `previous_hash` and resets the failure count.
pub fn put(conn: &mut SqliteConnection, entry: CacheEntry, now: NaiveDateTime) -> CoreResult<PutOutcome> {
    use crate::schema::rendered_content::dsl::*;

    let existing = get(conn, entry.instance_id, entry.device_id)?;

    match existing {
        Some(current) if current.content_hash == entry.content_hash => Ok(PutOutcome {
            content: touch(conn, current.id, now)?,
            changed: false,
            replaced_path: None,
        }),
        Some(current) => {
            let content = diesel::update(rendered_content.find(current.id))
                .set((
                    width.eq(entry.width),
                    height.eq(entry.height),
                    bit_depth.eq(entry.bit_depth),
                    image_path.eq(&entry.image_path),
                    content_hash.eq(&entry.content_hash),
                    previous_hash.eq(Some(current.content_hash.clone())),
                    render_attempts.eq(0),
                    rendered_at.eq(now),
                    last_checked_at.eq(now),
                ))
                .returning(RenderedContent::as_select())
                .get_result(conn)?;
            let replaced_path = (current.image_path != entry.image_path).then_some(current.image_path);
            Ok(PutOutcome {
                content,
                changed: true,
                replaced_path,
            })
        }
        None => {
            let content = diesel::insert_into(rendered_content)
                .values(&NewRenderedContent {
                    plugin_instance_id: entry.instance_id,
                    device_id: entry.device_id,
                    width: entry.width,
                    height: entry.height,
                    bit_depth: entry.bit_depth,
                    image_path: entry.image_path,
                    content_hash: entry.content_hash,
                    render_attempts: 0,
                    rendered_at: now,
                    last_checked_at: now,
                })
                .returning(RenderedContent::as_select())
                .get_result(conn)?;
            Ok(PutOutcome {
                content,
                changed: true,
                replaced_path: None,
            })
        }
    }
}

/// Most recent render of the instance for any target.
pub fn last_rendered_at(
    conn: &mut SqliteConnection,
    instance: i32,
) -> CoreResult<Option<NaiveDateTime>> {
    use crate::schema::rendered_content::dsl::*;

    Ok(rendered_content
        .filter(plugin_instance_id.eq(instance))
        .select(diesel::dsl::max(rendered_at))
        .first(conn)?)
}

/// Count a failed render against the cached row, if one exists.
pub fn record_failure(
    conn: &mut SqliteConnection,
    instance: i32,
    device: Option<i32>,
) -> CoreResult<()> {
    use crate::schema::rendered_content::dsl::*;

    if let Some(current) = get(conn, instance, device)? {
        diesel::update(rendered_content.find(current.id))
            .set(render_attempts.eq(render_attempts + 1))
            .execute(conn)?;
    }
    Ok(())
}

/// Delete every cached row for the instance and return their files.
pub fn delete_for_instance(conn: &mut SqliteConnection, instance: i32) -> CoreResult<Vec<String>> {
    use crate::schema::rendered_content::dsl::*;

    let paths: Vec<String> = rendered_content
        .filter(plugin_instance_id.eq(instance))
        .select(image_path)
        .load(conn)?;
    diesel::delete(rendered_content.filter(plugin_instance_id.eq(instance))).execute(conn)?;
    Ok(paths)
}

/// Whether any cached row still points at the stored file.
pub fn is_referenced(conn: &mut SqliteConnection, name: &str) -> CoreResult<bool> {
    use crate::schema::rendered_content::dsl::*;

    Ok(
        diesel::select(diesel::dsl::exists(rendered_content.filter(image_path.eq(name))))
            .get_result(conn)?,
    )
}

pub fn referenced_paths(conn: &mut SqliteConnection) -> CoreResult<HashSet<String>> {
    use crate::schema::rendered_content::dsl::*;

    Ok(rendered_content
        .select(image_path)
        .load::<String>(conn)?
        .into_iter()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, TestDb};
    use chrono::Utc;

    fn entry(instance: i32, device: Option<i32>, hash: &str) -> CacheEntry {
        CacheEntry {
            instance_id: instance,
            device_id: device,
            width: 800,
            height: 480,
            bit_depth: 1,
            image_path: format!("{}_{}.png", instance, hash),
            content_hash: hash.to_string(),
        }
    }

    #[test]
    fn test_identical_hash_only_refreshes_timestamps() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let (device, instance) = test_support::device_showing(&mut conn, "dedup");
        let t0 = Utc::now().naive_utc();
        let t1 = t0 + Duration::minutes(5);

        let first = put(&mut conn, entry(instance.id, Some(device.id), "aaa"), t0).unwrap();
        assert!(first.changed);
        let second = put(&mut conn, entry(instance.id, Some(device.id), "aaa"), t1).unwrap();
        assert!(!second.changed);
        assert_eq!(second.content.id, first.content.id);
        assert_eq!(second.content.content_hash, "aaa");
        assert_eq!(second.content.previous_hash, None);
        assert_eq!(second.content.rendered_at, t1);
        assert_eq!(second.content.last_checked_at, t1);
    }

    #[test]
    fn test_new_hash_rotates_previous_and_resets_attempts() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let (device, instance) = test_support::device_showing(&mut conn, "rotate");
        let now = Utc::now().naive_utc();

        put(&mut conn, entry(instance.id, Some(device.id), "aaa"), now).unwrap();
        record_failure(&mut conn, instance.id, Some(device.id)).unwrap();
        record_failure(&mut conn, instance.id, Some(device.id)).unwrap();
        assert_eq!(
            get(&mut conn, instance.id, Some(device.id))
                .unwrap()
                .unwrap()
                .render_attempts,
            2
        );

        let outcome = put(&mut conn, entry(instance.id, Some(device.id), "bbb"), now).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.content.previous_hash.as_deref(), Some("aaa"));
        assert_eq!(outcome.content.render_attempts, 0);
        assert_eq!(outcome.replaced_path.as_deref(), Some(format!("{}_aaa.png", instance.id).as_str()));
    }

    #[test]
    fn test_device_agnostic_row_is_fallback() {
        let db = TestDb::new();
        let mut conn = db.conn();
        let (device, instance) = test_support::device_showing(&mut conn, "shared");
        let now = Utc::now().naive_utc();

        assert!(get_for_device(&mut conn, instance.id, device.id).unwrap().is_none());
        put(&mut conn, entry(instance.id, None, "any"), now).unwrap();
        let found = get_for_device(&mut conn, instance.id, device.id).unwrap().unwrap();
        assert_eq!(found.device_id, None);

        put(&mut conn, entry(instance.id, Some(device.id), "mine"), now).unwrap();
        let found = get_for_device(&mut conn, instance.id, device.id).unwrap().unwrap();
        assert_eq!(found.content_hash, "mine");

        assert!(is_stale(&found, now + Duration::seconds(61), 60));
        assert!(!is_stale(&found, now + Duration::seconds(30), 60));

        let paths = delete_for_instance(&mut conn, instance.id).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(referenced_paths(&mut conn).unwrap().is_empty());
    }
}
