use crate::db::DbPool;
use crate::models::NewGlobalSetting;
use crate::services::settings_service::DEFAULT_SETTINGS;
use anyhow::Result;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

pub fn seed_defaults(pool: &DbPool) -> Result<()> {
    let mut conn = pool.get()?;
    let inserted = seed_settings(&mut conn)?;
    if inserted > 0 {
        tracing::info!("Seeded {} default settings", inserted);
    }
    Ok(())
}

/// Insert missing settings without touching values an operator already edited.
fn seed_settings(conn: &mut SqliteConnection) -> Result<usize> {
    use crate::schema::global_settings::dsl::*;

    let mut inserted = 0;
    for &(setting_key, default_value, setting_description) in DEFAULT_SETTINGS {
        let exists: i64 = global_settings
            .filter(key.eq(setting_key))
            .count()
            .get_result(conn)?;

        if exists == 0 {
            diesel::insert_into(global_settings)
                .values(&NewGlobalSetting {
                    key: setting_key.to_string(),
                    value: default_value.to_string(),
                    description: Some(setting_description.to_string()),
                })
                .execute(conn)?;
            inserted += 1;
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::settings_service::{self, MERGE_STREAM_LIMIT};
    use crate::test_support::TestDb;

    #[test]
    fn test_seeding_keeps_operator_edits() {
        let db = TestDb::new();
        let mut conn = db.conn();
        settings_service::upsert_setting(&mut conn, MERGE_STREAM_LIMIT, "42", None).unwrap();

        seed_defaults(&db.pool).unwrap();
        seed_defaults(&db.pool).unwrap();

        let all = settings_service::list_settings(&mut conn).unwrap();
        assert_eq!(all.len(), DEFAULT_SETTINGS.len());
        let tunables = settings_service::load_tunables(&mut conn).unwrap();
        assert_eq!(tunables.merge_stream_limit, 42);
    }
}
