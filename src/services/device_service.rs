use crate::error::{CoreError, CoreResult};
use crate::models::{Device, NewDevice};
use crate::services::playlist_service;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

/// Register a device together with its default playlist.
pub fn create_device(conn: &mut SqliteConnection, new_device: NewDevice) -> CoreResult<Device> {
    conn.transaction(|conn| {
        use crate::schema::devices;

        let device = diesel::insert_into(devices::table)
            .values(&new_device)
            .returning(Device::as_select())
            .get_result(conn)?;

        playlist_service::ensure_default_playlist(conn, device.id)?;
        tracing::info!("Registered device {} ({})", device.id, device.name);
        Ok(device)
    })
}

pub fn get_device(conn: &mut SqliteConnection, device_id: i32) -> CoreResult<Device> {
    use crate::schema::devices::dsl::*;

    devices
        .find(device_id)
        .select(Device::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("device {}", device_id)))
}

pub fn list_devices(conn: &mut SqliteConnection) -> CoreResult<Vec<Device>> {
    use crate::schema::devices::dsl::*;

    Ok(devices.order(id.asc()).select(Device::as_select()).load(conn)?)
}

pub fn find_by_api_key(conn: &mut SqliteConnection, token: &str) -> CoreResult<Option<Device>> {
    use crate::schema::devices::dsl::*;

    Ok(devices
        .filter(api_key.eq(token))
        .select(Device::as_select())
        .first(conn)
        .optional()?)
}

/// Record a poll and the item the device was handed.
pub fn record_poll(
    conn: &mut SqliteConnection,
    device_id: i32,
    shown_item_id: Option<i32>,
) -> CoreResult<()> {
    use crate::schema::devices::dsl::*;

    let now = Utc::now().naive_utc();
    diesel::update(devices.find(device_id))
        .set((
            last_playlist_item_id.eq(shown_item_id),
            last_seen_at.eq(Some(now)),
            updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}
