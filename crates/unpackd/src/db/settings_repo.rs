//! Settings repository for the single row of the `settings` table.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::{CorruptRow, DatabaseError};
use super::from_millis;
use super::job_repo::parse_wire;
use crate::domain::Settings;

const TABLE: &str = "settings";
const SETTINGS_ID: i64 = 1;

/// A raw settings row.
#[derive(Debug, Clone)]
pub struct SettingsRow {
    pub conflict_policy: String,
    pub output_mode: String,
    pub zip_slip_policy: String,
    pub common_passwords: String,
    pub password_masking: bool,
    pub updated_at: i64,
}

impl SettingsRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            conflict_policy: row.get("conflict_policy")?,
            output_mode: row.get("output_mode")?,
            zip_slip_policy: row.get("zip_slip_policy")?,
            common_passwords: row.get("common_passwords")?,
            password_masking: row.get("password_masking")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn into_settings(self) -> Result<Settings, CorruptRow> {
        let corrupt = |e: serde_json::Error| CorruptRow::new(TABLE, SETTINGS_ID, e);
        Ok(Settings {
            conflict_policy: parse_wire(&self.conflict_policy).map_err(corrupt)?,
            output_mode: parse_wire(&self.output_mode).map_err(corrupt)?,
            zip_slip_policy: parse_wire(&self.zip_slip_policy).map_err(corrupt)?,
            common_passwords: serde_json::from_str(&self.common_passwords).map_err(corrupt)?,
            password_masking: self.password_masking,
            updated_at: from_millis(self.updated_at),
        })
    }
}

pub fn find(conn: &Connection) -> Result<Option<SettingsRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM settings WHERE id = ?1",
            params![SETTINGS_ID],
            SettingsRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Inserts or replaces the settings row.
pub fn upsert(conn: &Connection, settings: &Settings) -> Result<(), DatabaseError> {
    let passwords = serde_json::to_string(&settings.common_passwords).map_err(|e| {
        DatabaseError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    })?;
    conn.execute(
        "INSERT INTO settings (id, conflict_policy, output_mode, zip_slip_policy,
         common_passwords, password_masking, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            conflict_policy = excluded.conflict_policy,
            output_mode = excluded.output_mode,
            zip_slip_policy = excluded.zip_slip_policy,
            common_passwords = excluded.common_passwords,
            password_masking = excluded.password_masking,
            updated_at = excluded.updated_at",
        params![
            SETTINGS_ID,
            settings.conflict_policy.as_str(),
            settings.output_mode.as_str(),
            settings.zip_slip_policy.as_str(),
            passwords,
            settings.password_masking,
            settings.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}
