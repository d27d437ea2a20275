//! Global settings row.

use tracing::info;

use super::{JobStore, StoreError};
use crate::db::{now_millis, from_millis, settings_repo};
use crate::domain::{Settings, SettingsUpdate};

impl JobStore {
    /// Current settings, or `None` before the first write. Defaults are
    /// never inserted implicitly.
    pub fn get_settings(&self) -> Result<Option<Settings>, StoreError> {
        let row = self.db.with_conn(settings_repo::find)?;
        match row {
            Some(row) => Ok(Some(row.into_settings()?)),
            None => Ok(None),
        }
    }

    /// Merges `update` into the stored settings.
    ///
    /// The first write must carry every policy field; password masking
    /// defaults to on and the common password list to empty.
    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<Settings, StoreError> {
        let settings = self.db.with_tx(|tx| -> Result<Settings, StoreError> {
            let current = match settings_repo::find(tx)? {
                Some(row) => Some(row.into_settings()?),
                None => None,
            };

            let next = match current {
                Some(current) => Settings {
                    conflict_policy: update.conflict_policy.unwrap_or(current.conflict_policy),
                    output_mode: update.output_mode.unwrap_or(current.output_mode),
                    zip_slip_policy: update.zip_slip_policy.unwrap_or(current.zip_slip_policy),
                    common_passwords: update
                        .common_passwords
                        .clone()
                        .unwrap_or(current.common_passwords),
                    password_masking: update.password_masking.unwrap_or(current.password_masking),
                    updated_at: from_millis(now_millis()),
                },
                None => {
                    let mut missing = Vec::new();
                    if update.conflict_policy.is_none() {
                        missing.push("conflict_policy");
                    }
                    if update.output_mode.is_none() {
                        missing.push("output_mode");
                    }
                    if update.zip_slip_policy.is_none() {
                        missing.push("zip_slip_policy");
                    }
                    match (update.conflict_policy, update.output_mode, update.zip_slip_policy) {
                        (Some(conflict_policy), Some(output_mode), Some(zip_slip_policy)) => {
                            Settings {
                                conflict_policy,
                                output_mode,
                                zip_slip_policy,
                                common_passwords: update
                                    .common_passwords
                                    .clone()
                                    .unwrap_or_default(),
                                password_masking: update.password_masking.unwrap_or(true),
                                updated_at: from_millis(now_millis()),
                            }
                        }
                        _ => return Err(StoreError::MissingOptions(missing)),
                    }
                }
            };

            settings_repo::upsert(tx, &next)?;
            Ok(next)
        })?;

        info!(
            "Settings updated ({} common password(s))",
            settings.common_passwords.len()
        );
        Ok(settings)
    }
}
