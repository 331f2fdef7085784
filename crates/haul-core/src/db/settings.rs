//! Settings database operations

use crate::db::Database;
use crate::error::Result;
use crate::types::Settings;
use rusqlite::params;

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(value: String) -> String {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    } else if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    value
}

/// Settings database operations
pub struct SettingsDb;

impl SettingsDb {
    /// Load all settings from database. Unknown keys are ignored and
    /// unparsable values fall back to their defaults.
    pub fn load(db: &Database) -> Result<Settings> {
        let defaults = Settings::default();
        let mut settings = defaults.clone();

        db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            for row in rows {
                let (key, value) = row?;
                match key.as_str() {
                    "download_path" => settings.download_path = expand_home(value),
                    "daemon_binary" => settings.daemon_binary = value,
                    "rpc_port" => settings.rpc_port = value.parse().unwrap_or(defaults.rpc_port),
                    "rpc_secret" if !value.is_empty() => settings.rpc_secret = value,
                    "max_concurrent_downloads" => {
                        settings.max_concurrent_downloads = value.parse().unwrap_or(defaults.max_concurrent_downloads);
                    }
                    "download_speed_limit" => {
                        settings.download_speed_limit = value.parse().unwrap_or(0);
                    }
                    "upload_speed_limit" => {
                        settings.upload_speed_limit = value.parse().unwrap_or(0);
                    }
                    "check_integrity" => settings.check_integrity = value == "true",
                    "bt_enable_dht" => settings.bt_enable_dht = value == "true",
                    "bt_enable_pex" => settings.bt_enable_pex = value == "true",
                    "bt_enable_lpd" => settings.bt_enable_lpd = value == "true",
                    "bt_max_peers" => {
                        settings.bt_max_peers = value.parse().unwrap_or(defaults.bt_max_peers);
                    }
                    "bt_seed_ratio" => {
                        settings.bt_seed_ratio = value.parse().unwrap_or(defaults.bt_seed_ratio);
                    }
                    "bt_seed_time" => settings.bt_seed_time = value.parse().unwrap_or(0),
                    "poll_interval_ms" => {
                        settings.poll_interval_ms = value.parse().unwrap_or(defaults.poll_interval_ms);
                    }
                    "rpc_timeout_ms" => {
                        settings.rpc_timeout_ms = value.parse().unwrap_or(defaults.rpc_timeout_ms);
                    }
                    "ready_interval_ms" => {
                        settings.ready_interval_ms = value.parse().unwrap_or(defaults.ready_interval_ms);
                    }
                    "ready_attempts" => {
                        settings.ready_attempts = value.parse().unwrap_or(defaults.ready_attempts);
                    }
                    "restart_cooldown_ms" => {
                        settings.restart_cooldown_ms = value.parse().unwrap_or(defaults.restart_cooldown_ms);
                    }
                    "shutdown_grace_ms" => {
                        settings.shutdown_grace_ms = value.parse().unwrap_or(defaults.shutdown_grace_ms);
                    }
                    "manifest_interval_ms" => {
                        settings.manifest_interval_ms = value.parse().unwrap_or(defaults.manifest_interval_ms);
                    }
                    "manifest_attempts" => {
                        settings.manifest_attempts = value.parse().unwrap_or(defaults.manifest_attempts);
                    }
                    "retry_count" => settings.retry_count = value.parse().unwrap_or(defaults.retry_count),
                    "retry_factor" => settings.retry_factor = value.parse().unwrap_or(defaults.retry_factor),
                    "resume_max_age_days" => {
                        settings.resume_max_age_days = value.parse().unwrap_or(defaults.resume_max_age_days);
                    }
                    _ => {}
                }
            }

            Ok(())
        })?;

        Ok(settings)
    }

    /// Save a single setting
    pub fn set(db: &Database, key: &str, value: &str) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Save all settings
    pub fn save(db: &Database, settings: &Settings) -> Result<()> {
        Self::set(db, "download_path", &settings.download_path)?;
        Self::set(db, "daemon_binary", &settings.daemon_binary)?;
        Self::set(db, "rpc_port", &settings.rpc_port.to_string())?;
        Self::set(db, "rpc_secret", &settings.rpc_secret)?;
        Self::set(db, "max_concurrent_downloads", &settings.max_concurrent_downloads.to_string())?;
        Self::set(db, "download_speed_limit", &settings.download_speed_limit.to_string())?;
        Self::set(db, "upload_speed_limit", &settings.upload_speed_limit.to_string())?;
        Self::set(db, "check_integrity", flag(settings.check_integrity))?;
        Self::set(db, "bt_enable_dht", flag(settings.bt_enable_dht))?;
        Self::set(db, "bt_enable_pex", flag(settings.bt_enable_pex))?;
        Self::set(db, "bt_enable_lpd", flag(settings.bt_enable_lpd))?;
        Self::set(db, "bt_max_peers", &settings.bt_max_peers.to_string())?;
        Self::set(db, "bt_seed_ratio", &settings.bt_seed_ratio.to_string())?;
        Self::set(db, "bt_seed_time", &settings.bt_seed_time.to_string())?;
        Self::set(db, "poll_interval_ms", &settings.poll_interval_ms.to_string())?;
        Self::set(db, "rpc_timeout_ms", &settings.rpc_timeout_ms.to_string())?;
        Self::set(db, "ready_interval_ms", &settings.ready_interval_ms.to_string())?;
        Self::set(db, "ready_attempts", &settings.ready_attempts.to_string())?;
        Self::set(db, "restart_cooldown_ms", &settings.restart_cooldown_ms.to_string())?;
        Self::set(db, "shutdown_grace_ms", &settings.shutdown_grace_ms.to_string())?;
        Self::set(db, "manifest_interval_ms", &settings.manifest_interval_ms.to_string())?;
        Self::set(db, "manifest_attempts", &settings.manifest_attempts.to_string())?;
        Self::set(db, "retry_count", &settings.retry_count.to_string())?;
        Self::set(db, "retry_factor", &settings.retry_factor.to_string())?;
        Self::set(db, "resume_max_age_days", &settings.resume_max_age_days.to_string())?;
        Ok(())
    }

    /// Get a single setting value
    pub fn get(db: &Database, key: &str) -> Result<Option<String>> {
        db.with_conn(|conn| {
            let result = conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            );

            match result {
                Ok(value) => Ok(Some(value)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[test]
    fn test_save_and_load_round_trip() {
        let db = open_in_memory().unwrap();
        let settings = Settings {
            download_path: "/srv/media".to_string(),
            rpc_port: 6900,
            rpc_secret: "abc123".to_string(),
            check_integrity: false,
            bt_seed_ratio: 2.5,
            manifest_attempts: 12,
            ..Settings::default()
        };
        SettingsDb::save(&db, &settings).unwrap();

        let loaded = SettingsDb::load(&db).unwrap();
        assert_eq!(loaded.download_path, "/srv/media");
        assert_eq!(loaded.rpc_port, 6900);
        assert_eq!(loaded.rpc_secret, "abc123");
        assert!(!loaded.check_integrity);
        assert_eq!(loaded.bt_seed_ratio, 2.5);
        assert_eq!(loaded.manifest_attempts, 12);
    }

    #[test]
    fn test_bad_values_fall_back_to_defaults() {
        let db = open_in_memory().unwrap();
        SettingsDb::set(&db, "rpc_port", "not-a-port").unwrap();
        SettingsDb::set(&db, "retry_count", "7").unwrap();

        let loaded = SettingsDb::load(&db).unwrap();
        assert_eq!(loaded.rpc_port, 6800);
        assert_eq!(loaded.retry_count, 7);
        assert_eq!(SettingsDb::get(&db, "retry_count").unwrap().as_deref(), Some("7"));
        assert_eq!(SettingsDb::get(&db, "missing").unwrap(), None);
    }
}
