use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "docschema";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DATABASE_FILE: &str = "docschema.db";

/// Overrides the data directory (tests, containers).
pub const DATA_DIR_ENV: &str = "DOCSCHEMA_DATA_DIR";

/// Get the application data directory.
///
/// `$DOCSCHEMA_DATA_DIR` when set, otherwise the platform data directory,
/// otherwise the working directory.
pub fn app_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the SQLite database path
pub fn database_path() -> PathBuf {
    app_data_dir().join(DATABASE_FILE)
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "docschema=debug,info"
    } else {
        "docschema=info,warn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_under_app_data() {
        let db = database_path();
        assert!(db.starts_with(app_data_dir()));
        assert!(db.ends_with(DATABASE_FILE));
    }

    #[test]
    fn log_filter_targets_crate() {
        assert!(default_log_filter().starts_with("docschema="));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
