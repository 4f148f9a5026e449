//! Platform-specific paths for ledger files and configuration

use std::path::PathBuf;

/// Get the platform-specific data directory for ledger databases
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\LedgerSync
/// - macOS: ~/Library/Application Support/LedgerSync
/// - Linux/Other: ~/.local/share/LedgerSync
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("LedgerSync")
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("LedgerSync")
}

/// Default database path for a ledger
pub fn get_default_ledger_path(ledger_id: &str) -> PathBuf {
    let file_name: String = ledger_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    get_data_dir().join(format!("{}.db", file_name))
}

/// Default path of the CLI configuration file
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}
