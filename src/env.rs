//! Dotenv support

use std::path::Path;
use tracing::{info, warn};

/// Load environment variables from a dotenv file.
///
/// An explicitly named file must exist and parse; otherwise `.env` in the
/// working directory is loaded when present.
pub fn load_dotenv(explicit: Option<&Path>) -> Result<(), String> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(format!("dotenv file not found: {}", path.display()));
        }
        dotenvy::from_path(path).map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
        info!(path = %path.display(), "loaded dotenv file");
        return Ok(());
    }

    let default = Path::new(".env");
    if default.exists() {
        match dotenvy::from_path(default) {
            Ok(_) => info!(path = ".env", "loaded dotenv file"),
            Err(e) => warn!(path = ".env", error = %e, "failed to load dotenv file"),
        }
    }

    Ok(())
}
