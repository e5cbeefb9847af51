use md5::{Digest, Md5};
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "keepeco";

#[derive(Debug, thiserror::Error)]
#[error("expand {path}: {reason}")]
pub struct ExpandError {
    pub path: String,
    pub reason: String,
}

/// Expand `~` and environment variables in a user supplied path.
pub fn expand_path(raw: &str) -> Result<PathBuf, ExpandError> {
    let expanded = shellexpand::full(raw).map_err(|e| ExpandError {
        path: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// `{temp}/keepeco.{uid}`; scoped per OS user so two accounts never share records.
pub fn user_cache_dir() -> PathBuf {
    std::env::temp_dir().join(format!("{}.{}", APP_NAME, current_user_id()))
}

/// `{basename}.{hex(md5(path))}`
pub fn cache_file_name(db_path: &str) -> String {
    let base = Path::new(db_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| APP_NAME.to_string());
    format!("{}.{}", base, hex::encode(Md5::digest(db_path.as_bytes())))
}

#[cfg(unix)]
fn current_user_id() -> String {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    uid.to_string()
}

#[cfg(not(unix))]
fn current_user_id() -> String {
    std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string())
}
