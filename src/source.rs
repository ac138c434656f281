//! Source file cache for plugin units.
//!
//! Re-reads a unit's source only when its on-disk modification time changes,
//! and rides out transient file locks with bounded backoff instead of
//! failing immediately.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{ForgeError, ForgeResult};
use crate::registry::UnitHandle;
use crate::unit::SourceEncoding;

/// Backoff policy for reads that hit a transient file lock.
#[derive(Debug, Clone)]
pub struct ReadRetryConfig {
    /// Maximum number of read attempts before the unit fails
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Cap on the delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReadRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReadRetryConfig {
    /// Calculate the delay before the given retry attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1);
        Duration::from_millis(base.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Per-unit source reader with modification-time tracking.
#[derive(Debug, Default, Clone)]
pub struct SourceCache {
    retry: ReadRetryConfig,
}

impl SourceCache {
    /// Create a cache with the default retry policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache with a custom retry policy.
    pub fn with_retry(retry: ReadRetryConfig) -> Self {
        Self { retry }
    }

    /// Re-read the unit's source if its on-disk modification time differs
    /// from the cached one. Returns whether the cached content changed.
    pub async fn refresh(&self, handle: &UnitHandle) -> ForgeResult<bool> {
        let (name, path, cached_mtime, has_lines) = {
            let unit = handle.lock();
            (unit.name.clone(), unit.source_path.clone(), unit.last_modified, !unit.lines.is_empty())
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ForgeError::Source {
                    unit: name,
                    reason: format!("source file {} no longer exists", path.display()),
                });
            }
            Err(e) => return Err(ForgeError::Source { unit: name, reason: e.to_string() }),
        };

        let mtime = metadata.modified().map_err(|e| ForgeError::Source {
            unit: name.clone(),
            reason: format!("cannot read modification time: {e}"),
        })?;

        if cached_mtime == Some(mtime) && has_lines {
            debug!(unit = %name, "source unchanged, keeping cached content");
            return Ok(false);
        }

        let bytes = self.read_with_retry(&name, &path).await?;
        let (text, encoding) = decode_source(&name, &bytes)?;

        if text.trim().is_empty() {
            return Err(ForgeError::Source { unit: name, reason: "source file is empty".to_string() });
        }

        let mut unit = handle.lock();
        unit.lines = text.lines().map(str::to_string).collect();
        unit.encoding = encoding;
        unit.last_modified = Some(mtime);
        unit.last_cached = Some(SystemTime::now());
        unit.compilation_needed = true;
        Ok(true)
    }

    /// Immutable source snapshot for compilation.
    pub fn snapshot(&self, handle: &UnitHandle) -> ForgeResult<(String, SourceEncoding)> {
        let unit = handle.lock();
        if unit.lines.is_empty() {
            return Err(ForgeError::Source {
                unit: unit.name.clone(),
                reason: "no cached source to compile".to_string(),
            });
        }
        Ok((unit.source_text(), unit.encoding))
    }

    async fn read_with_retry(&self, name: &str, path: &PathBuf) -> ForgeResult<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            match tokio::fs::read(path).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(ForgeError::Source {
                        unit: name.to_string(),
                        reason: format!("source file {} no longer exists", path.display()),
                    });
                }
                Err(e) if is_transient_lock(&e) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(ForgeError::Source {
                            unit: name.to_string(),
                            reason: format!(
                                "source file stayed locked after {} attempts: {e}",
                                self.retry.max_attempts
                            ),
                        });
                    }
                    if attempt == 1 {
                        warn!(unit = %name, path = %path.display(), "source file locked, retrying with backoff");
                    }
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                }
                Err(e) => {
                    return Err(ForgeError::Source { unit: name.to_string(), reason: e.to_string() })
                }
            }
        }
    }
}

/// Whether an IO error looks like another process briefly holding the file.
fn is_transient_lock(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::PermissionDenied | ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// Decode source bytes, honoring UTF-8 and UTF-16 byte-order marks.
fn decode_source(name: &str, bytes: &[u8]) -> ForgeResult<(String, SourceEncoding)> {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        let text = std::str::from_utf8(&bytes[3..]).map_err(|e| ForgeError::Source {
            unit: name.to_string(),
            reason: format!("invalid UTF-8 after BOM: {e}"),
        })?;
        return Ok((text.to_string(), SourceEncoding::Utf8Bom));
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return decode_utf16(name, &bytes[2..], false).map(|t| (t, SourceEncoding::Utf16Le));
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return decode_utf16(name, &bytes[2..], true).map(|t| (t, SourceEncoding::Utf16Be));
    }
    let text = std::str::from_utf8(bytes).map_err(|e| ForgeError::Source {
        unit: name.to_string(),
        reason: format!("invalid UTF-8: {e}"),
    })?;
    Ok((text.to_string(), SourceEncoding::Utf8))
}

fn decode_utf16(name: &str, bytes: &[u8], big_endian: bool) -> ForgeResult<String> {
    if bytes.len() % 2 != 0 {
        return Err(ForgeError::Source {
            unit: name.to_string(),
            reason: "truncated UTF-16 content".to_string(),
        });
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16(&units).map_err(|e| ForgeError::Source {
        unit: name.to_string(),
        reason: format!("invalid UTF-16: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::PluginUnit;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn handle_for(path: PathBuf) -> UnitHandle {
        Arc::new(Mutex::new(PluginUnit::new("Shop", path)))
    }

    #[tokio::test]
    async fn test_refresh_reads_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Shop.plg");
        std::fs::write(&path, "plugin Shop {\n}\n").unwrap();

        let cache = SourceCache::new();
        let handle = handle_for(path.clone());

        assert!(cache.refresh(&handle).await.unwrap());
        assert_eq!(handle.lock().lines[0], "plugin Shop {");
        assert!(handle.lock().compilation_needed);

        // Unchanged mtime: no re-read
        assert!(!cache.refresh(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_detects_edit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Shop.plg");
        std::fs::write(&path, "plugin Shop {}\n").unwrap();

        let cache = SourceCache::new();
        let handle = handle_for(path.clone());
        cache.refresh(&handle).await.unwrap();

        std::fs::write(&path, "plugin Shop { broken\n").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2)).unwrap();

        assert!(cache.refresh(&handle).await.unwrap());
        assert_eq!(handle.lock().lines[0], "plugin Shop { broken");
    }

    #[tokio::test]
    async fn test_missing_file_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_for(dir.path().join("Gone.plg"));

        let err = SourceCache::new().refresh(&handle).await.unwrap_err();
        assert!(matches!(err, ForgeError::Source { .. }));
        assert!(err.to_string().contains("no longer exists"));
    }

    #[tokio::test]
    async fn test_empty_file_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Empty.plg");
        std::fs::write(&path, "  \n").unwrap();

        let err = SourceCache::new().refresh(&handle_for(path)).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_decode_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"plugin A {}");
        let (text, encoding) = decode_source("A", &bytes).unwrap();
        assert_eq!(text, "plugin A {}");
        assert_eq!(encoding, SourceEncoding::Utf8Bom);
    }

    #[test]
    fn test_decode_utf16_le() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "plugin A".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let (text, encoding) = decode_source("A", &bytes).unwrap();
        assert_eq!(text, "plugin A");
        assert_eq!(encoding, SourceEncoding::Utf16Le);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = ReadRetryConfig::default();
        assert!(retry.delay_for_attempt(1) < retry.delay_for_attempt(3));
        assert!(retry.delay_for_attempt(20) <= retry.max_delay);
    }
}
