use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use url::Url;

/// A response body stored under its request URL.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Persistent URL -> response store.
///
/// Entries are write-once: the first response stored for a key is returned
/// verbatim on every later lookup and is never expired or replaced.
pub struct ResponseCache {
    conn: Mutex<Connection>,
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Canonical form of a request URL: fragment dropped, query pairs sorted.
/// Strings that do not parse as URLs are only trimmed.
pub fn normalize_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url.trim()) else {
        return url.trim().to_string();
    };
    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        pairs.sort();
        parsed.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }
    parsed.to_string()
}

/// Stable hash of the normalised URL, hex encoded.
pub fn cache_key(url: &str) -> String {
    let digest = Sha256::digest(normalize_url(url).as_bytes());
    format!("{:x}", digest)
}

impl ResponseCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS responses (
                key TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                status INTEGER NOT NULL,
                body TEXT NOT NULL,
                stored_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, url: &str) -> Result<Option<CachedResponse>> {
        let key = cache_key(url);
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("SELECT url, status, body FROM responses WHERE key = ?1")?;

        let entry = stmt
            .query_row(params![key], |row| {
                Ok(CachedResponse {
                    url: row.get(0)?,
                    status: row.get::<_, i64>(1)? as u16,
                    body: row.get(2)?,
                })
            })
            .optional()?;
        Ok(entry)
    }

    /// Store a response. Returns `false` when the key was already present,
    /// in which case the existing entry is left untouched.
    pub fn put(&self, url: &str, status: u16, body: &str) -> Result<bool> {
        let key = cache_key(url);
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO responses (key, url, status, body, stored_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, url, status as i64, body, current_timestamp()],
        )?;
        debug!(url, inserted = inserted > 0, "cache store");
        Ok(inserted > 0)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM responses", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_sorts_query_and_drops_fragment() {
        let a = normalize_url("https://example.com/api/v1/runs?max=200&game=abc#top");
        let b = normalize_url("https://example.com/api/v1/runs?game=abc&max=200");
        assert_eq!(a, b);
        assert!(!a.contains('#'));
    }

    #[test]
    fn test_cache_key_is_stable_hex() {
        let key = cache_key("https://example.com/games/abc");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, cache_key("https://example.com/games/abc"));
        assert_ne!(key, cache_key("https://example.com/games/abd"));
    }

    #[test]
    fn test_first_write_wins() {
        let cache = ResponseCache::in_memory().unwrap();
        assert!(cache.put("https://example.com/a", 200, r#"{"data":1}"#).unwrap());
        assert!(!cache.put("https://example.com/a", 200, r#"{"data":2}"#).unwrap());

        let hit = cache.get("https://example.com/a").unwrap().unwrap();
        assert_eq!(hit.body, r#"{"data":1}"#);
        assert_eq!(hit.status, 200);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_miss_is_none() {
        let cache = ResponseCache::in_memory().unwrap();
        assert!(cache.get("https://example.com/missing").unwrap().is_none());
        assert!(cache.is_empty().unwrap());
    }
}
