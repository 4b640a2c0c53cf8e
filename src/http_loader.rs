//! File loader backing the module cache: local paths read from disk, HTTP
//! URLs fetched once and kept in an on-disk cache so repeated runs work
//! offline.
//!
//! Cache layout: `~/.funee/cache/<scheme>/<host>/<sha256-prefix>/<file>`
//! with a `metadata.json` sidecar carrying validators and the fetch time.

use bytes_str::BytesStr;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use swc_common::FileLoader;
use url::Url;

const CACHE_FRESH_FOR: Duration = Duration::from_secs(24 * 60 * 60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct FetchMetadata {
    url: String,
    etag: Option<String>,
    last_modified: Option<String>,
    fetched_at: u64,
}

impl FetchMetadata {
    fn capture(url: &str, response: &reqwest::blocking::Response) -> Self {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            url: url.to_string(),
            etag: header("etag"),
            last_modified: header("last-modified"),
            fetched_at: unix_now(),
        }
    }

    fn is_fresh(&self) -> bool {
        unix_now().saturating_sub(self.fetched_at) < CACHE_FRESH_FOR.as_secs()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct DiskHttpLoader {
    cache_dir: PathBuf,
    client: Client,
    quiet: bool,
}

impl DiskHttpLoader {
    pub fn new() -> io::Result<Self> {
        let cache_dir = dirs::home_dir()
            .map(|home| home.join(".funee").join("cache"))
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "no home directory"))?;
        Self::with_cache_dir(cache_dir)
    }

    pub fn with_cache_dir(cache_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        Ok(Self {
            cache_dir,
            client,
            quiet: std::env::var_os("FUNEE_QUIET").is_some(),
        })
    }

    pub fn is_http_uri(uri: &str) -> bool {
        uri.starts_with("http://") || uri.starts_with("https://")
    }

    fn note(&self, message: &str) {
        if !self.quiet {
            eprintln!("{}", message);
        }
    }

    fn cache_path(&self, url: &str) -> io::Result<PathBuf> {
        let parsed = Url::parse(url)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, format!("{}: {}", url, e)))?;
        let host = parsed.host_str().unwrap_or("unknown").to_string();
        let digest = Sha256::digest(url.as_bytes());
        let key = hex::encode(&digest[..8]);
        let file = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "index.ts".to_string());
        Ok(self
            .cache_dir
            .join(parsed.scheme())
            .join(host)
            .join(key)
            .join(file))
    }

    fn metadata_path(cached: &Path) -> PathBuf {
        cached.with_file_name("metadata.json")
    }

    fn read_metadata(cached: &Path) -> Option<FetchMetadata> {
        let text = fs::read_to_string(Self::metadata_path(cached)).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn fetch(&self, url: &str) -> io::Result<String> {
        let cached = self.cache_path(url)?;

        if cached.exists() {
            if let Some(metadata) = Self::read_metadata(&cached) {
                if metadata.is_fresh() {
                    return fs::read_to_string(&cached);
                }
            }
        }

        let response = match self.client.get(url).send() {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                // Stale cache beats a failing origin.
                if cached.exists() {
                    self.note(&format!(
                        "⚠ HTTP {} for {}, using cached copy",
                        response.status(),
                        url
                    ));
                    return fs::read_to_string(&cached);
                }
                return Err(io::Error::new(
                    ErrorKind::NotFound,
                    format!("HTTP {} for {}", response.status(), url),
                ));
            }
            Err(e) => {
                if cached.exists() {
                    self.note(&format!(
                        "⚠ network error for {}, using cached copy: {}",
                        url, e
                    ));
                    return fs::read_to_string(&cached);
                }
                return Err(io::Error::new(
                    ErrorKind::Other,
                    format!("failed to fetch {}: {}", url, e),
                ));
            }
        };

        let metadata = FetchMetadata::capture(url, &response);
        let body = response
            .text()
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?;

        if let Some(parent) = cached.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&cached, &body)?;
        if let Ok(json) = serde_json::to_string_pretty(&metadata) {
            let _ = fs::write(Self::metadata_path(&cached), json);
        }

        self.note(&format!("✓ fetched: {}", url));
        Ok(body)
    }
}

impl FileLoader for DiskHttpLoader {
    fn file_exists(&self, path: &Path) -> bool {
        let uri = path.to_string_lossy();
        if Self::is_http_uri(&uri) {
            self.cache_path(&uri).map(|p| p.exists()).unwrap_or(false)
        } else {
            path.exists()
        }
    }

    fn abs_path(&self, path: &Path) -> Option<PathBuf> {
        let uri = path.to_string_lossy();
        if Self::is_http_uri(&uri) {
            Some(path.to_path_buf())
        } else {
            fs::canonicalize(path).ok()
        }
    }

    fn read_file(&self, path: &Path) -> io::Result<BytesStr> {
        let uri = path.to_string_lossy();
        if Self::is_http_uri(&uri) {
            self.fetch(&uri).map(BytesStr::from)
        } else {
            fs::read_to_string(path).map(BytesStr::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> DiskHttpLoader {
        let dir = std::env::temp_dir().join("funee-loader-test-cache");
        DiskHttpLoader::with_cache_dir(dir).unwrap()
    }

    #[test]
    fn http_uris_are_recognized() {
        assert!(DiskHttpLoader::is_http_uri("https://example.com/mod.ts"));
        assert!(DiskHttpLoader::is_http_uri("http://localhost:8000/m.ts"));
        assert!(!DiskHttpLoader::is_http_uri("./local.ts"));
        assert!(!DiskHttpLoader::is_http_uri("/abs/path.ts"));
        assert!(!DiskHttpLoader::is_http_uri("funee"));
    }

    #[test]
    fn cache_paths_are_scheme_host_and_hash_scoped() {
        let loader = loader();
        let path = loader
            .cache_path("https://example.com/lib/mod.ts")
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(path.contains("https"));
        assert!(path.contains("example.com"));
        assert!(path.ends_with("mod.ts"));
    }

    #[test]
    fn distinct_urls_never_share_a_cache_slot() {
        let loader = loader();
        let a = loader.cache_path("https://example.com/a/mod.ts").unwrap();
        let b = loader.cache_path("https://example.com/b/mod.ts").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn urls_without_a_filename_fall_back_to_index() {
        let loader = loader();
        let path = loader.cache_path("https://example.com/").unwrap();
        assert!(path.to_string_lossy().ends_with("index.ts"));
    }
}
