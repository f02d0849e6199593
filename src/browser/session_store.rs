//! Per-(session, domain) cookie persistence.
//!
//! After any successful fetch the page's cookies are saved to
//! `<state>/sessions/{session_id}/{domain_key}.json` so the next fetch of
//! the same domain inside the same session is already authenticated and
//! already trusted by whatever consent walls were clicked through. Loads
//! fall back to the parent domain so one stored session covers subdomains.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::PageHandle;

/// Filesystem-safe key derived from a bare hostname string.
fn host_to_key(host: &str) -> String {
    host.replace('.', "_").replace(':', "_")
}

/// Derive the session filename key from a URL.
///
/// e.g. `https://gist.github.com/foo` → `"gist_github_com"`
pub fn domain_key(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(host_to_key))
}

/// Key for the *parent* domain of a hostname (one subdomain level stripped).
///
/// Returns `None` when the host is already a bare second-level domain.
pub fn parent_domain_key(host: &str) -> Option<String> {
    let dot_pos = host.find('.')?;
    let rest = &host[dot_pos + 1..];
    // Require at least one more dot so we never return a bare TLD.
    if rest.contains('.') {
        Some(host_to_key(rest))
    } else {
        None
    }
}

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// `root` is the sessions directory, typically `<state>/sessions`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for_key(&self, session_id: &str, key: &str) -> PathBuf {
        self.root
            .join(sanitize_session_id(session_id))
            .join(format!("{}.json", key))
    }

    fn load_by_key(&self, session_id: &str, key: &str) -> Option<Vec<serde_json::Value>> {
        let path = self.path_for_key(session_id, key);
        if !path.exists() {
            return None;
        }
        let content = std::fs::read_to_string(&path).ok()?;
        let cookies: Vec<serde_json::Value> = serde_json::from_str(&content).ok()?;
        if cookies.is_empty() {
            return None;
        }
        info!(
            "[SessionStore] loaded {} cookies for key '{}' ({})",
            cookies.len(),
            key,
            path.display()
        );
        Some(cookies)
    }

    /// Load stored cookies for the domain of `url`.
    ///
    /// Subdomain fallback: if nothing exists for the full hostname
    /// (`gist.github.com`), the parent domain (`github.com`) is tried before
    /// returning `None`.
    pub fn load(&self, session_id: &str, url: &str) -> Option<Vec<serde_json::Value>> {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))?;

        let exact_key = host_to_key(&host);
        if let Some(raw) = self.load_by_key(session_id, &exact_key) {
            return Some(raw);
        }

        if let Some(parent_key) = parent_domain_key(&host) {
            if let Some(raw) = self.load_by_key(session_id, &parent_key) {
                info!(
                    "[SessionStore] subdomain fallback — using parent session '{}' for '{}'",
                    parent_key, exact_key
                );
                return Some(raw);
            }
        }

        None
    }

    /// Persist cookies atomically (temp file + rename).
    pub fn save(&self, session_id: &str, url: &str, cookies: &[serde_json::Value]) -> Result<()> {
        let Some(key) = domain_key(url) else {
            return Ok(()); // unparseable URL, nothing to key on
        };
        let path = self.path_for_key(session_id, &key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating session dir {}", parent.display()))?;
        }

        let serialized = serde_json::to_string(cookies).context("serializing cookies")?;
        atomic_write(&path, serialized.as_bytes())?;
        debug!(
            "[SessionStore] saved {} cookies to {}",
            cookies.len(),
            path.display()
        );
        Ok(())
    }

    /// Remove the stored session file for a domain so the next fetch starts
    /// cold (used when a site invalidates its cookies).
    pub fn invalidate(&self, session_id: &str, url: &str) {
        if let Some(key) = domain_key(url) {
            let path = self.path_for_key(session_id, &key);
            if path.exists() {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!("[SessionStore] removed stale session {}", path.display()),
                    Err(e) => warn!(
                        "[SessionStore] failed to remove session file {}: {}",
                        path.display(),
                        e
                    ),
                }
            }
        }
    }

    /// Load cookies for `url` and inject them into `page`, returning whether
    /// anything was injected. Call before `goto` so the cookies ride on the
    /// initial request.
    pub async fn auto_inject(&self, session_id: &str, page: &dyn PageHandle, url: &str) -> bool {
        if let Some(raw) = self.load(session_id, url) {
            match page.set_cookies(&raw).await {
                Ok(()) => return true,
                Err(e) => warn!("[SessionStore] cookie injection failed: {}", e),
            }
        }
        false
    }

    /// Read the page's cookies and persist them for this (session, domain).
    pub async fn persist_from_page(
        &self,
        session_id: &str,
        page: &dyn PageHandle,
        url: &str,
    ) -> Result<()> {
        let cookies = page.get_cookies().await?;
        if cookies.is_empty() {
            return Ok(());
        }
        self.save(session_id, url, &cookies)
    }
}

/// Write-to-temp-then-rename so a crash mid-write never corrupts the file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string()),
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| {
        let _ = std::fs::remove_file(&tmp);
        format!("renaming {} → {}", tmp.display(), path.display())
    })?;
    Ok(())
}

fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
