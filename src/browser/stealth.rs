//! Browser fingerprints and anti-detection patches.
//!
//! Two jobs: (1) derive a reproducible fingerprint bundle per
//! `(user_id, session_id)` so a session always looks like the same machine,
//! and (2) provide the JavaScript patch set every new page installs before
//! navigation to mask automation signals.

use sha2::{Digest, Sha256};

/// A consistent browser identity: UA + viewport + locale + timezone.
#[derive(Debug, Clone)]
pub struct FingerprintProfile {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub locale: &'static str,
    pub timezone: &'static str,
}

pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1";

struct ProfileSeed {
    user_agent: &'static str,
    viewport: (u32, u32),
}

// Desktop Chrome-family profiles only: they are the least remarkable traffic.
const PROFILE_SEEDS: &[ProfileSeed] = &[
    ProfileSeed {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        viewport: (1920, 1080),
    },
    ProfileSeed {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        viewport: (1440, 900),
    },
    ProfileSeed {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
        viewport: (1920, 1080),
    },
    ProfileSeed {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
        viewport: (1920, 1080),
    },
    ProfileSeed {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
        viewport: (1680, 1050),
    },
];

const LOCALES: &[&str] = &["en-US", "en-US", "en-GB", "en-US"];
const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Los_Angeles",
    "Europe/London",
];

impl FingerprintProfile {
    /// Deterministic: identical `(user_id, session_id)` always yields the
    /// same bundle, so a session keeps one identity across restarts.
    pub fn derive(user_id: &str, session_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(b"\x00");
        hasher.update(session_id.as_bytes());
        let digest = hasher.finalize();

        let pick = |byte: u8, len: usize| (byte as usize) % len;
        let seed = &PROFILE_SEEDS[pick(digest[0], PROFILE_SEEDS.len())];

        Self {
            user_agent: seed.user_agent.to_string(),
            viewport_width: seed.viewport.0,
            viewport_height: seed.viewport.1,
            locale: LOCALES[pick(digest[1], LOCALES.len())],
            timezone: TIMEZONES[pick(digest[2], TIMEZONES.len())],
        }
    }
}

/// Random desktop profile for stealth HTTP SERP fetches (no session binding).
pub fn random_serp_profile() -> FingerprintProfile {
    use rand::prelude::*;
    let mut rng = rand::rng();
    let seed = &PROFILE_SEEDS[rng.random_range(0..PROFILE_SEEDS.len())];
    FingerprintProfile {
        user_agent: seed.user_agent.to_string(),
        viewport_width: seed.viewport.0,
        viewport_height: seed.viewport.1,
        locale: "en-US",
        timezone: "America/New_York",
    }
}

/// Additional HTTP headers that make request fingerprints look organic.
pub fn stealth_headers() -> Vec<(String, String)> {
    vec![
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"
                .to_string(),
        ),
        ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
        ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
        ("DNT".to_string(), "1".to_string()),
        ("Connection".to_string(), "keep-alive".to_string()),
        ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
        ("Sec-Fetch-Dest".to_string(), "document".to_string()),
        ("Sec-Fetch-Mode".to_string(), "navigate".to_string()),
        ("Sec-Fetch-Site".to_string(), "none".to_string()),
        ("Cache-Control".to_string(), "max-age=0".to_string()),
    ]
}

// ───────────────────────────────────────────────────────────────────────────
// Pre-navigation JS patches
// ───────────────────────────────────────────────────────────────────────────

/// The full patch set installed on every new page via
/// `Page.addScriptToEvaluateOnNewDocument`, so they run before any page
/// script on every navigation.
pub fn stealth_init_scripts() -> Vec<String> {
    vec![
        WEBDRIVER_OVERRIDE.to_string(),
        CHROME_OBJECT.to_string(),
        PLUGINS_OVERRIDE.to_string(),
        PERMISSIONS_OVERRIDE.to_string(),
        WEBGL_VENDOR.to_string(),
        NAVIGATOR_LANGUAGES.to_string(),
        IFRAME_CONTENT_WINDOW.to_string(),
    ]
}

const WEBDRIVER_OVERRIDE: &str = r#"
// Hide the automation flag (primary detection vector)
Object.defineProperty(navigator, 'webdriver', {
  get: () => false,
  configurable: true
});
try { delete navigator.webdriver; } catch (e) {}
"#;

const CHROME_OBJECT: &str = r#"
// Real Chrome exposes window.chrome; bare CDP sessions do not
if (!window.chrome) {
  window.chrome = {
    runtime: {},
    loadTimes: function() {},
    csi: function() {},
    app: {}
  };
}
"#;

const PLUGINS_OVERRIDE: &str = r#"
// Automation contexts report zero plugins
Object.defineProperty(navigator, 'plugins', {
  get: () => [
    {
      0: {type: "application/x-google-chrome-pdf", suffixes: "pdf", description: "Portable Document Format"},
      description: "Portable Document Format",
      filename: "internal-pdf-viewer",
      length: 1,
      name: "Chrome PDF Plugin"
    },
    {
      0: {type: "application/pdf", suffixes: "pdf", description: "Portable Document Format"},
      description: "Portable Document Format",
      filename: "mhjfbmdgcfjbbpaeojofohoefgiehjai",
      length: 1,
      name: "Chrome PDF Viewer"
    },
    {
      0: {type: "application/x-nacl", suffixes: "", description: "Native Client Executable"},
      description: "",
      filename: "internal-nacl-plugin",
      length: 2,
      name: "Native Client"
    }
  ],
  configurable: true
});
"#;

const PERMISSIONS_OVERRIDE: &str = r#"
// Notification permission query must match Notification.permission
const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
if (originalQuery) {
  window.navigator.permissions.query = (parameters) => (
    parameters.name === 'notifications'
      ? Promise.resolve({ state: Notification.permission })
      : originalQuery(parameters)
  );
}
"#;

const WEBGL_VENDOR: &str = r#"
// Mask SwiftShader / headless GPU strings
const getParameter = WebGLRenderingContext.prototype.getParameter;
WebGLRenderingContext.prototype.getParameter = function(parameter) {
  if (parameter === 37445) { return 'Intel Inc.'; }              // UNMASKED_VENDOR_WEBGL
  if (parameter === 37446) { return 'Intel Iris OpenGL Engine'; } // UNMASKED_RENDERER_WEBGL
  return getParameter.apply(this, [parameter]);
};
if (typeof WebGL2RenderingContext !== 'undefined') {
  const getParameter2 = WebGL2RenderingContext.prototype.getParameter;
  WebGL2RenderingContext.prototype.getParameter = function(parameter) {
    if (parameter === 37445) return 'Intel Inc.';
    if (parameter === 37446) return 'Intel Iris OpenGL Engine';
    return getParameter2.apply(this, arguments);
  };
}
"#;

const NAVIGATOR_LANGUAGES: &str = r#"
Object.defineProperty(navigator, 'languages', {
  get: () => ['en-US', 'en'],
  configurable: true
});
"#;

const IFRAME_CONTENT_WINDOW: &str = r#"
// Keep the iframe contentWindow descriptor native-looking
try {
  const originalContentWindow = Object.getOwnPropertyDescriptor(HTMLIFrameElement.prototype, 'contentWindow');
  if (originalContentWindow) {
    Object.defineProperty(HTMLIFrameElement.prototype, 'contentWindow', {
      get: function() {
        return originalContentWindow.get.call(this);
      },
      configurable: true
    });
  }
} catch (e) {}
"#;
