//! Default capture limits shared by the config loader and the catalog.

/// Idle window after which an in-flight exchange is force-finalized.
pub const DEFAULT_IDLE_WINDOW_MS: u64 = 15_000;

/// Concrete URLs kept per endpoint.
pub const DEFAULT_MAX_EXAMPLES: usize = 10;

/// Request and response bodies kept per endpoint.
pub const DEFAULT_MAX_SAMPLES: usize = 5;

/// Values longer than this are stored as `prefix...suffix`.
pub const DEFAULT_REDACTION_THRESHOLD: usize = 20;

/// Characters kept on each side of a redacted value.
pub const DEFAULT_REDACTION_AFFIX: usize = 10;

/// Maximum nesting depth visited when walking JSON bodies.
pub const DEFAULT_MAX_WALK_DEPTH: usize = 10;

/// Category assigned when no taxonomy rule matches.
pub const DEFAULT_CATEGORY: &str = "other";

// Header names that carry credentials, matched case-insensitively by exact name
pub const CREDENTIAL_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "x-csrf-token",
    "x-csrftoken",
    "x-xsrf-token",
    "csrf-token",
    "x-api-key",
    "api-key",
    "x-auth-token",
    "x-access-token",
    "x-session-id",
    "x-session-token",
    "x-ig-app-id",
    "x-ig-www-claim",
    "x-asbd-id",
    "x-fb-lsd",
    "x-guest-token",
];

// Body keys containing any of these fragments are treated as credential-bearing
pub const CREDENTIAL_KEY_FRAGMENTS: &[&str] =
    &["token", "auth", "session", "key", "secret", "jwt", "bearer"];

// Static asset suffixes ignored by the default traffic filter
pub const DEFAULT_IGNORE_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".mjs", ".map", ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico",
    ".woff", ".woff2", ".ttf", ".otf", ".mp4", ".webm", ".mp3",
];
