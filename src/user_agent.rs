//! Shared User-Agent strings for the HTTP and browser transports.
//!
//! Single source for project URL and UA format so all provider traffic
//! stays consistent and easy to update (good citizenship; RFC 9308).

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/mangasync";

/// Default User-Agent for provider requests (identifies the tool).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("mangasync/{version} (library-sync-tool; +{PROJECT_UA_URL})")
}

/// Browser-like User-Agent for the scripted-browser transport, where sites
/// refuse non-browser identities outright.
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
