//! Endpoint classification: request path → rate-limit profile name.
//!
//! A small ordered rule set, first match wins. Pure — no state, no failure
//! modes; anything unmatched lands on the default profile.

/// Ordered (needle, profile) rules. Substring match against the path.
const RULES: &[(&str, &str)] = &[
    ("/auth", "auth"),
    ("/login", "auth"),
    ("/register", "auth"),
    ("/upload", "upload"),
    ("/search", "search"),
    ("/api", "api"),
];

const DEFAULT_PROFILE: &str = "default";

/// Map a request path to a profile name.
pub fn classify(path: &str) -> &'static str {
    for (needle, profile) in RULES {
        if path.contains(needle) {
            return profile;
        }
    }
    DEFAULT_PROFILE
}

/// Every profile name the classifier can emit, for startup validation.
pub fn profile_names() -> impl Iterator<Item = &'static str> {
    RULES
        .iter()
        .map(|(_, profile)| *profile)
        .chain(std::iter::once(DEFAULT_PROFILE))
}
