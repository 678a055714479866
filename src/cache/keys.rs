//! Canonical cache keys.
//!
//! A [`CacheKey`] serializes to a single colon-separated string:
//!
//! ```text
//! [version:]namespace:[tenant:<tenantId>:][user:<userId>:][tags:<sorted,csv>:]key
//! ```
//!
//! Segments are omitted when the field is absent. That string is the only
//! artifact shared with external tiers, so formatting and parsing are pure
//! functions and `CacheKey::parse(&key.to_canonical()) == Ok(key)` holds for
//! every key built through [`CacheKey::new`] or [`KeyFactory::create`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

pub const SEPARATOR: char = ':';
const TAG_JOINER: char = ',';
const TENANT_SEGMENT: &str = "tenant";
const USER_SEGMENT: &str = "user";
const TAGS_SEGMENT: &str = "tags";
const WILDCARD: char = '*';

/// A structured cache key.
///
/// Fields are private so every key passes through sanitization. Tags are kept
/// sorted and de-duplicated, which makes equality independent of the order in
/// which they were supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    tags: Vec<String>,
}

/// Optional key segments supplied at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyOptions {
    pub namespace: Option<String>,
    pub version: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
}

impl KeyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

impl CacheKey {
    /// Build a key, sanitizing every segment.
    ///
    /// Fails with [`CacheError::InvalidKey`] when the base key, namespace, tenant
    /// or user id is empty after sanitization, when the version is not of the
    /// form `v<digits>[.<digits>]*`, or when the namespace would be ambiguous
    /// on parse (a reserved segment name or a version-shaped token).
    pub fn new(key: &str, options: &KeyOptions) -> CacheResult<Self> {
        let key = sanitize_key(key);
        if key.is_empty() {
            return Err(CacheError::invalid_key("key is empty after sanitization"));
        }

        let namespace = options
            .namespace
            .as_deref()
            .map(sanitize_namespace)
            .transpose()?;
        let version = options
            .version
            .as_deref()
            .map(normalize_version)
            .transpose()?;
        let tenant_id = options
            .tenant_id
            .as_deref()
            .map(|id| sanitize_id("tenant id", id))
            .transpose()?;
        let user_id = options
            .user_id
            .as_deref()
            .map(|id| sanitize_id("user id", id))
            .transpose()?;

        Ok(Self {
            key,
            namespace,
            version,
            tenant_id,
            user_id,
            tags: sanitize_tags(&options.tags),
        })
    }

    /// Parse a canonical key string.
    ///
    /// Consumes, left to right: an optional version token, an optional
    /// namespace token (never the final segment), then the optional `tenant`,
    /// `user` and `tags` blocks in that order. Whatever remains is re-joined
    /// with the separator and becomes the base key.
    pub fn parse(input: &str) -> CacheResult<Self> {
        if input.trim().is_empty() {
            return Err(CacheError::invalid_key("key string is empty"));
        }

        let tokens: Vec<&str> = input.split(SEPARATOR).collect();
        let last = tokens.len() - 1;
        let mut idx = 0;

        let mut version = None;
        if idx < last && is_version_token(tokens[idx]) {
            version = Some(tokens[idx].to_string());
            idx += 1;
        }

        let mut namespace = None;
        if idx < last && !is_reserved_segment(tokens[idx]) {
            namespace = Some(tokens[idx].to_string());
            idx += 1;
        }

        let mut blocks: [(&str, Option<String>); 3] =
            [(TENANT_SEGMENT, None), (USER_SEGMENT, None), (TAGS_SEGMENT, None)];
        for (name, slot) in blocks.iter_mut() {
            // A block needs its value token and must leave the key behind it.
            if idx + 1 < last && tokens[idx] == *name {
                *slot = Some(tokens[idx + 1].to_string());
                idx += 2;
            }
        }
        let [(_, tenant_id), (_, user_id), (_, tags)] = blocks;

        let key = tokens[idx..].join(&SEPARATOR.to_string());
        if key.is_empty() {
            return Err(CacheError::invalid_key(format!(
                "key string `{input}` has an empty base key"
            )));
        }

        let tags = tags
            .map(|csv| {
                csv.split(TAG_JOINER)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            key,
            namespace,
            version,
            tenant_id,
            user_id,
            tags,
        })
    }

    /// The canonical string used as the lookup key in every store.
    pub fn to_canonical(&self) -> String {
        let mut out = String::with_capacity(self.key.len() + 32);
        write_prefix(
            &mut out,
            self.version.as_deref(),
            self.namespace.as_deref(),
            self.tenant_id.as_deref(),
            self.user_id.as_deref(),
            &self.tags,
        );
        out.push_str(&self.key);
        out
    }

    /// Glob match (`*` = any run of characters) against the canonical string.
    pub fn matches(&self, pattern: &str) -> bool {
        glob_match(pattern, &self.to_canonical())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags.iter().any(|tag| tags.contains(tag))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

impl FromStr for CacheKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Builds keys with process-wide defaults for namespace and version.
#[derive(Debug, Clone, Default)]
pub struct KeyFactory {
    default_namespace: Option<String>,
    default_version: Option<String>,
}

impl KeyFactory {
    /// Create a factory. Defaults are validated eagerly so a bad setting fails
    /// at startup instead of on the first key.
    pub fn new(
        default_namespace: Option<String>,
        default_version: Option<String>,
    ) -> CacheResult<Self> {
        let default_namespace = default_namespace
            .as_deref()
            .map(sanitize_namespace)
            .transpose()?;
        let default_version = default_version
            .as_deref()
            .map(normalize_version)
            .transpose()?;
        Ok(Self {
            default_namespace,
            default_version,
        })
    }

    pub fn create(&self, key: &str, options: KeyOptions) -> CacheResult<CacheKey> {
        CacheKey::new(key, &self.with_defaults(options))
    }

    pub fn format(&self, key: &CacheKey) -> String {
        key.to_canonical()
    }

    pub fn parse(&self, input: &str) -> CacheResult<CacheKey> {
        CacheKey::parse(input)
    }

    /// Build a glob pattern: the canonical prefix for `options`, then the raw
    /// (unsanitized) pattern, then an implicit trailing wildcard.
    pub fn create_pattern(&self, pattern: &str, options: KeyOptions) -> CacheResult<String> {
        let options = self.with_defaults(options);
        let namespace = options
            .namespace
            .as_deref()
            .map(sanitize_namespace)
            .transpose()?;
        let version = options
            .version
            .as_deref()
            .map(normalize_version)
            .transpose()?;
        let tenant_id = options
            .tenant_id
            .as_deref()
            .map(|id| sanitize_id("tenant id", id))
            .transpose()?;
        let user_id = options
            .user_id
            .as_deref()
            .map(|id| sanitize_id("user id", id))
            .transpose()?;

        let mut out = String::new();
        write_prefix(
            &mut out,
            version.as_deref(),
            namespace.as_deref(),
            tenant_id.as_deref(),
            user_id.as_deref(),
            &sanitize_tags(&options.tags),
        );
        out.push_str(pattern);
        if !out.ends_with(WILDCARD) {
            out.push(WILDCARD);
        }
        Ok(out)
    }

    pub fn match_pattern(&self, key: &CacheKey, pattern: &str) -> bool {
        key.matches(pattern)
    }

    pub fn default_namespace(&self) -> Option<&str> {
        self.default_namespace.as_deref()
    }

    fn with_defaults(&self, mut options: KeyOptions) -> KeyOptions {
        if options.namespace.is_none() {
            options.namespace = self.default_namespace.clone();
        }
        if options.version.is_none() {
            options.version = self.default_version.clone();
        }
        options
    }
}

/// A key selector for stores that can enumerate their contents.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Glob over the canonical string.
    Glob(String),
    /// Regular expression over the canonical string.
    Regex(Regex),
}

impl KeyPattern {
    pub fn regex(pattern: &str) -> CacheResult<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|err| CacheError::invalid_key(format!("invalid regex `{pattern}`: {err}")))
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::Glob(pattern) => key.matches(pattern),
            Self::Regex(regex) => regex.is_match(&key.to_canonical()),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glob(pattern) => write!(f, "glob:{pattern}"),
            Self::Regex(regex) => write!(f, "regex:{}", regex.as_str()),
        }
    }
}

// ============================================================================
// Sanitization
// ============================================================================

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Keep `[A-Za-z0-9-_.]`, replace everything else with `_`.
pub fn sanitize_key(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if is_key_char(c) { c } else { '_' })
        .collect()
}

fn sanitize_id(field: &str, raw: &str) -> CacheResult<String> {
    let cleaned = sanitize_key(raw);
    if cleaned.is_empty() {
        return Err(CacheError::invalid_key(format!(
            "{field} is empty after sanitization"
        )));
    }
    Ok(cleaned)
}

/// Sanitize a namespace and reject tokens the parser would misread.
pub fn sanitize_namespace(raw: &str) -> CacheResult<String> {
    let cleaned = sanitize_id("namespace", raw)?;
    if is_reserved_segment(&cleaned) {
        return Err(CacheError::invalid_key(format!(
            "namespace `{cleaned}` is a reserved segment name"
        )));
    }
    if is_version_token(&cleaned) {
        return Err(CacheError::invalid_key(format!(
            "namespace `{cleaned}` is indistinguishable from a version token"
        )));
    }
    Ok(cleaned)
}

/// Normalize `2`, `v2` or `V2.1` to `v2` / `v2.1`.
pub fn normalize_version(raw: &str) -> CacheResult<String> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    let candidate = format!("v{digits}");
    if is_version_token(&candidate) {
        Ok(candidate)
    } else {
        Err(CacheError::invalid_key(format!(
            "version `{raw}` must look like v<digits>[.<digits>]"
        )))
    }
}

/// Sanitize, drop empties, de-duplicate and sort.
pub fn sanitize_tags<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    tags.iter()
        .map(|tag| sanitize_key(tag.as_ref()))
        .filter(|tag| !tag.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn is_reserved_segment(token: &str) -> bool {
    matches!(token, TENANT_SEGMENT | USER_SEGMENT | TAGS_SEGMENT)
}

fn is_version_token(token: &str) -> bool {
    let Some(rest) = token.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty()
        && rest
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

fn write_prefix(
    out: &mut String,
    version: Option<&str>,
    namespace: Option<&str>,
    tenant_id: Option<&str>,
    user_id: Option<&str>,
    tags: &[String],
) {
    let mut push = |segment: &str| {
        out.push_str(segment);
        out.push(SEPARATOR);
    };

    if let Some(version) = version {
        push(version);
    }
    if let Some(namespace) = namespace {
        push(namespace);
    }
    if let Some(tenant) = tenant_id {
        push(TENANT_SEGMENT);
        push(tenant);
    }
    if let Some(user) = user_id {
        push(USER_SEGMENT);
        push(user);
    }
    if !tags.is_empty() {
        push(TAGS_SEGMENT);
        push(&tags.join(&TAG_JOINER.to_string()));
    }
}

/// Glob matching where `*` matches any (possibly empty) run of characters.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        if p < pattern.len() && pattern[p] == WILDCARD {
            backtrack = Some((p, c));
            p += 1;
        } else if p < pattern.len() && pattern[p] == candidate[c] {
            p += 1;
            c += 1;
        } else if let Some((star_p, star_c)) = backtrack {
            p = star_p + 1;
            c = star_c + 1;
            backtrack = Some((star_p, star_c + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&ch| ch == WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_key() -> CacheKey {
        CacheKey::new(
            "profile",
            &KeyOptions::new()
                .namespace("users")
                .version("2")
                .tenant("acme")
                .user("42")
                .tags(["b", "a", "b"]),
        )
        .expect("valid key")
    }

    #[test]
    fn canonical_form_orders_segments() {
        assert_eq!(
            full_key().to_canonical(),
            "v2:users:tenant:acme:user:42:tags:a,b:profile"
        );
    }

    #[test]
    fn absent_segments_are_omitted() {
        let bare = CacheKey::new("profile", &KeyOptions::new()).expect("valid key");
        assert_eq!(bare.to_canonical(), "profile");

        let tenant_only =
            CacheKey::new("profile", &KeyOptions::new().tenant("acme")).expect("valid key");
        assert_eq!(tenant_only.to_canonical(), "tenant:acme:profile");
    }

    #[test]
    fn parse_inverts_canonical_form() {
        let key = full_key();
        let parsed = CacheKey::parse(&key.to_canonical()).expect("parse");
        assert_eq!(parsed, key);
        assert_eq!(parsed.tags(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn parse_handles_partial_forms() {
        let parsed = CacheKey::parse("v1:tenant:t1:item").expect("parse");
        assert_eq!(parsed.version(), Some("v1"));
        assert_eq!(parsed.namespace(), None);
        assert_eq!(parsed.tenant_id(), Some("t1"));
        assert_eq!(parsed.key(), "item");

        let parsed = CacheKey::parse("ns:user:u1:item").expect("parse");
        assert_eq!(parsed.namespace(), Some("ns"));
        assert_eq!(parsed.user_id(), Some("u1"));

        let parsed = CacheKey::parse("tenant").expect("parse");
        assert_eq!(parsed.key(), "tenant");
        assert_eq!(parsed.namespace(), None);
    }

    #[test]
    fn parse_rejoins_unrecognized_remainder() {
        let parsed = CacheKey::parse("ns:a:b:c").expect("parse");
        assert_eq!(parsed.namespace(), Some("ns"));
        assert_eq!(parsed.key(), "a:b:c");
    }

    #[test]
    fn parse_rejects_empty_input() {
        assert!(matches!(
            CacheKey::parse(""),
            Err(CacheError::InvalidKey { .. })
        ));
        assert!(matches!(
            CacheKey::parse("ns:"),
            Err(CacheError::InvalidKey { .. })
        ));
    }

    #[test]
    fn sanitization_replaces_disallowed_characters() {
        let key = CacheKey::new(" user profile/42 ", &KeyOptions::new().namespace("my ns"))
            .expect("valid key");
        assert_eq!(key.key(), "user_profile_42");
        assert_eq!(key.namespace(), Some("my_ns"));
        assert_eq!(key.to_canonical(), "my_ns:user_profile_42");
    }

    #[test]
    fn empty_segments_are_rejected() {
        assert!(CacheKey::new("", &KeyOptions::new()).is_err());
        assert!(CacheKey::new("   ", &KeyOptions::new()).is_err());
        assert!(CacheKey::new("k", &KeyOptions::new().namespace(" ")).is_err());
        assert!(CacheKey::new("k", &KeyOptions::new().tenant("")).is_err());
        assert!(CacheKey::new("k", &KeyOptions::new().user("  ")).is_err());
    }

    #[test]
    fn ambiguous_namespaces_are_rejected() {
        assert!(CacheKey::new("k", &KeyOptions::new().namespace("tenant")).is_err());
        assert!(CacheKey::new("k", &KeyOptions::new().namespace("v3")).is_err());
        assert!(CacheKey::new("k", &KeyOptions::new().namespace("vendors")).is_ok());
    }

    #[test]
    fn versions_are_normalized() {
        assert_eq!(normalize_version("3").expect("version"), "v3");
        assert_eq!(normalize_version("V1.2").expect("version"), "v1.2");
        assert!(normalize_version("latest").is_err());
        assert!(normalize_version("v").is_err());
    }

    #[test]
    fn tags_are_order_independent() {
        let a = CacheKey::new("k", &KeyOptions::new().tags(["x", "y"])).expect("key");
        let b = CacheKey::new("k", &KeyOptions::new().tags(["y", "x", "x"])).expect("key");
        assert_eq!(a, b);
        assert_eq!(a.to_canonical(), "tags:x,y:k");
    }

    #[test]
    fn tag_sanitization_strips_separators() {
        assert_eq!(
            sanitize_tags(&["a,b", "c:d", " ", "a,b"]),
            vec!["a_b".to_string(), "c_d".to_string()]
        );
    }

    #[test]
    fn factory_applies_defaults() {
        let factory = KeyFactory::new(Some("app".to_string()), Some("1".to_string()))
            .expect("factory");
        let key = factory.create("item", KeyOptions::new()).expect("key");
        assert_eq!(factory.format(&key), "v1:app:item");

        let overridden = factory
            .create("item", KeyOptions::new().namespace("other"))
            .expect("key");
        assert_eq!(overridden.namespace(), Some("other"));
    }

    #[test]
    fn factory_rejects_invalid_defaults() {
        assert!(KeyFactory::new(Some("user".to_string()), None).is_err());
        assert!(KeyFactory::new(None, Some("beta".to_string())).is_err());
    }

    #[test]
    fn create_pattern_appends_raw_pattern_and_wildcard() {
        let factory = KeyFactory::default();
        let pattern = factory
            .create_pattern("user:*profile", KeyOptions::new().namespace("app").tenant("t1"))
            .expect("pattern");
        assert_eq!(pattern, "app:tenant:t1:user:*profile*");

        let pattern = factory
            .create_pattern("session*", KeyOptions::new().namespace("auth"))
            .expect("pattern");
        assert_eq!(pattern, "auth:session*");
    }

    #[test]
    fn match_pattern_uses_glob_semantics() {
        let factory = KeyFactory::default();
        let key = full_key();
        assert!(factory.match_pattern(&key, "v2:users:*"));
        assert!(factory.match_pattern(&key, "*:profile"));
        assert!(factory.match_pattern(&key, "*acme*42*"));
        assert!(!factory.match_pattern(&key, "users:*"));
        assert!(!factory.match_pattern(&key, "*:profiles"));
    }

    #[test]
    fn glob_match_edge_cases() {
        assert!(glob_match("*", ""));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "a"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
        assert!(glob_match("**a", "bba"));
    }

    #[test]
    fn key_pattern_regex_matches_canonical_string() {
        let pattern = KeyPattern::regex(r"^v2:users:.*:profile$").expect("regex");
        assert!(pattern.matches(&full_key()));
        assert!(KeyPattern::regex("(").is_err());
    }
}
