/// Parsed `Cache-Control` directives relevant to a shared cache.
///
/// Only the directives the proxy acts on are kept; everything else in the
/// header is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_store: bool,
    pub no_cache: bool,
    /// `max-age` in seconds.
    pub max_age: Option<u64>,
    /// `s-maxage` in seconds. Takes precedence over `max-age` for shared caches.
    pub s_maxage: Option<u64>,
    /// `stale-while-revalidate` in seconds.
    pub stale_while_revalidate: Option<u64>,
}

impl CacheControl {
    /// Parses a raw header value. A missing header yields the empty set.
    ///
    /// Directive names are matched case-insensitively. Numeric directives whose
    /// value does not parse as a non-negative integer are dropped.
    pub fn parse(value: Option<&str>) -> Self {
        let mut cc = Self::default();
        let Some(value) = value else {
            return cc;
        };

        for directive in value.split(',') {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }

            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                None => (directive, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "public" => cc.public = true,
                "private" => cc.private = true,
                "no-store" => cc.no_store = true,
                "no-cache" => cc.no_cache = true,
                "max-age" => cc.max_age = arg.and_then(parse_seconds),
                "s-maxage" => cc.s_maxage = arg.and_then(parse_seconds),
                "stale-while-revalidate" => {
                    cc.stale_while_revalidate = arg.and_then(parse_seconds)
                }
                _ => {}
            }
        }

        cc
    }

    /// Freshness lifetime for a shared cache: `s-maxage`, falling back to `max-age`.
    pub fn freshness_secs(&self) -> Option<u64> {
        self.s_maxage.or(self.max_age)
    }

    /// Whether these directives allow a shared cache to store and reuse the response.
    pub fn allows_shared_storage(&self) -> bool {
        self.public
            && !self.private
            && !self.no_store
            && !self.no_cache
            && self.freshness_secs().is_some_and(|secs| secs > 0)
    }
}

fn parse_seconds(raw: &str) -> Option<u64> {
    raw.parse::<u64>().ok()
}
