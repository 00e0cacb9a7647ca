//! Whitelist matching.
//!
//! A host is allowed when it equals a listed domain or is a subdomain of one,
//! at any depth. Matching is label-aligned: `notexample.com` does not match
//! `example.com`.

use std::net::Ipv6Addr;
use std::sync::Arc;

use allowgate_storage::{AllowedDomains, DomainSource};

/// Checks a host against a set of allowed domains.
///
/// Comparison is exact on the stored values; callers normalize case first.
///
/// # Examples
///
/// ```
/// use allowgate_proxy::is_allowed;
/// use std::collections::HashSet;
///
/// let allowed: HashSet<String> = ["example.com".to_string()].into();
/// assert!(is_allowed("example.com", &allowed));
/// assert!(is_allowed("api.example.com", &allowed));
/// assert!(!is_allowed("notexample.com", &allowed));
/// assert!(!is_allowed("example.com.evil.com", &allowed));
/// ```
pub fn is_allowed(host: &str, allowed: &AllowedDomains) -> bool {
    if host.is_empty() {
        return false;
    }

    allowed.iter().any(|domain| {
        host == domain
            || host
                .strip_suffix(domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}

/// Strips an optional port (and IPv6 brackets) from a `host[:port]` authority.
pub fn host_without_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Splits a `host[:port]` authority into its host and port.
///
/// Only DNS names, IPv4 addresses and bracketed IPv6 addresses are
/// accepted. Userinfo, paths, queries and fragments are rejected along with
/// any other character that could move the host once the authority is
/// placed into a URL.
///
/// # Examples
///
/// ```
/// use allowgate_proxy::split_authority;
///
/// assert_eq!(split_authority("example.com:8080"), Some(("example.com", Some(8080))));
/// assert_eq!(split_authority("[::1]"), Some(("::1", None)));
/// assert_eq!(split_authority("evil.com/?.example.com"), None);
/// ```
pub fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    let (host, port) = match authority.strip_prefix('[') {
        Some(rest) => {
            let (host, after) = rest.split_once(']')?;
            host.parse::<Ipv6Addr>().ok()?;
            match after {
                "" => (host, None),
                _ => (host, Some(after.strip_prefix(':')?)),
            }
        }
        None => {
            let (host, port) = match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            };
            if !is_host_name(host) {
                return None;
            }
            (host, port)
        }
    };

    let port = match port {
        None => None,
        Some(port) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            Some(port.parse().ok()?)
        }
        Some(_) => return None,
    };

    Some((host, port))
}

fn is_host_name(host: &str) -> bool {
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}

/// The oracle bound to a live domain source.
///
/// Every check reloads the source so whitelist edits apply immediately.
/// Loading runs on the blocking pool; the source may be a file on a slow disk.
#[derive(Clone)]
pub struct Whitelist {
    source: Arc<dyn DomainSource>,
}

impl std::fmt::Debug for Whitelist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Whitelist")
            .field("source", &"DomainSource")
            .finish()
    }
}

impl Whitelist {
    pub fn new(source: Arc<dyn DomainSource>) -> Self {
        Self { source }
    }

    /// Checks a bare host, ignoring case.
    ///
    /// A source that cannot be loaded denies.
    pub async fn check(&self, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();
        let source = Arc::clone(&self.source);
        let allowed = match tokio::task::spawn_blocking(move || source.load()).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!("Whitelist load failed: {}", e);
                return false;
            }
        };
        let verdict = is_allowed(&host, &allowed);

        tracing::debug!(
            host = %host,
            domains = allowed.len(),
            allowed = verdict,
            "Whitelist check"
        );

        verdict
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn set(domains: &[&str]) -> AllowedDomains {
        domains.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn exact_and_subdomain_match() {
        let allowed = set(&["example.com"]);
        assert!(is_allowed("example.com", &allowed));
        assert!(is_allowed("api.example.com", &allowed));
        assert!(is_allowed("a.b.c.example.com", &allowed));
    }

    #[test]
    fn lookalikes_do_not_match() {
        let allowed = set(&["example.com"]);
        assert!(!is_allowed("notexample.com", &allowed));
        assert!(!is_allowed("example.com.evil.com", &allowed));
        assert!(!is_allowed("example.co", &allowed));
        assert!(!is_allowed(".example.co", &allowed));
    }

    #[test]
    fn empty_inputs_deny() {
        assert!(!is_allowed("", &set(&["example.com"])));
        assert!(!is_allowed("example.com", &set(&[])));
        assert!(!is_allowed("", &set(&[])));
    }

    #[test]
    fn comparison_is_case_sensitive() {
        let allowed = set(&["example.com"]);
        assert!(!is_allowed("EXAMPLE.com", &allowed));
    }

    #[test]
    fn any_domain_in_set_can_match() {
        let allowed = set(&["docs.rs", "crates.io", "rust-lang.org"]);
        assert!(is_allowed("static.crates.io", &allowed));
        assert!(is_allowed("doc.rust-lang.org", &allowed));
        assert!(!is_allowed("github.com", &allowed));
    }

    #[test]
    fn host_without_port_cases() {
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("example.com:8080"), "example.com");
        assert_eq!(host_without_port("[::1]:443"), "::1");
        assert_eq!(host_without_port("[::1]"), "::1");
        assert_eq!(host_without_port("example.com:abc"), "example.com:abc");
    }

    #[test]
    fn split_authority_accepts_plain_authorities() {
        assert_eq!(split_authority("example.com"), Some(("example.com", None)));
        assert_eq!(split_authority("example.com:80"), Some(("example.com", Some(80))));
        assert_eq!(split_authority("127.0.0.1:8080"), Some(("127.0.0.1", Some(8080))));
        assert_eq!(split_authority("[::1]:443"), Some(("::1", Some(443))));
        assert_eq!(split_authority("my_host.local"), Some(("my_host.local", None)));
    }

    #[test]
    fn split_authority_rejects_smuggled_hosts() {
        for authority in [
            "evil.com/?.allowed.test",
            "evil.com?.allowed.test",
            "evil.com#.allowed.test",
            "evil.com\\.allowed.test",
            "evil.com@allowed.test",
            "allowed.test@evil.com",
            "127.0.0.1:1/?.allowed.test",
            "evil.com%2f.allowed.test",
            "evil.com:.allowed.test",
            "example.com:",
            "example.com:+80",
            "example.com:70000",
            "[evil.com]:80",
            "[::1",
            "[::1]x",
            "::1",
            "",
        ] {
            assert_eq!(split_authority(authority), None, "{}", authority);
        }
    }

    #[tokio::test]
    async fn whitelist_normalizes_host() {
        let whitelist = Whitelist::new(Arc::new(set(&["example.com"])));
        assert!(whitelist.check(" API.Example.com ").await);
        assert!(!whitelist.check("evil.com").await);
        assert!(!whitelist.check("").await);
    }

    #[tokio::test]
    async fn whitelist_reloads_on_every_check() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(allowgate_storage::WhitelistStore::new(
            temp_dir.path().join("whitelist.json"),
        ));
        let whitelist = Whitelist::new(store.clone());

        assert!(!whitelist.check("docs.rs").await);
        store.add("docs.rs").unwrap();
        assert!(whitelist.check("docs.rs").await);
    }

    struct SlowSource(AllowedDomains);

    impl DomainSource for SlowSource {
        fn load(&self) -> AllowedDomains {
            std::thread::sleep(Duration::from_millis(300));
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn slow_source_does_not_stall_other_tasks() {
        let whitelist = Whitelist::new(Arc::new(SlowSource(set(&["docs.rs"]))));
        let check = tokio::spawn(async move { whitelist.check("docs.rs").await });

        // On the single-threaded test runtime a load on the worker would
        // hold this timer back until it finished.
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(check.await.unwrap());
    }
}
