use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use http::{HeaderMap, HeaderName, header};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::{core::names, metrics};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HostError {
    /// Only a service name could be read from the host
    #[error("namespace not found in URL: {0}")]
    NamespaceNotFound(String),

    #[error("invalid Kubernetes URL: {0}")]
    InvalidUrl(String),

    /// Neither the override header nor Host carried a value
    #[error("request carries no host")]
    MissingHost,
}

/// Routing record for one incoming host, shared by every request to it.
#[derive(Debug)]
pub struct Host {
    pub incoming_host: String,
    pub namespace: String,
    pub source_service: String,
    pub target_service: String,
    pub source_host: String,
    pub target_host: String,
    traffic_allowed: AtomicBool,
}

impl Host {
    pub fn traffic_allowed(&self) -> bool {
        self.traffic_allowed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(incoming_host: &str, namespace: &str, service: &str) -> Self {
        let target_service = names::private_service_name(service);
        Self {
            incoming_host: incoming_host.to_string(),
            namespace: namespace.to_string(),
            source_service: service.to_string(),
            target_host: format!("http://{target_service}.{namespace}"),
            target_service,
            source_host: format!("http://{incoming_host}"),
            traffic_allowed: AtomicBool::new(true),
        }
    }
}

const LABEL: &str = "[a-zA-Z0-9-]+";

// Tried in order; the first that matches decides. Two capture groups give
// (service, namespace), one group means the namespace is missing.
static HOST_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let patterns = [
        r"http://({l})\.({l})\.svc\.cluster\.local:\d+/\*",
        r"({l})\.({l})\.svc\.cluster\.local:\d+/\*",
        r"http://({l})\.({l})\.svc\.cluster\.local:\d+",
        r"({l})\.({l})\.svc\.cluster\.local:\d+",
        r"http://({l})\.({l})\.svc\.cluster\.local",
        r"({l})\.({l})\.svc\.cluster\.local",
        r"http://({l})\.({l})\.svc",
        r"({l})\.({l})\.svc",
        r"http://({l})\.({l})",
        r"({l})\.({l})",
        r"http://({l})\.svc\.cluster\.local",
        r"({l})\.svc\.cluster\.local",
        r"http://({l})\.svc",
        r"({l})\.svc",
        r"http://({l})",
        r"({l})",
    ];
    patterns
        .iter()
        .filter_map(|p| Regex::new(&p.replace("{l}", LABEL)).ok())
        .collect()
});

/// Maps incoming hosts to routing records and gates traffic per host.
pub struct HostManager {
    hosts: scc::HashMap<String, Arc<Host>>,
    header_for_host: HeaderName,
    traffic_re_enable_duration: Duration,
}

impl HostManager {
    pub fn new(header_for_host: HeaderName, traffic_re_enable_duration: Duration) -> Self {
        Self {
            hosts: scc::HashMap::new(),
            header_for_host,
            traffic_re_enable_duration,
        }
    }

    /// Resolve the routing record for a request.
    ///
    /// The override header wins over `Host`. Repeated lookups for the same
    /// incoming host return the same shared record.
    pub async fn get_host(&self, headers: &HeaderMap) -> Result<Arc<Host>, HostError> {
        let incoming_host = headers
            .get(&self.header_for_host)
            .or_else(|| headers.get(header::HOST))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(HostError::MissingHost)?
            .to_string();

        if let Some(host) = self.hosts.read_async(&incoming_host, |_, h| h.clone()).await {
            metrics::increment_host_extraction("cache-hit", None);
            return Ok(host);
        }

        let (source_service, namespace) =
            extract_namespace_and_service(&incoming_host).inspect_err(|e| {
                metrics::increment_host_extraction("error", Some(&e.to_string()));
            })?;

        let target_service = names::private_service_name(&source_service);
        let source_host = add_http_if_needed(remove_trailing_path(remove_trailing_wildcard(
            &incoming_host,
        )));
        let target_host = add_http_if_needed(&replace_service_name(&source_host, &target_service));

        let host = Arc::new(Host {
            incoming_host: incoming_host.clone(),
            namespace,
            source_service,
            target_service,
            source_host,
            target_host,
            traffic_allowed: AtomicBool::new(true),
        });

        // A concurrent miss for the same host may have won the insert.
        let host = self
            .hosts
            .entry_async(incoming_host)
            .await
            .or_insert(host)
            .get()
            .clone();
        metrics::increment_host_extraction("cache-miss", None);
        Ok(host)
    }

    /// Close the traffic gate for a host and schedule it to reopen.
    ///
    /// Only the call that actually closes the gate schedules a reopen.
    pub async fn disable_traffic_for_host(&self, incoming_host: &str) {
        let Some(host) = self.hosts.read_async(incoming_host, |_, h| h.clone()).await else {
            return;
        };
        if host
            .traffic_allowed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        tracing::debug!(
            "Disabled traffic for host {} for {:?}",
            names::mask_middle(incoming_host, 4, 4),
            self.traffic_re_enable_duration
        );
        metrics::increment_traffic_switch(&host.source_service, false);

        let delay = self.traffic_re_enable_duration;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if host
                .traffic_allowed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::debug!(
                    "Enabled traffic for host {}",
                    names::mask_middle(&host.incoming_host, 4, 4)
                );
                metrics::increment_traffic_switch(&host.source_service, true);
            }
        });
    }
}

/// Read (service, namespace) out of a host string.
pub fn extract_namespace_and_service(url: &str) -> Result<(String, String), HostError> {
    for pattern in HOST_PATTERNS.iter() {
        let Some(captures) = pattern.captures(url) else {
            continue;
        };
        return match (captures.get(1), captures.get(2)) {
            (Some(service), Some(namespace)) => {
                Ok((service.as_str().to_string(), namespace.as_str().to_string()))
            }
            _ => Err(HostError::NamespaceNotFound(names::mask_middle(url, 4, 4))),
        };
    }
    Err(HostError::InvalidUrl(names::mask_middle(url, 4, 4)))
}

fn add_http_if_needed(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

fn remove_trailing_wildcard(url: &str) -> &str {
    url.strip_suffix("/*").unwrap_or(url)
}

fn remove_trailing_path(url: &str) -> &str {
    let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[authority_start..].find('/') {
        Some(idx) => &url[..authority_start + idx],
        None => url,
    }
}

/// Swap the first DNS label of the authority for `service`.
fn replace_service_name(url: &str, service: &str) -> String {
    let (scheme, rest) = match url.find("://") {
        Some(i) => url.split_at(i + 3),
        None => ("", url),
    };
    match rest.split_once('.') {
        Some((_, tail)) => format!("{scheme}{service}.{tail}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    const DECORATOR: &str = "x-envoy-decorator-operation";

    fn manager(cooldown: Duration) -> HostManager {
        HostManager::new(HeaderName::from_static(DECORATOR), cooldown)
    }

    fn headers(host: Option<&str>, decorator: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(v) = host {
            h.insert(header::HOST, HeaderValue::from_str(v).unwrap());
        }
        if let Some(v) = decorator {
            h.insert(DECORATOR, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn test_extract_patterns() {
        let cases = [
            ("http://svc.ns.svc.cluster.local:8080/*", ("svc", "ns")),
            ("svc.ns.svc.cluster.local:8080", ("svc", "ns")),
            ("svc.ns.svc.cluster.local", ("svc", "ns")),
            ("svc.ns.svc", ("svc", "ns")),
            ("orders.shop", ("orders", "shop")),
            ("http://orders.shop", ("orders", "shop")),
        ];
        for (input, (svc, ns)) in cases {
            let (s, n) = extract_namespace_and_service(input).unwrap();
            assert_eq!((s.as_str(), n.as_str()), (svc, ns), "input {input}");
        }
    }

    #[test]
    fn test_extract_errors() {
        assert!(matches!(
            extract_namespace_and_service("localhost:8080"),
            Err(HostError::NamespaceNotFound(_))
        ));
        assert!(matches!(
            extract_namespace_and_service("..."),
            Err(HostError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_header_overrides_host() {
        let hm = manager(Duration::from_secs(5));
        let host = hm
            .get_host(&headers(
                Some("target.com"),
                Some("service.namespace.svc.cluster.local:8080/test/*"),
            ))
            .await
            .unwrap();

        assert_eq!(
            host.incoming_host,
            "service.namespace.svc.cluster.local:8080/test/*"
        );
        assert_eq!(host.namespace, "namespace");
        assert_eq!(host.source_service, "service");
        assert_eq!(host.target_service, "elasti-service-pvt-9df6b026a8");
        assert_eq!(
            host.source_host,
            "http://service.namespace.svc.cluster.local:8080"
        );
        assert_eq!(
            host.target_host,
            "http://elasti-service-pvt-9df6b026a8.namespace.svc.cluster.local:8080"
        );
        assert!(host.traffic_allowed());
    }

    #[tokio::test]
    async fn test_repeated_lookup_returns_same_record() {
        let hm = manager(Duration::from_secs(5));
        let h = headers(Some("orders.shop.svc.cluster.local:8080"), None);
        let first = hm.get_host(&h).await.unwrap();
        let second = hm.get_host(&h).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_missing_host() {
        let hm = manager(Duration::from_secs(5));
        assert_eq!(
            hm.get_host(&HeaderMap::new()).await.unwrap_err(),
            HostError::MissingHost
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_then_reenable() {
        let hm = manager(Duration::from_secs(30));
        let h = headers(Some("orders.shop.svc.cluster.local:8080"), None);
        let host = hm.get_host(&h).await.unwrap();

        hm.disable_traffic_for_host(&host.incoming_host).await;
        assert!(!host.traffic_allowed());
        // a second disable must not schedule a second reopen
        hm.disable_traffic_for_host(&host.incoming_host).await;

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!host.traffic_allowed());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(host.traffic_allowed());
    }

    #[tokio::test]
    async fn test_disable_unknown_host_is_noop() {
        let hm = manager(Duration::from_secs(1));
        hm.disable_traffic_for_host("nobody.home").await;
    }

    #[test]
    fn test_url_helpers() {
        assert_eq!(remove_trailing_path("a.b:80/x/y"), "a.b:80");
        assert_eq!(remove_trailing_path("http://a.b:80/x"), "http://a.b:80");
        assert_eq!(remove_trailing_wildcard("a.b/*"), "a.b");
        assert_eq!(
            replace_service_name("http://svc.ns.svc:80", "pvt"),
            "http://pvt.ns.svc:80"
        );
        assert_eq!(replace_service_name("http://svc", "pvt"), "http://svc");
        assert_eq!(add_http_if_needed("https://x"), "https://x");
    }
}
