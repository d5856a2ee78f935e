//! Outbound dialing, optionally through a SOCKS5 proxy
//!
//! The proxy is taken from the environment with the usual precedence:
//! `ALL_PROXY` > `HTTPS_PROXY` > `HTTP_PROXY`, upper-case before lower-case.
//! A value without a scheme is treated as `socks5://`.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::SshError;

const PROXY_ENV_VARS: [&str; 6] = [
    "ALL_PROXY",
    "all_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "HTTP_PROXY",
    "http_proxy",
];

/// SOCKS5 proxy endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct Socks5Proxy {
    pub host: String,
    pub port: u16,
    pub auth: Option<(String, String)>,
}

impl std::fmt::Debug for Socks5Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Proxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth", &self.auth.as_ref().map(|(user, _)| user))
            .finish()
    }
}

impl Socks5Proxy {
    /// Parse `socks5://[user:pass@]host:port`; other schemes are rejected
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        let rest = match value.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = scheme.to_ascii_lowercase();
                if scheme != "socks5" && scheme != "socks5h" {
                    return None;
                }
                rest
            }
            None => value,
        };
        let rest = rest.trim_end_matches('/');

        let (auth, endpoint) = match rest.rsplit_once('@') {
            Some((creds, endpoint)) => {
                let (user, pass) = creds.split_once(':').unwrap_or((creds, ""));
                (Some((user.to_string(), pass.to_string())), endpoint)
            }
            None => (None, rest),
        };

        let (host, port) = endpoint.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }

        Some(Self {
            host: host.to_string(),
            port,
            auth,
        })
    }

    /// First usable proxy from the environment
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        for name in PROXY_ENV_VARS {
            let Some(value) = lookup(name) else { continue };
            if value.trim().is_empty() {
                continue;
            }
            match Self::parse(&value) {
                Some(proxy) => {
                    debug!("Using SOCKS5 proxy from {}: {}:{}", name, proxy.host, proxy.port);
                    return Some(proxy);
                }
                None => warn!("Ignoring unsupported proxy in {}", name),
            }
        }
        None
    }
}

/// Open a TCP stream to `host:port`, directly or through `proxy`
pub async fn dial(
    host: &str,
    port: u16,
    proxy: Option<&Socks5Proxy>,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    let stream = match proxy {
        None => timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SshError::Timeout(format!("Connecting to {}:{} timed out", host, port)))?
            .map_err(|e| SshError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?,
        Some(proxy) => connect_socks5(proxy, host, port, connect_timeout).await?,
    };

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}

async fn connect_socks5(
    proxy: &Socks5Proxy,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use tokio_socks::tcp::Socks5Stream;

    let proxy_addr = tokio::net::lookup_host((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| SshError::Proxy(format!("Failed to resolve proxy {}: {}", proxy.host, e)))?
        .next()
        .ok_or_else(|| SshError::Proxy(format!("No address found for proxy {}", proxy.host)))?;
    let target = (target_host, target_port);

    let stream = if let Some((username, password)) = &proxy.auth {
        timeout(
            connect_timeout,
            Socks5Stream::connect_with_password(proxy_addr, target, username, password),
        )
        .await
        .map_err(|_| SshError::Proxy("SOCKS5 proxy connection timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("SOCKS5 proxy connection failed: {}", e)))?
    } else {
        timeout(connect_timeout, Socks5Stream::connect(proxy_addr, target))
            .await
            .map_err(|_| SshError::Proxy("SOCKS5 proxy connection timeout".to_string()))?
            .map_err(|e| SshError::Proxy(format!("SOCKS5 proxy connection failed: {}", e)))?
    };

    Ok(stream.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_variants() {
        let proxy = Socks5Proxy::parse("127.0.0.1:1080").unwrap();
        assert_eq!(proxy.host, "127.0.0.1");
        assert_eq!(proxy.port, 1080);
        assert!(proxy.auth.is_none());

        let proxy = Socks5Proxy::parse("socks5://user:pw@proxy.local:9050/").unwrap();
        assert_eq!(proxy.host, "proxy.local");
        assert_eq!(proxy.auth, Some(("user".into(), "pw".into())));

        assert!(Socks5Proxy::parse("http://proxy:3128").is_none());
        assert!(Socks5Proxy::parse("proxy-without-port").is_none());
    }

    #[test]
    fn test_env_precedence() {
        let env: HashMap<&str, &str> = [
            ("HTTP_PROXY", "socks5://low:1"),
            ("https_proxy", "mid:2"),
            ("ALL_PROXY", ""),
        ]
        .into_iter()
        .collect();

        let proxy = Socks5Proxy::from_lookup(|name| env.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(proxy.host, "mid");
        assert_eq!(proxy.port, 2);
    }

    #[test]
    fn test_debug_hides_password() {
        let proxy = Socks5Proxy::parse("socks5://user:topsecret@p:1").unwrap();
        assert!(!format!("{:?}", proxy).contains("topsecret"));
    }

    #[tokio::test]
    async fn test_dial_refused_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial("127.0.0.1", port, None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
