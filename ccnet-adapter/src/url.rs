//! URL parsing and local-vs-remote classification.

use core::fmt::{self, Display};

use crate::AdapterError;

/// A parsed `<proto>://<host>[:<port>]<path>` URL. The scheme defaults to
/// `http`, the path to `/`, the port to the scheme's well-known port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// The default port per recognized scheme; `udp` has none (0 means
/// auto-assign on the sending socket).
pub fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        "ws" => 8080,
        "wss" => 8443,
        "mqtt" => 1883,
        "ftp" => 21,
        "ssh" => 22,
        "udp" => 0,
        _ => 80,
    }
}

impl Url {
    pub fn parse(input: &str) -> Result<Self, AdapterError> {
        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("http".to_string(), input),
        };

        let (authority, path) = match rest.find('/') {
            Some(at) => (&rest[..at], rest[at..].to_string()),
            None => (rest, "/".to_string()),
        };

        if authority.is_empty() {
            return Err(AdapterError::InvalidUrl(input.to_string()));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| AdapterError::InvalidUrl(input.to_string()))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), default_port(&scheme)),
        };

        if host.is_empty() {
            return Err(AdapterError::InvalidUrl(input.to_string()));
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }
}

impl Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

/// Whether a host lives on the local medium (as opposed to a foreign
/// network): loopback names, our own names, the emulated private ranges,
/// and the conventional node hostname prefixes.
pub fn is_local_host(host: &str, self_hostname: &str, self_fqdn: &str) -> bool {
    if host == "localhost"
        || host == "127.0.0.1"
        || host == self_hostname
        || host == self_fqdn
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host.starts_with("cc-")
        || host.starts_with("computer-")
    {
        return true;
    }

    // 172.16.0.0/12
    if let Some(rest) = host.strip_prefix("172.") {
        if let Some(second) = rest.split('.').next().and_then(|s| s.parse::<u8>().ok()) {
            return (16..=31).contains(&second);
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_urls_parse() {
        let url = Url::parse("http://alpha:8080/api/v1?x=1").unwrap();

        assert_eq!(url.scheme, "http");
        assert_eq!(url.host, "alpha");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/api/v1?x=1");
    }

    #[test]
    fn defaults_are_filled_in() {
        let url = Url::parse("alpha").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/");

        assert_eq!(Url::parse("https://alpha").unwrap().port, 443);
        assert_eq!(Url::parse("ws://alpha").unwrap().port, 8080);
        assert_eq!(Url::parse("wss://alpha").unwrap().port, 8443);
        assert_eq!(Url::parse("mqtt://broker").unwrap().port, 1883);
        assert_eq!(Url::parse("ftp://alpha").unwrap().port, 21);
        assert_eq!(Url::parse("ssh://alpha").unwrap().port, 22);
        assert_eq!(Url::parse("udp://alpha").unwrap().port, 0);
    }

    #[test]
    fn bad_urls_are_rejected() {
        assert!(Url::parse("").is_err());
        assert!(Url::parse("http://").is_err());
        assert!(Url::parse("http://alpha:notaport/").is_err());
    }

    #[test]
    fn locality_table() {
        let local = |host: &str| is_local_host(host, "alpha", "alpha.local");

        assert!(local("localhost"));
        assert!(local("127.0.0.1"));
        assert!(local("alpha"));
        assert!(local("alpha.local"));
        assert!(local("10.0.0.7"));
        assert!(local("192.168.1.20"));
        assert!(local("172.16.0.1"));
        assert!(local("172.31.255.1"));
        assert!(local("cc-42"));
        assert!(local("computer-3"));

        assert!(!local("172.15.0.1"));
        assert!(!local("172.32.0.1"));
        assert!(!local("example.com"));
        assert!(!local("beta"));
        assert!(!local("11.0.0.1"));
    }
}
