//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::fmt;

use url::Url;

use crate::{MessagingError, Result};

/// Parsed `<scheme>://<host>[:<port>]/<queue-path>` broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerUrl {
    raw: String,
    scheme: String,
    host: String,
    port: Option<u16>,
    queue_path: String,
}

impl BrokerUrl {
    /// Parse and validate a broker URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let url = Url::parse(trimmed).map_err(|_| MessagingError::InvalidUrl(raw.to_owned()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| MessagingError::InvalidUrl(raw.to_owned()))?
            .to_owned();
        let queue_path = normalize_path(url.path());
        Ok(Self {
            raw: trimmed.to_owned(),
            scheme: url.scheme().to_owned(),
            host,
            port: url.port(),
            queue_path,
        })
    }

    /// URL as given, trimmed.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if any.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host[:port]`, used to look the broker up.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    /// Queue path with duplicate slashes collapsed, always starting with `/`.
    pub fn queue_path(&self) -> &str {
        &self.queue_path
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Client id for this process: an explicit id, the path of a URL-shaped id,
/// or `/xmessage/<host>/<domain>` derived from the host name.
pub fn derive_client_id(explicit: Option<&str>) -> String {
    match explicit.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) if id.contains("://") => match BrokerUrl::parse(id) {
            Ok(url) => url.queue_path().to_owned(),
            Err(_) => id.to_owned(),
        },
        Some(id) => id.to_owned(),
        None => {
            let host = std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_owned());
            let (short, domain) = host.split_once('.').unwrap_or((host.as_str(), "localdomain"));
            format!("/xmessage/{short}/{domain}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_authority_and_queue_path() {
        let url = BrokerUrl::parse("mem://broker.example:1097//xmessage/").expect("valid url");
        assert_eq!(url.scheme(), "mem");
        assert_eq!(url.authority(), "broker.example:1097");
        assert_eq!(url.queue_path(), "/xmessage");
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(BrokerUrl::parse("not a url").is_err());
        assert!(BrokerUrl::parse("mem:///no-host").is_err());
        assert!(BrokerUrl::parse("").is_err());
    }

    #[test]
    fn client_id_strips_url_prefix() {
        assert_eq!(
            derive_client_id(Some("root://node1:1095//eos/node1/fst")),
            "/eos/node1/fst"
        );
        assert_eq!(derive_client_id(Some("/eos/node2/fst")), "/eos/node2/fst");
        assert!(derive_client_id(None).starts_with("/xmessage/"));
    }
}
