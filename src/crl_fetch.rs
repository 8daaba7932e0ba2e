//! CRL retrieval from distribution point URIs.
//!
//! Supported schemes: `http`, `https`, `file`, plus `ftp` and `ldap` when
//! the matching cargo features are enabled. LDAP URIs follow RFC 4516: the
//! path is the entry DN and the CRL is read from the
//! `certificateRevocationList;binary` attribute of that entry.

use std::fs;
use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::error::{IcpError, Result};

/// Attribute holding a CA's CRL in directory entries.
pub const CRL_ATTRIBUTE: &str = "certificateRevocationList;binary";

/// Downloads raw CRL bytes (DER or PEM) from a URI.
pub trait CrlFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Scheme-dispatching fetcher used by the trust validator.
#[derive(Debug, Clone)]
pub struct TransportFetcher {
    timeout: Duration,
}

impl TransportFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn fetch_http(&self, uri: &str) -> Result<Vec<u8>> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| IcpError::transport(uri, e))?;
        let response = client
            .get(uri)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| IcpError::transport(uri, e))?;
        let body = response.bytes().map_err(|e| IcpError::transport(uri, e))?;
        Ok(body.to_vec())
    }

    fn fetch_file(&self, uri: &str, url: &Url) -> Result<Vec<u8>> {
        let path = url
            .to_file_path()
            .map_err(|_| IcpError::transport(uri, "not a local file path"))?;
        fs::read(&path).map_err(|e| IcpError::transport(uri, e))
    }

    #[cfg(feature = "ftp")]
    fn fetch_ftp(&self, uri: &str, url: &Url) -> Result<Vec<u8>> {
        use std::net::ToSocketAddrs;
        use suppaftp::types::FileType;
        use suppaftp::FtpStream;

        let host = url
            .host_str()
            .ok_or_else(|| IcpError::transport(uri, "missing host"))?;
        let port = url.port_or_known_default().unwrap_or(21);
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| IcpError::transport(uri, e))?
            .next()
            .ok_or_else(|| IcpError::transport(uri, "host did not resolve"))?;
        let path = decoded_path(uri, url)?;

        let mut ftp =
            FtpStream::connect_timeout(addr, self.timeout).map_err(|e| IcpError::transport(uri, e))?;
        ftp.login("anonymous", "anonymous@")
            .map_err(|e| IcpError::transport(uri, e))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| IcpError::transport(uri, e))?;
        let data = ftp
            .retr_as_buffer(&path)
            .map_err(|e| IcpError::transport(uri, e))?
            .into_inner();
        if let Err(e) = ftp.quit() {
            debug!(uri, error = %e, "ftp quit failed");
        }
        Ok(data)
    }

    #[cfg(feature = "ldap")]
    fn fetch_ldap(&self, uri: &str, url: &Url) -> Result<Vec<u8>> {
        use ldap3::{LdapConn, LdapConnSettings, Scope, SearchEntry};

        let (server, dn) = ldap_target(uri, url)?;
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let mut ldap =
            LdapConn::with_settings(settings, &server).map_err(|e| IcpError::transport(uri, e))?;
        let searched = ldap
            .search(&dn, Scope::Base, "(objectClass=*)", vec![CRL_ATTRIBUTE])
            .and_then(|result| result.success());
        if let Err(e) = ldap.unbind() {
            debug!(uri, error = %e, "ldap unbind failed");
        }
        let (entries, _) = searched.map_err(|e| IcpError::transport(uri, e))?;

        for entry in entries {
            let entry = SearchEntry::construct(entry);
            let binary = entry.bin_attrs.into_iter();
            let text = entry
                .attrs
                .into_iter()
                .map(|(name, values)| {
                    let values: Vec<Vec<u8>> = values.into_iter().map(String::into_bytes).collect();
                    (name, values)
                });
            for (name, values) in binary.chain(text) {
                if !name
                    .to_ascii_lowercase()
                    .starts_with("certificaterevocationlist")
                {
                    continue;
                }
                if let Some(crl) = values.into_iter().find(|v| !v.is_empty()) {
                    return Ok(crl);
                }
            }
        }
        Err(IcpError::transport(uri, format!("no {} in {}", CRL_ATTRIBUTE, dn)))
    }
}

impl CrlFetcher for TransportFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        let url = Url::parse(uri).map_err(|e| IcpError::transport(uri, e))?;
        debug!(uri, scheme = url.scheme(), "fetching CRL");
        match url.scheme() {
            "http" | "https" => self.fetch_http(uri),
            "file" => self.fetch_file(uri, &url),
            #[cfg(feature = "ftp")]
            "ftp" => self.fetch_ftp(uri, &url),
            #[cfg(feature = "ldap")]
            "ldap" => self.fetch_ldap(uri, &url),
            other => Err(IcpError::Unsupported(format!(
                "CRL distribution point scheme {}",
                other
            ))),
        }
    }
}

#[cfg(any(feature = "ftp", feature = "ldap"))]
fn decoded_path(uri: &str, url: &Url) -> Result<String> {
    urlencoding::decode(url.path())
        .map(|p| p.into_owned())
        .map_err(|e| IcpError::transport(uri, e))
}

/// Server URL and entry DN of an LDAP distribution point.
#[cfg(feature = "ldap")]
fn ldap_target(uri: &str, url: &Url) -> Result<(String, String)> {
    let host = url
        .host_str()
        .ok_or_else(|| IcpError::transport(uri, "missing host"))?;
    let server = format!("ldap://{}:{}", host, url.port().unwrap_or(389));
    let dn = decoded_path(uri, url)?
        .trim_start_matches('/')
        .to_string();
    if dn.is_empty() {
        return Err(IcpError::transport(uri, "missing entry DN"));
    }
    Ok((server, dn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn file_uris_read_local_crls() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lcr.crl");
        fs::write(&path, b"\x30\x82crl").unwrap();
        let uri = Url::from_file_path(&path).unwrap().to_string();

        let fetcher = TransportFetcher::new(Duration::from_secs(1));
        assert_eq!(fetcher.fetch(&uri).unwrap(), b"\x30\x82crl");

        let missing = Url::from_file_path(tmp.path().join("nope.crl"))
            .unwrap()
            .to_string();
        assert_eq!(fetcher.fetch(&missing).unwrap_err().kind(), ErrorKind::Transport);
    }

    #[test]
    fn unknown_schemes_are_unsupported() {
        let fetcher = TransportFetcher::new(Duration::from_secs(1));
        let err = fetcher.fetch("gopher://example.br/crl").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn malformed_uri_is_a_transport_error() {
        let fetcher = TransportFetcher::new(Duration::from_secs(1));
        assert_eq!(
            fetcher.fetch("not a uri").unwrap_err().kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn unreachable_http_is_a_transport_error() {
        let fetcher = TransportFetcher::new(Duration::from_secs(2));
        let err = fetcher.fetch("http://127.0.0.1:9/lcr.crl").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("127.0.0.1:9"));
    }

    #[cfg(feature = "ldap")]
    #[test]
    fn ldap_uri_yields_server_and_dn() {
        let uri = "ldap://ldap.example.br/CN=AC%20Teste,OU=ICP-Brasil,O=Gov,C=BR?certificateRevocationList;binary";
        let url = Url::parse(uri).unwrap();
        let (server, dn) = ldap_target(uri, &url).unwrap();
        assert_eq!(server, "ldap://ldap.example.br:389");
        assert_eq!(dn, "CN=AC Teste,OU=ICP-Brasil,O=Gov,C=BR");

        let bare = Url::parse("ldap://ldap.example.br:1389").unwrap();
        assert!(ldap_target("ldap://ldap.example.br:1389", &bare).is_err());
    }
}
