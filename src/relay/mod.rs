//! Relay-facing plumbing.
//!
//! Everything that touches the relay service besides the duplex itself:
//! HTTP client construction, URL joining, header-string parsing, and the
//! correlated path pair the two ends agree on.

mod duplex;

pub use duplex::DuplexChannel;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use rand::RngCore;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::str::FromStr;
use url::Url;

/// Immutable header pair attached to every relay exchange.
#[derive(Debug, Clone)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

/// Parse `Key: Value` header strings as given on the command line.
pub fn parse_header_strings(raw: &[String]) -> Result<Vec<HeaderEntry>> {
    raw.iter()
        .map(|s| {
            let (key, value) = s
                .split_once(':')
                .with_context(|| format!("invalid header {:?}, expected \"Key: Value\"", s))?;
            if key.trim().is_empty() {
                bail!("invalid header {:?}, empty key", s);
            }
            Ok(HeaderEntry {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Convert parsed header entries into a reqwest header map.
pub(crate) fn header_map(headers: &[HeaderEntry]) -> std::io::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for entry in headers {
        let name = HeaderName::from_str(&entry.key)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let value = HeaderValue::from_str(&entry.value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Build the HTTP client used for both relay legs.
pub fn build_http_client(insecure: bool) -> Result<Client> {
    Client::builder()
        .danger_accept_invalid_certs(insecure)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to create HTTP client")
}

/// Join a relay base URL and a path.
pub fn url_join(base: &str, path: &str) -> Result<String> {
    let mut url = Url::parse(base).with_context(|| format!("invalid relay URL {:?}", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("relay URL {:?} cannot carry a path", base))?
        .pop_if_empty()
        .extend(path.split('/'));
    Ok(url.to_string())
}

/// The correlated path pair. The client uploads on `client_to_server` and
/// downloads on `server_to_client`; the server performs the mirror image.
#[derive(Debug, Clone)]
pub struct PathPair {
    pub client_to_server: String,
    pub server_to_client: String,
}

/// Derive the path pair from the positional arguments: two explicit paths,
/// one base path expanded to `<base>/cs` + `<base>/sc`, or a random pair.
pub fn generate_paths(args: &[String]) -> Result<PathPair> {
    match args {
        [] => {
            let base = random_path();
            Ok(PathPair {
                client_to_server: format!("{}/cs", base),
                server_to_client: format!("{}/sc", base),
            })
        }
        [base] => Ok(PathPair {
            client_to_server: format!("{}/cs", base),
            server_to_client: format!("{}/sc", base),
        }),
        [cs, sc] => {
            if cs == sc {
                bail!("the two relay paths must differ");
            }
            Ok(PathPair {
                client_to_server: cs.clone(),
                server_to_client: sc.clone(),
            })
        }
        _ => bail!("expected at most two relay path arguments"),
    }
}

fn random_path() -> String {
    let mut buf = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_strings() {
        let parsed =
            parse_header_strings(&["X-Token: abc".to_string(), "Host:relay".to_string()]).unwrap();

        assert_eq!(parsed[0].key, "X-Token");
        assert_eq!(parsed[0].value, "abc");
        assert_eq!(parsed[1].key, "Host");
        assert_eq!(parsed[1].value, "relay");
    }

    #[test]
    fn test_parse_header_strings_rejects_malformed() {
        assert!(parse_header_strings(&["no-colon".to_string()]).is_err());
        assert!(parse_header_strings(&[": value".to_string()]).is_err());
    }

    #[test]
    fn test_url_join() {
        assert_eq!(
            url_join("https://relay.example", "a/b").unwrap(),
            "https://relay.example/a/b"
        );
        assert_eq!(
            url_join("https://relay.example/base/", "p").unwrap(),
            "https://relay.example/base/p"
        );
    }

    #[test]
    fn test_generate_paths_single_base() {
        let pair = generate_paths(&["job42".to_string()]).unwrap();
        assert_eq!(pair.client_to_server, "job42/cs");
        assert_eq!(pair.server_to_client, "job42/sc");
    }

    #[test]
    fn test_generate_paths_explicit_pair() {
        let pair = generate_paths(&["up".to_string(), "down".to_string()]).unwrap();
        assert_eq!(pair.client_to_server, "up");
        assert_eq!(pair.server_to_client, "down");

        assert!(generate_paths(&["same".to_string(), "same".to_string()]).is_err());
    }

    #[test]
    fn test_generate_paths_random_pair_differs_per_call() {
        let a = generate_paths(&[]).unwrap();
        let b = generate_paths(&[]).unwrap();
        assert_ne!(a.client_to_server, b.client_to_server);
        assert_ne!(a.client_to_server, a.server_to_client);
    }
}
