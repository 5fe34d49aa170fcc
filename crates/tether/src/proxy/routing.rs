//! Group routing and credential cleaning
//!
//! A request is routed to a group by, in order: a `<group>:` prefix on its
//! API key, the `x-tether-group` header, the `group` query parameter, the
//! first label of its `Host`, or the configured default group.

use axum::http::{HeaderMap, HeaderValue, Uri, header};
use url::Url;
use url::form_urlencoded;

use super::ProxyError;
use crate::config::{Config, parse_upstream_url};

/// Header clients may use to pick a group explicitly
pub const GROUP_HEADER: &str = "x-tether-group";
/// Query parameter clients may use to pick a group explicitly
pub const GROUP_PARAM: &str = "group";

const API_KEY_HEADER: &str = "x-goog-api-key";
const KEY_PARAM: &str = "key";
const BEARER_PREFIX: &str = "Bearer ";

/// Hop-by-hop headers that should not be forwarded in either direction
pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Where the group for a request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSource {
    KeyPrefix,
    Header,
    Query,
    Subdomain,
    Default,
}

/// Client credentials with any routing prefix removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub bearer: Option<String>,
    pub query_key: Option<String>,
}

/// Everything needed to send one client request upstream
#[derive(Debug, Clone)]
pub struct Route {
    pub group: String,
    pub source: GroupSource,
    /// Full upstream URL including the cleaned query
    pub target: Url,
    pub streaming: bool,
    pub credentials: Credentials,
}

impl Route {
    /// Resolve the group, target URL and cleaned credentials for a request.
    pub fn resolve(config: &Config, uri: &Uri, headers: &HeaderMap) -> Result<Self, ProxyError> {
        let routing = &config.routing;
        let pairs: Vec<(String, String)> = uri
            .query()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let raw_api_key = header_str(headers, API_KEY_HEADER);
        let raw_bearer =
            header_str(headers, header::AUTHORIZATION.as_str()).and_then(|v| v.strip_prefix(BEARER_PREFIX));
        let raw_query_key = query_value(&pairs, KEY_PARAM);

        let key_group = [raw_api_key, raw_bearer, raw_query_key]
            .into_iter()
            .flatten()
            .find_map(|key| key_prefix(key).filter(|group| routing.is_known(group)));

        let credentials = Credentials {
            api_key: raw_api_key.map(|k| strip_group_prefix(k, key_group)),
            bearer: raw_bearer.map(|k| strip_group_prefix(k, key_group)),
            query_key: raw_query_key.map(|k| strip_group_prefix(k, key_group)),
        };

        let (group, source) = if let Some(group) = key_group {
            (group.to_string(), GroupSource::KeyPrefix)
        } else if let Some(group) = header_str(headers, GROUP_HEADER) {
            (explicit_group(config, group)?, GroupSource::Header)
        } else if let Some(group) = query_value(&pairs, GROUP_PARAM) {
            (explicit_group(config, group)?, GroupSource::Query)
        } else if let Some(group) = subdomain(headers).filter(|g| routing.is_known(g)) {
            (group.to_string(), GroupSource::Subdomain)
        } else {
            (routing.default_group.clone(), GroupSource::Default)
        };

        let group_config = routing
            .group(&group)
            .ok_or_else(|| ProxyError::Routing(format!("Unknown group '{group}'")))?;

        let base = parse_upstream_url(
            group_config
                .upstream_url
                .as_deref()
                .unwrap_or(&config.proxy.upstream_url),
        )
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

        let mut target = base.clone();
        target.set_path(&format!(
            "{}{}{}",
            base.path().trim_end_matches('/'),
            group_config.path.trim_end_matches('/'),
            uri.path()
        ));
        target.set_query(cleaned_query(&pairs, &credentials).as_deref());

        Ok(Self {
            group,
            source,
            target,
            streaming: is_streaming_request(uri),
            credentials,
        })
    }

    /// Headers to send upstream: the client's, minus hop-by-hop and routing
    /// headers, with cleaned credentials.
    ///
    /// Streaming requests also drop `accept-encoding` so the body arrives as
    /// plain text for line framing.
    pub fn upstream_headers(&self, client: &HeaderMap) -> HeaderMap {
        let mut forwarded = HeaderMap::new();
        for (name, value) in client.iter() {
            let name_str = name.as_str();
            if HOP_BY_HOP_HEADERS.contains(&name_str)
                || name == header::CONTENT_LENGTH
                || name_str == GROUP_HEADER
                || name_str == API_KEY_HEADER
                || name == header::AUTHORIZATION
                || (self.streaming && name == header::ACCEPT_ENCODING)
            {
                continue;
            }
            forwarded.append(name.clone(), value.clone());
        }

        if let Some(value) = self.credentials.api_key.as_deref().and_then(to_header_value) {
            forwarded.insert(API_KEY_HEADER, value);
        }
        if let Some(value) = self
            .credentials
            .bearer
            .as_deref()
            .and_then(|token| to_header_value(&format!("{BEARER_PREFIX}{token}")))
        {
            forwarded.insert(header::AUTHORIZATION, value);
        } else if let Some(value) = client.get(header::AUTHORIZATION) {
            // Non-bearer schemes carry no routing prefix
            forwarded.insert(header::AUTHORIZATION, value.clone());
        }

        forwarded
    }
}

/// Streaming requests name `stream` in their path or ask for `alt=sse`.
pub fn is_streaming_request(uri: &Uri) -> bool {
    if uri.path().to_ascii_lowercase().contains("stream") {
        return true;
    }
    uri.query()
        .map(|q| {
            form_urlencoded::parse(q.as_bytes())
                .any(|(k, v)| k == "alt" && v.eq_ignore_ascii_case("sse"))
        })
        .unwrap_or(false)
}

fn explicit_group(config: &Config, name: &str) -> Result<String, ProxyError> {
    if config.routing.is_known(name) {
        Ok(name.to_string())
    } else {
        Err(ProxyError::Routing(format!("Unknown group '{name}'")))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn query_value<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

fn key_prefix(key: &str) -> Option<&str> {
    key.split_once(':')
        .map(|(prefix, _)| prefix)
        .filter(|p| !p.is_empty())
}

fn strip_group_prefix(key: &str, group: Option<&str>) -> String {
    group
        .and_then(|g| key.strip_prefix(g))
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(key)
        .to_string()
}

/// First label of a dotted `Host`, ignoring any port
fn subdomain(headers: &HeaderMap) -> Option<&str> {
    let host = header_str(headers, header::HOST.as_str())?;
    let host = host.rsplit_once(':').map_or(host, |(name, _)| name);
    let (label, _) = host.split_once('.')?;
    Some(label).filter(|l| !l.is_empty())
}

fn cleaned_query(pairs: &[(String, String)], credentials: &Credentials) -> Option<String> {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    let mut any = false;
    for (k, v) in pairs {
        if k == GROUP_PARAM {
            continue;
        }
        let value = match (k.as_str(), credentials.query_key.as_deref()) {
            (KEY_PARAM, Some(cleaned)) => cleaned,
            _ => v.as_str(),
        };
        serializer.append_pair(k, value);
        any = true;
    }
    any.then(|| serializer.finish())
}

fn to_header_value(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}
