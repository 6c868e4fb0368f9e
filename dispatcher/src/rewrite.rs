//! Rewrites that keep backend addresses away from clients.

use bytes::Bytes;
use http::HeaderMap;
use http::header::HeaderValue;
use serde_json::{Map, Value};
use url::Url;

use crate::merger::X_STORAGE_URL;
use crate::orchestrator::X_OBJECT_MANIFEST;

/// The address clients use to reach the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicOrigin {
    origin: String,
}

impl PublicOrigin {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        PublicOrigin {
            origin: format!("{scheme}://{host}:{port}"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.origin
    }

    /// `<origin>[/<location>]<path>[?<query>]`
    pub fn url_for(&self, location: Option<&str>, path: &str, query: Option<&str>) -> String {
        let mut url = self.origin.clone();
        if let Some(location) = location {
            url.push('/');
            url.push_str(location);
        }
        url.push_str(path);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Moves a backend storage URL under this origin and the location prefix.
    pub fn rewrite_storage_url(&self, value: &str, location: Option<&str>) -> Option<String> {
        let parsed = Url::parse(value).ok()?;
        Some(self.url_for(location, parsed.path(), parsed.query()))
    }

    pub fn rewrite_storage_header(&self, headers: &mut HeaderMap, location: Option<&str>) {
        let rewritten = headers
            .get(X_STORAGE_URL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| self.rewrite_storage_url(v, location))
            .and_then(|v| HeaderValue::from_str(&v).ok());
        if let Some(value) = rewritten {
            headers.insert(X_STORAGE_URL, value);
        }
    }

    /// Rewrites the URLs of a `{"storage": {...}}` auth body. `None` when the body is not
    /// such JSON, in which case it is relayed untouched.
    pub fn rewrite_storage_body(&self, body: &[u8], location: Option<&str>) -> Option<Bytes> {
        let Value::Object(mut parsed) = serde_json::from_slice::<Value>(body).ok()? else {
            return None;
        };
        let Some(Value::Object(entries)) = parsed.remove("storage") else {
            return None;
        };
        let storage: Map<String, Value> = entries
            .into_iter()
            .map(|(key, value)| {
                let rewritten = value
                    .as_str()
                    .and_then(|v| self.rewrite_storage_url(v, location));
                match rewritten {
                    Some(url) => (key, Value::String(url)),
                    None => (key, value),
                }
            })
            .collect();

        let mut rewritten = Map::new();
        rewritten.insert("storage".to_string(), Value::Object(storage));
        serde_json::to_vec(&Value::Object(rewritten))
            .ok()
            .map(Bytes::from)
    }
}

/// Gives a manifest header from a prefixed cluster its container prefix back.
pub fn add_manifest_prefix(headers: &mut HeaderMap, prefix: &str, separator: char) {
    let Some(manifest) = headers
        .get(X_OBJECT_MANIFEST)
        .and_then(|v| v.to_str().ok())
    else {
        return;
    };
    let prefixed = format!("{prefix}{separator}{}", manifest.trim_start_matches('/'));
    if let Ok(value) = HeaderValue::from_str(&prefixed) {
        headers.insert(X_OBJECT_MANIFEST, value);
    }
}
