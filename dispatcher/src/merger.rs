//! Folding the answers of several clusters into one response.

use crate::body::BackendResponse;
use crate::rewrite::PublicOrigin;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue};
use http::HeaderMap;
use quick_xml::events::attributes::{AttrError, Attribute};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use serde_json::{Map, Value};
use std::borrow::Cow;
use thiserror::Error;
use url::Url;

/// Joins per-cluster tokens and storage URLs.
pub const TOKEN_JOINER: &str = "__@@__";

pub const X_STORAGE_URL: HeaderName = HeaderName::from_static("x-storage-url");
pub const X_AUTH_TOKEN: HeaderName = HeaderName::from_static("x-auth-token");
pub const X_STORAGE_TOKEN: HeaderName = HeaderName::from_static("x-storage-token");
pub const X_ACCOUNT_BYTES_USED: HeaderName = HeaderName::from_static("x-account-bytes-used");
pub const X_ACCOUNT_CONTAINER_COUNT: HeaderName =
    HeaderName::from_static("x-account-container-count");
pub const X_ACCOUNT_OBJECT_COUNT: HeaderName = HeaderName::from_static("x-account-object-count");

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("invalid JSON listing: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid XML listing: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("writing the merged listing failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid XML attribute: {0}")]
    Attribute(#[from] AttrError),
}

/// How a header of several cluster responses ends up in the merged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPolicy {
    StorageUrl,
    JoinTokens,
    Sum,
    Drop,
    PassthroughLastWins,
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn header_policy(name: &HeaderName) -> HeaderPolicy {
    if name == X_STORAGE_URL {
        HeaderPolicy::StorageUrl
    } else if name == X_AUTH_TOKEN || name == X_STORAGE_TOKEN {
        HeaderPolicy::JoinTokens
    } else if name == X_ACCOUNT_BYTES_USED
        || name == X_ACCOUNT_CONTAINER_COUNT
        || name == X_ACCOUNT_OBJECT_COUNT
    {
        HeaderPolicy::Sum
    } else if name == CONTENT_LENGTH || HOP_BY_HOP.contains(&name.as_str()) {
        HeaderPolicy::Drop
    } else {
        HeaderPolicy::PassthroughLastWins
    }
}

/// Per-cluster tokens of a merged token, in cluster order. `None` when the token was
/// not produced by a merge.
pub fn split_token(token: &str) -> Option<Vec<&str>> {
    if !token.contains(TOKEN_JOINER) {
        return None;
    }
    Some(token.split(TOKEN_JOINER).collect())
}

/// The response with the largest status when any cluster did not answer 2xx.
pub fn check_error_resp(responses: &mut Vec<BackendResponse>) -> Option<BackendResponse> {
    if responses.iter().all(|r| r.is_success()) {
        return None;
    }
    // Final non-2xx statuses all sort above 2xx, so the maximum is always a failure
    let worst = responses.iter().map(|r| r.status).max()?;
    let index = responses.iter().position(|r| r.status == worst)?;
    Some(responses.remove(index))
}

pub struct Merger {
    origin: PublicOrigin,
    separator: char,
}

impl Merger {
    pub fn new(origin: PublicOrigin, separator: char) -> Self {
        Merger { origin, separator }
    }

    /// One storage URL standing for all of `urls`.
    ///
    /// Clusters that agree on the path share it; otherwise the URLs themselves are
    /// encoded into the path.
    pub fn merged_storage_url(&self, location: &str, urls: &[&str]) -> String {
        let paths: Vec<Option<String>> = urls
            .iter()
            .map(|u| Url::parse(u).ok().map(|u| u.path().to_string()))
            .collect();
        let common = match paths.first() {
            Some(Some(first)) if paths.iter().all(|p| p.as_deref() == Some(first)) => {
                Some(first.clone())
            }
            _ => None,
        };
        let path = common
            .unwrap_or_else(|| format!("/{}", URL_SAFE.encode(urls.join(TOKEN_JOINER))));
        self.origin.url_for(Some(location), &path, None)
    }

    /// Merges the headers of successful cluster responses, in cluster order.
    pub fn merge_headers(&self, location: &str, responses: &[&HeaderMap]) -> HeaderMap {
        let mut merged = HeaderMap::new();
        let mut storage_urls = Vec::new();
        let mut tokens = Vec::new();
        let mut sums: Vec<(HeaderName, u64)> = Vec::new();

        for headers in responses {
            if let Some(url) = headers.get(X_STORAGE_URL).and_then(|v| v.to_str().ok()) {
                storage_urls.push(url);
            }
            let token = headers
                .get(X_AUTH_TOKEN)
                .or_else(|| headers.get(X_STORAGE_TOKEN))
                .and_then(|v| v.to_str().ok());
            if let Some(token) = token {
                tokens.push(token);
            }

            for name in headers.keys() {
                match header_policy(name) {
                    HeaderPolicy::Sum => {
                        let value = headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.trim().parse::<u64>().ok());
                        let Some(value) = value else {
                            continue;
                        };
                        match sums.iter_mut().find(|(n, _)| n == name) {
                            Some((_, total)) => *total += value,
                            None => sums.push((name.clone(), value)),
                        }
                    }
                    HeaderPolicy::PassthroughLastWins => {
                        merged.remove(name);
                        for value in headers.get_all(name) {
                            merged.append(name.clone(), value.clone());
                        }
                    }
                    HeaderPolicy::StorageUrl | HeaderPolicy::JoinTokens | HeaderPolicy::Drop => {}
                }
            }
        }

        if !storage_urls.is_empty() {
            let url = self.merged_storage_url(location, &storage_urls);
            if let Ok(value) = HeaderValue::from_str(&url) {
                merged.insert(X_STORAGE_URL, value);
            }
        }
        if !tokens.is_empty()
            && let Ok(value) = HeaderValue::from_str(&tokens.join(TOKEN_JOINER))
        {
            merged.insert(X_AUTH_TOKEN, value.clone());
            merged.insert(X_STORAGE_TOKEN, value);
        }
        for (name, total) in sums {
            merged.insert(name, HeaderValue::from(total));
        }
        merged
    }

    /// Merges `{"storage": {...}}` auth bodies. Bodies that are not such JSON are skipped.
    pub fn merge_storage_body(&self, location: &str, bodies: &[Bytes]) -> Option<Bytes> {
        let mut storage = Map::new();
        let mut urls = Vec::new();
        let mut url_key = None;

        for body in bodies {
            let Ok(Value::Object(mut parsed)) = serde_json::from_slice::<Value>(body) else {
                continue;
            };
            let Some(Value::Object(entries)) = parsed.remove("storage") else {
                continue;
            };
            for (key, value) in entries {
                let Value::String(value) = value else {
                    storage.insert(key, value);
                    continue;
                };
                if Url::parse(&value).is_ok() {
                    urls.push(value);
                    url_key = Some(key);
                } else {
                    storage.insert(key, Value::String(value));
                }
            }
        }

        if let Some(key) = url_key {
            let urls: Vec<&str> = urls.iter().map(String::as_str).collect();
            storage.insert(
                key,
                Value::String(self.merged_storage_url(location, &urls)),
            );
        }
        if storage.is_empty() {
            return None;
        }
        let mut merged = Map::new();
        merged.insert("storage".to_string(), Value::Object(storage));
        serde_json::to_vec(&Value::Object(merged))
            .ok()
            .map(Bytes::from)
    }

    /// Joins the container listings of several clusters, prefixing every container name
    /// with the prefix of the cluster it lives in. `None` for formats that cannot be merged.
    pub fn merge_container_listings(
        &self,
        content_type: &str,
        bodies: &[Bytes],
        prefixes: &[&str],
    ) -> Result<Option<Bytes>, MergeError> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let merged = match mime.as_str() {
            "text/plain" => self.merge_text(bodies, prefixes),
            "application/json" => self.merge_json(bodies, prefixes)?,
            "application/xml" | "text/xml" => self.merge_xml(bodies, prefixes)?,
            _ => return Ok(None),
        };
        Ok(Some(Bytes::from(merged)))
    }

    fn prefixed(&self, prefix: &str, name: &str) -> String {
        format!("{prefix}{}{name}", self.separator)
    }

    fn merge_text(&self, bodies: &[Bytes], prefixes: &[&str]) -> Vec<u8> {
        let mut names: Vec<String> = bodies
            .iter()
            .zip(prefixes)
            .flat_map(|(body, prefix)| {
                String::from_utf8_lossy(body)
                    .split('\n')
                    .filter(|line| !line.is_empty())
                    .map(|line| self.prefixed(prefix, line))
                    .collect::<Vec<_>>()
            })
            .collect();
        names.sort();
        names.join("\n").into_bytes()
    }

    fn merge_json(&self, bodies: &[Bytes], prefixes: &[&str]) -> Result<Vec<u8>, MergeError> {
        let mut merged = Vec::new();
        for (body, prefix) in bodies.iter().zip(prefixes) {
            let entries: Vec<Map<String, Value>> = serde_json::from_slice(body)?;
            for mut entry in entries {
                if let Some(Value::String(name)) = entry.get("name") {
                    let renamed = self.prefixed(prefix, name);
                    entry.insert("name".to_string(), Value::String(renamed));
                }
                merged.push(Value::Object(entry));
            }
        }
        Ok(serde_json::to_vec(&merged)?)
    }

    fn merge_xml(&self, bodies: &[Bytes], prefixes: &[&str]) -> Result<Vec<u8>, MergeError> {
        let mut containers = Writer::new(Vec::new());
        let mut account_name: Option<Vec<u8>> = None;

        for (body, prefix) in bodies.iter().zip(prefixes) {
            let mut reader = Reader::from_reader(body.as_ref());
            reader.config_mut().trim_text(true);
            let mut depth = 0usize;
            let mut in_container = false;

            loop {
                let event = reader.read_event()?;
                match &event {
                    Event::Eof => break,
                    Event::Start(start) => {
                        depth += 1;
                        if depth == 1 && start.name().as_ref() == b"account" {
                            if let Some(name) = start.try_get_attribute("name")? {
                                account_name = Some(name.value.into_owned());
                            }
                            continue;
                        }
                        if depth == 2 && start.name().as_ref() == b"container" {
                            in_container = true;
                        }
                        if in_container {
                            containers.write_event(event.borrow())?;
                            if depth == 3 && start.name().as_ref() == b"name" {
                                let prefix = format!("{prefix}{}", self.separator);
                                containers.write_event(Event::Text(BytesText::new(&prefix)))?;
                            }
                        }
                    }
                    Event::End(_) => {
                        if in_container {
                            containers.write_event(event.borrow())?;
                        }
                        if depth == 2 {
                            in_container = false;
                        }
                        depth = depth.saturating_sub(1);
                    }
                    Event::Decl(_) | Event::DocType(_) | Event::PI(_) | Event::Comment(_) => {}
                    _ => {
                        if in_container {
                            containers.write_event(event.borrow())?;
                        }
                    }
                }
            }
        }

        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let mut account = BytesStart::new("account");
        if let Some(name) = &account_name {
            account.push_attribute(Attribute {
                key: QName(b"name"),
                value: Cow::Borrowed(name.as_slice()),
            });
        }
        writer.write_event(Event::Start(account))?;
        writer.get_mut().extend_from_slice(&containers.into_inner());
        writer.write_event(Event::End(BytesEnd::new("account")))?;
        Ok(writer.into_inner())
    }
}

/// `headers` with the merged token swapped for the token of one cluster.
pub fn with_cluster_token(headers: &HeaderMap, token: &str) -> HeaderMap {
    let mut headers = headers.clone();
    headers.remove(X_STORAGE_TOKEN);
    match HeaderValue::from_str(token) {
        Ok(value) => {
            headers.insert(X_AUTH_TOKEN, value);
        }
        Err(_) => {
            headers.remove(X_AUTH_TOKEN);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn merger() -> Merger {
        Merger::new(PublicOrigin::new("http", "dispatcher", 8000), ':')
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_header_policy() {
        assert_eq!(header_policy(&X_STORAGE_URL), HeaderPolicy::StorageUrl);
        assert_eq!(header_policy(&X_STORAGE_TOKEN), HeaderPolicy::JoinTokens);
        assert_eq!(header_policy(&X_ACCOUNT_OBJECT_COUNT), HeaderPolicy::Sum);
        assert_eq!(header_policy(&CONTENT_LENGTH), HeaderPolicy::Drop);
        assert_eq!(
            header_policy(&HeaderName::from_static("transfer-encoding")),
            HeaderPolicy::Drop
        );
        assert_eq!(
            header_policy(&HeaderName::from_static("x-trans-id")),
            HeaderPolicy::PassthroughLastWins
        );
    }

    #[test]
    fn test_token_join_and_split() {
        let a = headers(&[("x-auth-token", "AUTH_tka")]);
        let b = headers(&[("x-storage-token", "AUTH_tkb")]);
        let merged = merger().merge_headers("union", &[&a, &b]);
        let joined = merged.get(X_AUTH_TOKEN).unwrap().to_str().unwrap();
        assert_eq!(joined, "AUTH_tka__@@__AUTH_tkb");
        assert_eq!(merged.get(X_STORAGE_TOKEN).unwrap(), joined);

        assert_eq!(split_token(joined), Some(vec!["AUTH_tka", "AUTH_tkb"]));
        assert_eq!(split_token("AUTH_tka"), None);
    }

    #[test]
    fn test_with_cluster_token() {
        let merged = headers(&[
            ("x-auth-token", "AUTH_tka__@@__AUTH_tkb"),
            ("x-storage-token", "AUTH_tka__@@__AUTH_tkb"),
            ("accept", "application/json"),
        ]);
        let cluster = with_cluster_token(&merged, "AUTH_tkb");
        assert_eq!(cluster.get(X_AUTH_TOKEN).unwrap(), "AUTH_tkb");
        assert!(cluster.get(X_STORAGE_TOKEN).is_none());
        assert_eq!(cluster.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_merge_headers() {
        let a = headers(&[
            ("x-storage-url", "http://swift-a1:8080/v1/AUTH_test"),
            ("x-account-container-count", "2"),
            ("x-account-bytes-used", "100"),
            ("content-length", "10"),
            ("x-trans-id", "tx-a"),
        ]);
        let b = headers(&[
            ("x-storage-url", "http://swift-b1:8080/v1/AUTH_test"),
            ("x-account-container-count", "3"),
            ("x-account-bytes-used", "0"),
            ("content-length", "20"),
            ("x-trans-id", "tx-b"),
            ("connection", "close"),
        ]);
        let merged = merger().merge_headers("union", &[&a, &b]);
        assert_eq!(
            merged.get(X_STORAGE_URL).unwrap(),
            "http://dispatcher:8000/union/v1/AUTH_test"
        );
        assert_eq!(merged.get(X_ACCOUNT_CONTAINER_COUNT).unwrap(), "5");
        assert_eq!(merged.get(X_ACCOUNT_BYTES_USED).unwrap(), "100");
        assert!(merged.get(X_ACCOUNT_OBJECT_COUNT).is_none());
        assert!(merged.get(CONTENT_LENGTH).is_none());
        assert!(merged.get("connection").is_none());
        assert_eq!(merged.get("x-trans-id").unwrap(), "tx-b");
    }

    #[test]
    fn test_storage_url_without_common_path() {
        let urls = ["http://swift-a1:8080/v1/AUTH_a", "http://swift-b1:8080/v1/AUTH_b"];
        let merged = merger().merged_storage_url("union", &urls);
        let encoded = URL_SAFE.encode(urls.join(TOKEN_JOINER));
        assert_eq!(merged, format!("http://dispatcher:8000/union/{encoded}"));
    }

    #[test]
    fn test_merge_storage_body() {
        let a = Bytes::from_static(
            br#"{"storage": {"default": "local", "local": "http://swift-a1:8080/v1/AUTH_test"}}"#,
        );
        let b = Bytes::from_static(
            br#"{"storage": {"default": "local", "local": "http://swift-b1:8080/v1/AUTH_test"}}"#,
        );
        let garbage = Bytes::from_static(b"not json");
        let merged = merger()
            .merge_storage_body("union", &[a, garbage, b])
            .unwrap();
        let parsed: Value = serde_json::from_slice(&merged).unwrap();
        assert_eq!(parsed["storage"]["default"], "local");
        assert_eq!(
            parsed["storage"]["local"],
            "http://dispatcher:8000/union/v1/AUTH_test"
        );

        assert!(
            merger()
                .merge_storage_body("union", &[Bytes::from_static(b"<html/>")])
                .is_none()
        );
    }

    #[test]
    fn test_merge_json_listing() {
        let merged = merger()
            .merge_container_listings(
                "application/json; charset=utf-8",
                &[
                    Bytes::from_static(br#"[{"name":"x"}]"#),
                    Bytes::from_static(br#"[{"name":"y"}]"#),
                ],
                &["p1", "p2"],
            )
            .unwrap()
            .unwrap();
        assert_eq!(merged, r#"[{"name":"p1:x"},{"name":"p2:y"}]"#);
    }

    #[test]
    fn test_merge_text_listing() {
        let merged = merger()
            .merge_container_listings(
                "text/plain; charset=utf-8",
                &[
                    Bytes::from_static(b"photos\nmusic\n"),
                    Bytes::from_static(b"docs\n"),
                ],
                &["b", "a"],
            )
            .unwrap()
            .unwrap();
        assert_eq!(merged, "a:docs\nb:music\nb:photos");
    }

    #[test]
    fn test_merge_xml_listing() {
        let a = Bytes::from_static(
            br#"<?xml version="1.0" encoding="UTF-8"?>
<account name="AUTH_test">
  <container><name>photos</name><count>1</count><bytes>10</bytes></container>
</account>"#,
        );
        let b = Bytes::from_static(
            br#"<?xml version="1.0" encoding="UTF-8"?>
<account name="AUTH_test">
  <container><name>r&amp;d</name><count>2</count><bytes>20</bytes></container>
</account>"#,
        );
        let merged = merger()
            .merge_container_listings("application/xml", &[a, b], &["a", "b"])
            .unwrap()
            .unwrap();
        let merged = String::from_utf8(merged.to_vec()).unwrap();
        assert_eq!(
            merged,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><account name=\"AUTH_test\">\
             <container><name>a:photos</name><count>1</count><bytes>10</bytes></container>\
             <container><name>b:r&amp;d</name><count>2</count><bytes>20</bytes></container>\
             </account>"
        );
    }

    #[test]
    fn test_unsupported_listing_format() {
        let merged = merger()
            .merge_container_listings("text/html", &[Bytes::new()], &["a"])
            .unwrap();
        assert!(merged.is_none());

        let err = merger()
            .merge_container_listings("application/json", &[Bytes::from_static(b"{")], &["a"])
            .unwrap_err();
        assert!(matches!(err, MergeError::Json(_)));
    }

    #[test]
    fn test_check_error_resp() {
        let mut responses: Vec<BackendResponse> = [200u16, 404, 507]
            .into_iter()
            .map(|s| {
                BackendResponse::buffered(
                    StatusCode::from_u16(s).unwrap(),
                    HeaderMap::new(),
                    Bytes::new(),
                )
            })
            .collect();
        let worst = check_error_resp(&mut responses).unwrap();
        assert_eq!(worst.status, StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(responses.len(), 2);

        let mut all_ok = vec![
            BackendResponse::buffered(StatusCode::OK, HeaderMap::new(), Bytes::new()),
            BackendResponse::buffered(StatusCode::NO_CONTENT, HeaderMap::new(), Bytes::new()),
        ];
        assert!(check_error_resp(&mut all_ok).is_none());

        let mut redirected = vec![
            BackendResponse::buffered(StatusCode::PARTIAL_CONTENT, HeaderMap::new(), Bytes::new()),
            BackendResponse::buffered(StatusCode::NOT_MODIFIED, HeaderMap::new(), Bytes::new()),
        ];
        let worst = check_error_resp(&mut redirected).unwrap();
        assert_eq!(worst.status, StatusCode::NOT_MODIFIED);
        assert_eq!(redirected[0].status, StatusCode::PARTIAL_CONTENT);
    }
}
