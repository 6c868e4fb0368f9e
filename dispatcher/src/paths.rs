//! Request path shapes: routing prefix, merged-location paths, COPY rewriting.

use crate::merger::X_STORAGE_TOKEN;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use location::RESERVED_PREFIXES;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

pub const X_COPY_FROM: HeaderName = HeaderName::from_static("x-copy-from");
pub const DESTINATION: HeaderName = HeaderName::from_static("destination");

/// Characters left alone when encoding one path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

/// Like `SEGMENT`, keeping `/` so object names with slashes stay intact.
const PATH: &AsciiSet = &SEGMENT.remove(b'/');

pub fn encode_segment(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT).to_string()
}

pub fn encode_path(raw: &str) -> String {
    utf8_percent_encode(raw, PATH).to_string()
}

pub fn decode(encoded: &str) -> String {
    percent_decode_str(encoded).decode_utf8_lossy().into_owned()
}

/// A path split into its routing prefix and the segments relayed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    pub prefix: Option<String>,
    /// Non-empty segments after the prefix, still percent-encoded
    pub segments: Vec<String>,
}

impl RequestPath {
    pub fn parse(path: &str) -> Self {
        let mut segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        // the routing prefix is taken from the raw first segment, empty or not
        let first = path.split('/').nth(1).unwrap_or("").trim();
        let prefix = if first.is_empty() || RESERVED_PREFIXES.contains(&first) {
            None
        } else {
            segments.remove(0);
            Some(first.to_string())
        };
        RequestPath { prefix, segments }
    }

    /// `/<prefix>/<segments...>`, or `/<segments...>` without a prefix.
    pub fn to_path(&self, trailing_slash: bool) -> String {
        let mut path = String::new();
        if let Some(prefix) = &self.prefix {
            path.push('/');
            path.push_str(prefix);
        }
        for segment in &self.segments {
            path.push('/');
            path.push_str(segment);
        }
        if path.is_empty() || trailing_slash {
            path.push('/');
        }
        path
    }
}

/// Rewrites a COPY into the equivalent PUT with `x-copy-from`.
///
/// `segments` are `<ver>/<account>/<container>/<object...>`; the returned segments point at
/// the destination. Errors carry the message sent back to the client.
pub fn copy_to_put(segments: &[String], headers: &mut HeaderMap) -> Result<Vec<String>, String> {
    if segments.len() < 4 {
        return Err("COPY requires object".to_string());
    }
    let destination = headers
        .get(DESTINATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| "Destination header required".to_string())?;
    let destination = decode(destination);
    let destination = destination.strip_prefix('/').unwrap_or(&destination);
    let (container, object) = match destination.split_once('/') {
        Some((container, object)) if !container.is_empty() && !object.is_empty() => {
            (container, object)
        }
        _ => {
            return Err(
                "Destination header must be of the form <container name>/<object name>"
                    .to_string(),
            );
        }
    };

    let source = format!("/{}/{}", segments[2], segments[3..].join("/"));
    let source = HeaderValue::from_str(&source).map_err(|e| e.to_string())?;

    let mut rewritten = vec![
        segments[0].clone(),
        segments[1].clone(),
        encode_segment(container),
    ];
    rewritten.extend(
        encode_path(object)
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from),
    );

    headers.remove(DESTINATION);
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    headers.insert(X_COPY_FROM, source);
    Ok(rewritten)
}

/// A container name split into the cluster prefix and the name on that cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixedContainer {
    pub prefix: String,
    /// Percent-encoded name of the container on its cluster
    pub container: String,
}

impl PrefixedContainer {
    /// Splits an encoded `<prefix><sep><container>`. `None` when there is no prefix.
    pub fn parse(encoded: &str, separator: char) -> Option<Self> {
        let decoded = decode(encoded);
        match decoded.split_once(separator) {
            Some((prefix, container)) if !prefix.is_empty() => Some(PrefixedContainer {
                prefix: prefix.to_string(),
                container: encode_segment(container),
            }),
            _ => None,
        }
    }
}

/// Source of a cross-container copy, from `x-copy-from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub container: PrefixedContainer,
    pub object: String,
}

/// The request shapes a merged location understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePath {
    Account {
        account: String,
    },
    AccountWithMarker {
        account: String,
        marker: String,
    },
    /// A container without a cluster prefix, which no cluster owns.
    UnprefixedContainer,
    ContainerObject {
        account: String,
        container: PrefixedContainer,
        object: Option<String>,
    },
    Copy {
        account: String,
        container: PrefixedContainer,
        object: String,
        /// `None` when the source container has no cluster prefix
        source: Option<CopySource>,
    },
    Unroutable,
}

impl MergePath {
    /// `segments` are the relayed segments, starting with the API version.
    pub fn parse(
        method: &Method,
        segments: &[String],
        query: Option<&str>,
        headers: &HeaderMap,
        separator: char,
    ) -> Self {
        let Some(account) = segments.get(1).cloned() else {
            return MergePath::Unroutable;
        };
        let Some(container) = segments.get(2) else {
            return match query_param(query, "marker").filter(|m| !m.is_empty()) {
                Some(marker) => MergePath::AccountWithMarker { account, marker },
                None => MergePath::Account { account },
            };
        };
        let Some(container) = PrefixedContainer::parse(container, separator) else {
            return MergePath::UnprefixedContainer;
        };
        let object = (segments.len() > 3).then(|| segments[3..].join("/"));

        if let Some(object) = &object
            && method == Method::PUT
            && let Some(copy_from) = headers.get(X_COPY_FROM).and_then(|v| v.to_str().ok())
            && headers
                .get(CONTENT_LENGTH)
                .is_some_and(|v| v.as_bytes() == b"0")
        {
            return MergePath::Copy {
                account,
                container,
                object: object.clone(),
                source: parse_copy_source(copy_from, separator),
            };
        }

        MergePath::ContainerObject {
            account,
            container,
            object,
        }
    }
}

fn parse_copy_source(copy_from: &str, separator: char) -> Option<CopySource> {
    let copy_from = copy_from.trim_start_matches('/');
    let (container, object) = copy_from.split_once('/')?;
    if object.is_empty() {
        return None;
    }
    Some(CopySource {
        container: PrefixedContainer::parse(container, separator)?,
        object: object.to_string(),
    })
}

/// The merged token of a request, if it carries one.
pub fn request_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(crate::merger::X_AUTH_TOKEN)
        .or_else(|| headers.get(X_STORAGE_TOKEN))
        .and_then(|v| v.to_str().ok())
}

pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// `query` with `name` set to `value`, other parameters kept in order.
pub fn replace_query_param(query: Option<&str>, name: &str, value: &str) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    let mut replaced = false;
    for (key, existing) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        if key == name {
            if !replaced {
                serializer.append_pair(name, value);
                replaced = true;
            }
        } else {
            serializer.append_pair(&key, &existing);
        }
    }
    if !replaced {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}
