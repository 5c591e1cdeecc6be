use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::PathAndQuery;
use http::{Method, Request, Version};
use std::sync::Arc;

use crate::config::RoutingConfig;
use crate::credential::BearerToken;
use crate::error::{ConfigError, RequestError};
use crate::target::{Target, TargetRegistry};

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Method, path and forwarded headers of an intercepted request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub version: Version,
    /// Upstream path, already joined with the target's base path.
    pub path_and_query: PathAndQuery,
    pub headers: HeaderMap,
}

/// A validated request ready for credential exchange and relay.
#[derive(Debug)]
pub struct ProxiedRequest<B> {
    pub target: Arc<Target>,
    pub token: BearerToken,
    pub head: RequestHead,
    pub body: B,
}

pub struct RequestRouter {
    targets: Arc<TargetRegistry>,
    target_header: HeaderName,
    path_prefix: Option<String>,
}

impl RequestRouter {
    pub fn new(targets: Arc<TargetRegistry>, routing: &RoutingConfig) -> Result<Self, ConfigError> {
        let target_header = HeaderName::from_bytes(routing.target_header.as_bytes())
            .map_err(|e| ConfigError::Validation(format!("Invalid targetHeader: {}", e)))?;
        let path_prefix = routing
            .path_prefix
            .as_deref()
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            targets,
            target_header,
            path_prefix,
        })
    }

    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.targets
    }

    /// Validate an inbound request and split it into the pieces the rest of
    /// the pipeline needs. Performs no I/O.
    pub fn intercept<B>(&self, request: Request<B>) -> Result<ProxiedRequest<B>, RequestError> {
        let (parts, body) = request.into_parts();

        let token = bearer_token(&parts.headers)?;
        let (target, path) = self.resolve_target(&parts.headers, parts.uri.path())?;
        check_framing(&parts.headers)?;

        let upstream = target.upstream_path(&path, parts.uri.query());
        let path_and_query = upstream
            .parse::<PathAndQuery>()
            .map_err(|e| RequestError::MalformedRequest(format!("invalid path: {}", e)))?;

        let mut headers = parts.headers;
        headers.remove(header::AUTHORIZATION);
        headers.remove(&self.target_header);
        headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);

        Ok(ProxiedRequest {
            target,
            token,
            head: RequestHead {
                method: parts.method,
                version: parts.version,
                path_and_query,
                headers,
            },
            body,
        })
    }

    fn resolve_target(
        &self,
        headers: &HeaderMap,
        path: &str,
    ) -> Result<(Arc<Target>, String), RequestError> {
        if let Some(value) = headers.get(&self.target_header) {
            let name = value
                .to_str()
                .map_err(|_| RequestError::UnknownTarget("<non-ascii>".into()))?
                .trim();
            let target = self
                .targets
                .get(name)
                .ok_or_else(|| RequestError::UnknownTarget(name.to_string()))?;
            return Ok((target, path.to_string()));
        }

        if let Some(prefix) = &self.path_prefix {
            if let Some(rest) = path
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
            {
                let (name, remainder) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, "/"),
                };
                if !name.is_empty() {
                    let target = self
                        .targets
                        .get(name)
                        .ok_or_else(|| RequestError::UnknownTarget(name.to_string()))?;
                    return Ok((target, remainder.to_string()));
                }
            }
        }

        match self.targets.default_target() {
            Some(target) => Ok((target, path.to_string())),
            None => Err(RequestError::UnknownTarget(
                "request names no target and no default is configured".into(),
            )),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<BearerToken, RequestError> {
    let mut values = headers.get_all(header::AUTHORIZATION).iter();
    let value = match (values.next(), values.next()) {
        (Some(value), None) => value,
        _ => return Err(RequestError::MissingCredential),
    };

    let value = value.to_str().map_err(|_| RequestError::MissingCredential)?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or(RequestError::MissingCredential)?;
    let token = token.trim();

    if !scheme.eq_ignore_ascii_case("bearer")
        || token.is_empty()
        || token.contains(char::is_whitespace)
    {
        return Err(RequestError::MissingCredential);
    }

    Ok(BearerToken::new(token))
}

fn check_framing(headers: &HeaderMap) -> Result<(), RequestError> {
    let lengths: Vec<&HeaderValue> = headers.get_all(header::CONTENT_LENGTH).iter().collect();
    let has_transfer_encoding = headers.contains_key(header::TRANSFER_ENCODING);

    if !lengths.is_empty() && has_transfer_encoding {
        return Err(RequestError::MalformedRequest(
            "both Content-Length and Transfer-Encoding present".into(),
        ));
    }

    let mut declared: Option<u64> = None;
    for value in lengths {
        for part in value.to_str().unwrap_or_default().split(',') {
            let length = part.trim().parse::<u64>().map_err(|_| {
                RequestError::MalformedRequest("invalid Content-Length".into())
            })?;
            match declared {
                Some(previous) if previous != length => {
                    return Err(RequestError::MalformedRequest(
                        "conflicting Content-Length values".into(),
                    ))
                }
                _ => declared = Some(length),
            }
        }
    }

    if has_transfer_encoding {
        let last_coding = headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .last();
        if !last_coding.is_some_and(|c| c.eq_ignore_ascii_case("chunked")) {
            return Err(RequestError::MalformedRequest(
                "Transfer-Encoding must end with chunked".into(),
            ));
        }
    }

    Ok(())
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IssuanceConfig, TargetConfig};

    fn target(name: &str, url: &str) -> Target {
        let key = rcgen::KeyPair::generate().unwrap();
        let ca = rcgen::CertificateParams::new(vec![name.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let config = TargetConfig {
            url: url.to_string(),
            ca_file: None,
            ca_pem: Some(ca.pem()),
            server_name: None,
            issuance: IssuanceConfig::default(),
        };
        Target::from_config(name, &config).unwrap()
    }

    fn router(default_target: Option<&str>) -> RequestRouter {
        let registry = TargetRegistry::new(
            vec![
                target("cluster-a", "https://cluster-a"),
                target("cluster-b", "https://cluster-b:6443/base"),
            ],
            default_target.map(String::from),
        );
        RequestRouter::new(Arc::new(registry), &RoutingConfig::default()).unwrap()
    }

    fn request(path: &str) -> http::request::Builder {
        Request::builder()
            .uri(path)
            .header(header::AUTHORIZATION, "Bearer good-token")
    }

    #[test]
    fn test_default_target_routing() {
        let proxied = router(Some("cluster-a"))
            .intercept(request("/api/v1/namespaces?limit=5").body(()).unwrap())
            .expect("Failed to intercept");

        assert_eq!(proxied.target.name, "cluster-a");
        assert_eq!(proxied.token.expose(), "good-token");
        assert_eq!(proxied.head.path_and_query, "/api/v1/namespaces?limit=5");
        assert!(proxied.head.headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_header_routing_wins() {
        let proxied = router(Some("cluster-a"))
            .intercept(
                request("/api")
                    .header("x-proxy-target", "cluster-b")
                    .body(())
                    .unwrap(),
            )
            .unwrap();

        assert_eq!(proxied.target.name, "cluster-b");
        assert_eq!(proxied.head.path_and_query, "/base/api");
        assert!(proxied.head.headers.get("x-proxy-target").is_none());
    }

    #[test]
    fn test_path_prefix_routing_strips_prefix() {
        let router = router(None);

        let proxied = router
            .intercept(request("/targets/cluster-a/api/v1/pods").body(()).unwrap())
            .unwrap();
        assert_eq!(proxied.target.name, "cluster-a");
        assert_eq!(proxied.head.path_and_query, "/api/v1/pods");

        let proxied = router
            .intercept(request("/targets/cluster-b").body(()).unwrap())
            .unwrap();
        assert_eq!(proxied.head.path_and_query, "/base/");
    }

    #[test]
    fn test_unknown_target() {
        let router = router(None);

        assert_eq!(
            router.intercept(request("/api").body(()).unwrap()).unwrap_err(),
            RequestError::UnknownTarget(
                "request names no target and no default is configured".into()
            )
        );
        assert_eq!(
            router
                .intercept(request("/targets/nowhere/api").body(()).unwrap())
                .unwrap_err(),
            RequestError::UnknownTarget("nowhere".into())
        );
        assert_eq!(
            router
                .intercept(request("/api").header("x-proxy-target", "c").body(()).unwrap())
                .unwrap_err(),
            RequestError::UnknownTarget("c".into())
        );
    }

    #[test]
    fn test_missing_or_malformed_authorization() {
        let router = router(Some("cluster-a"));
        let cases = [
            None,
            Some("Basic dXNlcjpwYXNz"),
            Some("Bearer"),
            Some("Bearer "),
            Some("Bearer two tokens"),
            Some("good-token"),
        ];

        for case in cases {
            let mut builder = Request::builder().uri("/api");
            if let Some(value) = case {
                builder = builder.header(header::AUTHORIZATION, value);
            }
            assert_eq!(
                router.intercept(builder.body(()).unwrap()).unwrap_err(),
                RequestError::MissingCredential,
                "{:?}",
                case
            );
        }

        let duplicated = request("/api")
            .header(header::AUTHORIZATION, "Bearer other")
            .body(())
            .unwrap();
        assert_eq!(
            router.intercept(duplicated).unwrap_err(),
            RequestError::MissingCredential
        );
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let proxied = router(Some("cluster-a"))
            .intercept(
                Request::builder()
                    .uri("/api")
                    .header(header::AUTHORIZATION, "bearer abc.def")
                    .body(())
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(proxied.token.expose(), "abc.def");
    }

    #[test]
    fn test_credential_checked_before_target() {
        let error = router(None)
            .intercept(Request::builder().uri("/api").body(()).unwrap())
            .unwrap_err();
        assert_eq!(error, RequestError::MissingCredential);
    }

    #[test]
    fn test_conflicting_framing_is_malformed() {
        let router = router(Some("cluster-a"));
        let cases = vec![
            request("/api")
                .header(header::CONTENT_LENGTH, "10")
                .header(header::TRANSFER_ENCODING, "chunked"),
            request("/api")
                .header(header::CONTENT_LENGTH, "10")
                .header(header::CONTENT_LENGTH, "11"),
            request("/api").header(header::CONTENT_LENGTH, "ten"),
            request("/api").header(header::TRANSFER_ENCODING, "chunked, gzip"),
        ];

        for builder in cases {
            assert!(matches!(
                router.intercept(builder.body(()).unwrap()),
                Err(RequestError::MalformedRequest(_))
            ));
        }

        let repeated = request("/api")
            .header(header::CONTENT_LENGTH, "10")
            .header(header::CONTENT_LENGTH, "10")
            .body(())
            .unwrap();
        assert!(router.intercept(repeated).is_ok());
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let proxied = router(Some("cluster-a"))
            .intercept(
                request("/api")
                    .header(header::HOST, "proxy.local")
                    .header(header::CONNECTION, "keep-alive, x-session")
                    .header("x-session", "abc")
                    .header("keep-alive", "timeout=5")
                    .header(header::UPGRADE, "websocket")
                    .header(header::PROXY_AUTHORIZATION, "Basic Zm9v")
                    .header(header::TRANSFER_ENCODING, "chunked")
                    .header(header::ACCEPT, "application/json")
                    .body(())
                    .unwrap(),
            )
            .unwrap();

        let headers = &proxied.head.headers;
        for name in [
            "host",
            "connection",
            "x-session",
            "keep-alive",
            "upgrade",
            "proxy-authorization",
            "transfer-encoding",
        ] {
            assert!(headers.get(name).is_none(), "{} was forwarded", name);
        }
        assert_eq!(headers[header::ACCEPT], "application/json");
    }
}
