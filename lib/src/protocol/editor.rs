//! Request and response head rewriting, and chunk framing
use std::sync::OnceLock;

use regex::Regex;
use url::{Host, Url};

use crate::parser::{ContentEncoding, HttpMessage};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// terminating zero-length chunk
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    /// key of the remote endpoint in a session, `host:port`
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Finds where a request goes.
///
/// An absolute-form target gives the destination and is rewritten to origin
/// form (`http://host/path?q` becomes `/path?q`). Otherwise the `Host` header
/// is used.
pub fn resolve_destination(request: &mut HttpMessage) -> Option<Destination> {
    let target = request.url().unwrap_or_default().to_owned();

    if target.contains("://") {
        if let Ok(url) = Url::parse(&target) {
            if let Some(host) = url_host(&url) {
                let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);
                let mut origin_form = match url.path() {
                    "" => "/".to_owned(),
                    path => path.to_owned(),
                };
                if let Some(query) = url.query() {
                    origin_form.push('?');
                    origin_form.push_str(query);
                }
                request.set_url(&origin_form);
                return Some(Destination { host, port });
            }
        }
    }

    request
        .header("Host")
        .and_then(|authority| parse_authority(authority, DEFAULT_HTTP_PORT))
}

fn url_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) if !domain.is_empty() => Some(domain.to_owned()),
        Host::Domain(_) => None,
        Host::Ipv4(address) => Some(address.to_string()),
        Host::Ipv6(address) => Some(address.to_string()),
    }
}

/// `host`, `host:port`, `[v6]` or `[v6]:port`
pub fn parse_authority(authority: &str, default_port: u16) -> Option<Destination> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some(Destination {
            host: host.to_owned(),
            port,
        });
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, default_port),
    };
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some(Destination {
        host: host.to_owned(),
        port,
    })
}

fn accept_encoding_entry() -> Option<&'static Regex> {
    static ENTRY: OnceLock<Option<Regex>> = OnceLock::new();
    ENTRY
        .get_or_init(|| Regex::new(r"^([A-Za-z][A-Za-z0-9-]*|\*)\s*(;\s*q=[0-9.]+)?$").ok())
        .as_ref()
}

/// Keeps the `Accept-Encoding` entries naming a coding this proxy knows, or
/// `*`, weights included
pub fn filter_accept_encoding(value: &str) -> String {
    let supported = ContentEncoding::supported_names();
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| {
            accept_encoding_entry()
                .and_then(|regex| regex.captures(entry))
                .and_then(|captures| captures.get(1))
                .map(|name| {
                    let name = name.as_str().to_ascii_lowercase();
                    name == "*" || supported.contains(&name.as_str())
                })
                .unwrap_or(false)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Strips what the proxy cannot relay: protocol upgrades, and content
/// codings it does not know
pub fn remove_unsupported_features(request: &mut HttpMessage) {
    request.remove_header("Upgrade");

    if let Some(accept_encoding) = request.header("Accept-Encoding") {
        let filtered = filter_accept_encoding(accept_encoding);
        request.set_header("Accept-Encoding", &filtered);
    }
}

/// The content coding of a response, if it is not identity
pub fn response_coding(response: &HttpMessage) -> Option<&str> {
    response
        .header("Content-Encoding")
        .map(str::trim)
        .filter(|coding| !coding.is_empty() && !coding.eq_ignore_ascii_case("identity"))
}

/// Moves the coding to `Orig-Content-Encoding`, and switches the framing to
/// chunks since the body length downstream is no longer known
pub fn rewrite_encoded_response(response: &mut HttpMessage, coding: &str, has_body: bool) {
    response.remove_header("Content-Encoding");
    response.add_header("Orig-Content-Encoding", coding);
    response.remove_header("Content-Length");
    response.remove_header("Transfer-Encoding");
    if has_body {
        response.add_header("Transfer-Encoding", "chunked");
    }
}

/// `<HEX LENGTH>\r\n<data>\r\n`
pub fn chunk_frame(data: &[u8]) -> Vec<u8> {
    let mut chunk = format!("{:X}\r\n", data.len()).into_bytes();
    chunk.reserve(data.len() + 2);
    chunk.extend_from_slice(data);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        parser::{
            Direction, Http1Parser, MessageParser, ParseErrorKind, ParserCallbacks,
            ParserConnection,
        },
        ConnectionId,
    };
    use quickcheck::quickcheck;

    #[test]
    fn absolute_form_target() {
        let mut request = HttpMessage::request("GET", "http://host.example/path?q=1");
        assert_eq!(
            resolve_destination(&mut request),
            Some(Destination {
                host: "host.example".to_owned(),
                port: 80
            })
        );
        assert_eq!(request.url(), Some("/path?q=1"));

        let mut request = HttpMessage::request("GET", "http://host.example:8080");
        let destination = resolve_destination(&mut request).unwrap();
        assert_eq!(destination.name(), "host.example:8080");
        assert_eq!(request.url(), Some("/"));

        let mut request = HttpMessage::request("GET", "https://[::1]/");
        assert_eq!(
            resolve_destination(&mut request),
            Some(Destination {
                host: "::1".to_owned(),
                port: 443
            })
        );
    }

    #[test]
    fn host_header() {
        let mut request = HttpMessage::request("GET", "/index.html");
        request.add_header("Host", "host.example:8080");
        assert_eq!(
            resolve_destination(&mut request),
            Some(Destination {
                host: "host.example".to_owned(),
                port: 8080
            })
        );
        assert_eq!(request.url(), Some("/index.html"));

        let mut request = HttpMessage::request("GET", "/");
        assert_eq!(resolve_destination(&mut request), None);
    }

    #[test]
    fn authorities() {
        assert_eq!(
            parse_authority("example.com", DEFAULT_TUNNEL_PORT).map(|d| d.name()),
            Some("example.com:443".to_owned())
        );
        assert_eq!(
            parse_authority("[2001:db8::1]:8443", DEFAULT_TUNNEL_PORT),
            Some(Destination {
                host: "2001:db8::1".to_owned(),
                port: 8443
            })
        );
        assert_eq!(parse_authority("example.com:http", 80), None);
        assert_eq!(parse_authority("", 80), None);
        assert_eq!(parse_authority(":80", 80), None);
    }

    #[test]
    fn accept_encoding_whitelist() {
        assert_eq!(
            filter_accept_encoding("gzip, deflate, sdch, br"),
            "gzip,deflate"
        );
        assert_eq!(
            filter_accept_encoding("br;q=1.0, GZIP ;q=0.8, *;q=0.1"),
            "GZIP ;q=0.8,*;q=0.1"
        );
        assert_eq!(filter_accept_encoding("x-gzip"), "x-gzip");
        assert_eq!(filter_accept_encoding("sdch"), "");

        let mut request = HttpMessage::request("GET", "/");
        request.add_header("Upgrade", "h2c");
        request.add_header("Accept-Encoding", "gzip, br");
        remove_unsupported_features(&mut request);
        assert!(!request.has_header("upgrade"));
        assert_eq!(request.header("accept-encoding"), Some("gzip"));
    }

    #[test]
    fn encoded_response_rewrite() {
        let mut response = HttpMessage::response(200, "OK");
        response.add_header("Content-Encoding", "gzip");
        response.add_header("Content-Length", "120");
        assert_eq!(response_coding(&response), Some("gzip"));

        rewrite_encoded_response(&mut response, "gzip", true);
        assert!(!response.has_header("content-encoding"));
        assert!(!response.has_header("content-length"));
        assert_eq!(response.header("Orig-Content-Encoding"), Some("gzip"));
        assert_eq!(
            response.header_values("transfer-encoding").collect::<Vec<_>>(),
            vec!["chunked"]
        );

        let mut chunked = HttpMessage::response(200, "OK");
        chunked.add_header("Content-Encoding", "gzip");
        chunked.add_header("Transfer-Encoding", "chunked");
        rewrite_encoded_response(&mut chunked, "gzip", true);
        assert_eq!(chunked.header_values("transfer-encoding").count(), 1);

        let mut identity = HttpMessage::response(200, "OK");
        identity.add_header("Content-Encoding", "identity");
        assert_eq!(response_coding(&identity), None);
    }

    #[test]
    fn chunk_framing() {
        assert_eq!(chunk_frame(b"hello"), b"5\r\nhello\r\n".to_vec());
        assert_eq!(chunk_frame(&[0u8; 26])[..4], b"1A\r\n"[..]);
    }

    struct Collector {
        body: Vec<u8>,
        finished: bool,
        failed: bool,
    }

    impl ParserCallbacks for Collector {
        fn on_request_received(&mut self, _: ParserConnection, _: HttpMessage) {}
        fn on_request_body_started(&mut self, _: ParserConnection) -> bool {
            true
        }
        fn on_request_body_data(&mut self, _: ParserConnection, data: &[u8]) {
            self.body.extend_from_slice(data);
        }
        fn on_request_body_finished(&mut self, _: ParserConnection) {
            self.finished = true;
        }
        fn on_response_received(&mut self, _: ParserConnection, _: HttpMessage) {}
        fn on_response_body_started(&mut self, _: ParserConnection) -> bool {
            true
        }
        fn on_response_body_data(&mut self, _: ParserConnection, _: &[u8]) {}
        fn on_response_body_finished(&mut self, _: ParserConnection) {}
        fn on_parse_error(&mut self, _: ParserConnection, _: Direction, _: ParseErrorKind, _: &str) {
            self.failed = true;
        }
    }

    /// frames slices the way bodies are relayed, skipping empty ones
    fn reframe(slices: &[Vec<u8>]) -> Vec<u8> {
        let mut framed = Vec::new();
        for slice in slices.iter().filter(|slice| !slice.is_empty()) {
            framed.extend(chunk_frame(slice));
        }
        framed.extend_from_slice(LAST_CHUNK);
        framed
    }

    fn decode(framed: &[u8]) -> Collector {
        let mut parser = Http1Parser::new();
        let connection = parser.connect(ConnectionId(0)).unwrap();
        let mut collector = Collector {
            body: Vec::new(),
            finished: false,
            failed: false,
        };
        let mut input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        input.extend_from_slice(framed);
        parser
            .input(connection, Direction::Out, &input, &mut collector)
            .unwrap();
        collector
    }

    #[test]
    fn reframed_slices_round_trip() {
        let collector = decode(&reframe(&[b"abc".to_vec(), Vec::new(), b"defg".to_vec()]));
        assert_eq!(collector.body, b"abcdefg");
        assert!(collector.finished);
        assert!(!collector.failed);
    }

    #[test]
    fn reframing_preserves_any_body() {
        fn property(slices: Vec<Vec<u8>>) -> bool {
            let collector = decode(&reframe(&slices));
            collector.finished && !collector.failed && collector.body == slices.concat()
        }
        quickcheck(property as fn(Vec<Vec<u8>>) -> bool);
    }
}
