//! Response-body transformation for HTML documents.
//!
//! Runs only when the response Content-Type contains `text/html`. Rewrites
//! the Location header and Set-Cookie domains, transparently decompresses
//! the body, rewrites absolute target-origin URLs to point at the proxy,
//! injects the bootstrap script, and emits the result uncompressed with a
//! recomputed Content-Length. Decompression failure abandons the
//! transformation and passes the original body through unmodified.

pub mod script;

use axum::http::header::{self, HeaderMap, HeaderValue};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use url::Url;

pub use script::{bootstrap_script, SCRIPT_MARKER};

/// Per-proxy transformer; cheap to build, carries only host strings.
#[derive(Debug, Clone)]
pub struct BodyTransformer {
    /// `host[:port]` of the target origin
    target_authority: String,
    /// Host of the target origin without the port, for cookie domains
    target_host: String,
    proxy_scheme: String,
    /// `host[:port]` the client should be sent to
    proxy_authority: String,
}

impl BodyTransformer {
    /// Build for a target and the proxy's client-facing address. When a
    /// public URL is configured the rewrites point there; otherwise the
    /// listen port on `localhost`.
    pub fn new(target: &Url, listen_port: u16, public_url: Option<&Url>) -> Self {
        let target_authority = crate::util::url_authority(target);
        let target_host = target.host_str().unwrap_or_default().to_string();

        let (proxy_scheme, proxy_authority) = match public_url {
            Some(public) => {
                (public.scheme().to_string(), crate::util::url_authority(public))
            }
            None => ("http".to_string(), format!("localhost:{listen_port}")),
        };

        Self { target_authority, target_host, proxy_scheme, proxy_authority }
    }

    /// Whether this response is eligible for transformation at all.
    pub fn is_html(headers: &HeaderMap) -> bool {
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }

    /// Full transformation sequence. Mutates `headers` (Location,
    /// Set-Cookie, Content-Encoding, Content-Length) and returns the body
    /// to send.
    pub async fn transform(&self, headers: &mut HeaderMap, body: Bytes) -> Bytes {
        self.rewrite_location(headers);
        self.rewrite_set_cookie(headers);

        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        let decoded: Vec<u8> = match encoding.as_deref() {
            None | Some("") | Some("identity") => body.to_vec(),
            Some(enc @ ("gzip" | "deflate" | "br" | "zstd")) => {
                match decompress(enc, &body).await {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        tracing::warn!(encoding = enc, error = %e,
                            "decompression failed, passing body through unmodified");
                        return body;
                    }
                }
            }
            Some(other) => {
                tracing::debug!(encoding = other, "unknown content encoding, passing through");
                return body;
            }
        };

        let rewritten = self.rewrite_urls_in_body(&decoded);
        let injected = inject_script(rewritten);

        headers.remove(header::CONTENT_ENCODING);
        if let Ok(len) = HeaderValue::from_str(&injected.len().to_string()) {
            headers.insert(header::CONTENT_LENGTH, len);
        }

        Bytes::from(injected)
    }

    /// Rewrite an absolute Location header pointing at the target so the
    /// client stays on the proxy.
    pub fn rewrite_location(&self, headers: &mut HeaderMap) {
        let Some(location) = headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
            return;
        };
        let Ok(mut url) = Url::parse(location) else {
            return; // relative or opaque; leave untouched
        };
        if crate::util::url_authority(&url) != self.target_authority {
            return;
        }

        let _ = url.set_scheme(&self.proxy_scheme);
        let (host, port) = split_authority(&self.proxy_authority);
        if url.set_host(Some(host)).is_err() {
            return;
        }
        let _ = url.set_port(port);

        if let Ok(value) = HeaderValue::from_str(url.as_str()) {
            headers.insert(header::LOCATION, value);
        }
    }

    /// Strip `Domain=` attributes that name the target host so cookies
    /// stick to the proxy origin. Other attributes pass through untouched.
    pub fn rewrite_set_cookie(&self, headers: &mut HeaderMap) {
        let cookies: Vec<String> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| self.rewrite_cookie_value(v))
            .collect();
        if cookies.is_empty() {
            return;
        }

        headers.remove(header::SET_COOKIE);
        for cookie in cookies {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.append(header::SET_COOKIE, value);
            }
        }
    }

    fn rewrite_cookie_value(&self, cookie: &str) -> String {
        cookie
            .split(';')
            .map(str::trim)
            .filter(|attr| {
                if attr.len() < 7 || !attr[..7].eq_ignore_ascii_case("domain=") {
                    return true;
                }
                let domain = attr[7..].trim().trim_start_matches('.');
                !domain.eq_ignore_ascii_case(&self.target_host)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Replace every `http://target` / `https://target` occurrence (and
    /// their JSON-escaped-slash forms) with the proxy origin. Applying
    /// this twice equals applying it once: after the first pass the
    /// target origin no longer appears.
    pub fn rewrite_urls_in_body(&self, body: &[u8]) -> Vec<u8> {
        let mut out = body.to_vec();
        let proxy = format!("{}://{}", self.proxy_scheme, self.proxy_authority);
        let proxy_escaped = proxy.replace("//", "\\/\\/");

        for scheme in ["http", "https"] {
            let plain = format!("{}://{}", scheme, self.target_authority);
            out = replace_all(&out, plain.as_bytes(), proxy.as_bytes());

            let escaped = format!("{}:\\/\\/{}", scheme, self.target_authority);
            out = replace_all(&out, escaped.as_bytes(), proxy_escaped.as_bytes());
        }
        out
    }
}

fn split_authority(authority: &str) -> (&str, Option<u16>) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        None => (authority, None),
    }
}

/// Splice the bootstrap script into an HTML document. Anchor preference:
/// before `</head>`, else after the opening `<head …>`, `<body …>` or
/// `<html …>` tag; with no anchor at all the script is prepended.
pub fn inject_script(body: Vec<u8>) -> Vec<u8> {
    let script = bootstrap_script().as_bytes();
    let lower: Vec<u8> = body.to_ascii_lowercase();

    if let Some(pos) = find(&lower, b"</head>") {
        return splice(body, pos, script);
    }
    for tag in [&b"<head"[..], &b"<body"[..], &b"<html"[..]] {
        if let Some(open) = find_tag_open(&lower, tag) {
            if let Some(close) = lower[open..].iter().position(|&b| b == b'>') {
                return splice(body, open + close + 1, script);
            }
        }
    }

    let mut out = Vec::with_capacity(script.len() + body.len());
    out.extend_from_slice(script);
    out.extend_from_slice(&body);
    out
}

/// First occurrence of `<tag>` or `<tag …`, rejecting longer names like
/// `<header>` when searching for `<head`.
fn find_tag_open(haystack: &[u8], tag: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = find(&haystack[from..], tag) {
        let pos = from + rel;
        match haystack.get(pos + tag.len()) {
            Some(&next) if next == b'>' || next.is_ascii_whitespace() => return Some(pos),
            Some(_) => from = pos + 1,
            None => return None,
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn splice(body: Vec<u8>, at: usize, insert: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + insert.len());
    out.extend_from_slice(&body[..at]);
    out.extend_from_slice(insert);
    out.extend_from_slice(&body[at..]);
    out
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut cursor = 0;
    while let Some(rel) = find(&haystack[cursor..], needle) {
        let pos = cursor + rel;
        out.extend_from_slice(&haystack[cursor..pos]);
        out.extend_from_slice(replacement);
        cursor = pos + needle.len();
    }
    out.extend_from_slice(&haystack[cursor..]);
    out
}

async fn decompress(encoding: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    use async_compression::tokio::bufread::{
        BrotliDecoder, GzipDecoder, ZlibDecoder, ZstdDecoder,
    };
    use tokio::io::BufReader;

    let mut out = Vec::new();
    match encoding {
        "gzip" => GzipDecoder::new(BufReader::new(data)).read_to_end(&mut out).await?,
        "deflate" => ZlibDecoder::new(BufReader::new(data)).read_to_end(&mut out).await?,
        "br" => BrotliDecoder::new(BufReader::new(data)).read_to_end(&mut out).await?,
        "zstd" => ZstdDecoder::new(BufReader::new(data)).read_to_end(&mut out).await?,
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown encoding {other}"),
            ))
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn compress(encoding: &str, data: &[u8]) -> Vec<u8> {
        use async_compression::tokio::bufread::{
            BrotliEncoder, GzipEncoder, ZlibEncoder, ZstdEncoder,
        };
        use tokio::io::BufReader;

        let mut out = Vec::new();
        match encoding {
            "gzip" => GzipEncoder::new(BufReader::new(data)).read_to_end(&mut out).await,
            "deflate" => ZlibEncoder::new(BufReader::new(data)).read_to_end(&mut out).await,
            "br" => BrotliEncoder::new(BufReader::new(data)).read_to_end(&mut out).await,
            "zstd" => ZstdEncoder::new(BufReader::new(data)).read_to_end(&mut out).await,
            other => panic!("unknown encoding {other}"),
        }
        .unwrap();
        out
    }

    fn transformer() -> BodyTransformer {
        let target = Url::parse("http://localhost:3000").unwrap();
        BodyTransformer::new(&target, 8080, None)
    }

    fn html_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        headers
    }

    #[test]
    fn test_rewrite_url_in_body() {
        let t = transformer();
        let body = br#"<a href="http://localhost:3000/wp-admin/">admin</a>"#;
        let out = t.rewrite_urls_in_body(body);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"<a href="http://localhost:8080/wp-admin/">admin</a>"#
        );
    }

    #[test]
    fn test_rewrite_leaves_relative_and_foreign_urls() {
        let t = transformer();
        let body = br#"<a href="/rel">r</a> <a href="http://other.host:3000/x">o</a>"#;
        assert_eq!(t.rewrite_urls_in_body(body), body.to_vec());
    }

    #[test]
    fn test_rewrite_https_form_and_escaped_slashes() {
        let t = transformer();
        let body = br#"{"api":"https://localhost:3000/v1","alt":"http:\/\/localhost:3000\/v2"}"#;
        let out = String::from_utf8(t.rewrite_urls_in_body(body)).unwrap();
        assert!(out.contains(r#""api":"http://localhost:8080/v1""#), "{out}");
        assert!(out.contains(r#"http:\/\/localhost:8080\/v2"#), "{out}");
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let t = transformer();
        let body = br#"<script src="http://localhost:3000/app.js"></script>"#.to_vec();
        let once = t.rewrite_urls_in_body(&body);
        let twice = t.rewrite_urls_in_body(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_cookie_domain_stripped_for_target() {
        let target = Url::parse("http://wordpress.local").unwrap();
        let t = BodyTransformer::new(&target, 8080, None);
        let mut headers = HeaderMap::new();
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("session=abc; Domain=wordpress.local; Path=/"),
        );
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("plain=1; Path=/"),
        );

        t.rewrite_set_cookie(&mut headers);

        let values: Vec<&str> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["session=abc; Path=/", "plain=1; Path=/"]);
    }

    #[test]
    fn test_cookie_foreign_domain_kept() {
        let t = transformer();
        let mut headers = HeaderMap::new();
        headers.append(
            header::SET_COOKIE,
            HeaderValue::from_static("x=1; Domain=elsewhere.example; Path=/"),
        );
        t.rewrite_set_cookie(&mut headers);
        assert_eq!(
            headers.get(header::SET_COOKIE).unwrap(),
            "x=1; Domain=elsewhere.example; Path=/"
        );
    }

    #[test]
    fn test_location_rewrite() {
        let t = transformer();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("http://localhost:3000/after-login"),
        );
        t.rewrite_location(&mut headers);
        assert_eq!(
            headers.get(header::LOCATION).unwrap(),
            "http://localhost:8080/after-login"
        );

        // Foreign host untouched
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("http://other.example/x"),
        );
        t.rewrite_location(&mut headers);
        assert_eq!(headers.get(header::LOCATION).unwrap(), "http://other.example/x");
    }

    #[test]
    fn test_inject_before_head_close() {
        let out = inject_script(b"<html><head><title>t</title></head><body></body></html>".to_vec());
        let text = String::from_utf8(out).unwrap();
        let marker_at = text.find(SCRIPT_MARKER).unwrap();
        let head_close = text.find("</head>").unwrap();
        assert!(marker_at < head_close);
    }

    #[test]
    fn test_inject_after_body_when_no_head() {
        let out = inject_script(b"<html><body class=\"x\">hi</body></html>".to_vec());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("<body class=\"x\"><script"));
    }

    #[test]
    fn test_inject_prepends_without_anchor() {
        let out = inject_script(b"plain text".to_vec());
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("<script"));
        assert!(text.ends_with("plain text"));
    }

    #[test]
    fn test_header_tag_is_not_a_head_anchor() {
        let out = inject_script(b"<header>nav</header><body>x</body>".to_vec());
        let text = String::from_utf8(out).unwrap();
        // Must anchor on <body>, not inside <header>
        assert!(text.contains("<body><script"), "{text}");
    }

    #[tokio::test]
    async fn test_transform_plain_html() {
        let t = transformer();
        let mut headers = html_headers();
        let body = Bytes::from_static(b"<html><head></head><body>Hello World</body></html>");

        let out = t.transform(&mut headers, body).await;
        let text = String::from_utf8(out.to_vec()).unwrap();

        assert!(text.contains("Hello World"));
        assert!(text.contains(SCRIPT_MARKER));
        assert!(headers.get(header::CONTENT_ENCODING).is_none());
        assert_eq!(
            headers.get(header::CONTENT_LENGTH).unwrap().to_str().unwrap(),
            out.len().to_string()
        );
    }

    #[tokio::test]
    async fn test_transform_roundtrip_all_encodings() {
        let original = b"<html><head></head><body>compressed page</body></html>";
        for encoding in ["gzip", "deflate", "br", "zstd"] {
            let t = transformer();
            let mut headers = html_headers();
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_str(encoding).unwrap());

            let compressed = compress(encoding, original).await;
            let out = t.transform(&mut headers, Bytes::from(compressed)).await;
            let text = String::from_utf8(out.to_vec()).unwrap();

            assert!(text.contains("compressed page"), "{encoding}");
            assert!(text.contains(SCRIPT_MARKER), "{encoding}");
            assert!(headers.get(header::CONTENT_ENCODING).is_none(), "{encoding}");
            assert_eq!(
                headers.get(header::CONTENT_LENGTH).unwrap().to_str().unwrap(),
                out.len().to_string(),
                "{encoding}"
            );
        }
    }

    #[tokio::test]
    async fn test_transform_corrupt_gzip_passes_through() {
        let t = transformer();
        let mut headers = html_headers();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let garbage = Bytes::from_static(b"\x1f\x8bnot really gzip");

        let out = t.transform(&mut headers, garbage.clone()).await;
        assert_eq!(out, garbage);
        // Encoding header survives since the body was left alone
        assert!(headers.get(header::CONTENT_ENCODING).is_some());
    }

    #[tokio::test]
    async fn test_transform_unknown_encoding_passes_through() {
        let t = transformer();
        let mut headers = html_headers();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("lzma"));
        let body = Bytes::from_static(b"whatever");

        let out = t.transform(&mut headers, body.clone()).await;
        assert_eq!(out, body);
    }

    #[test]
    fn test_public_url_overrides_proxy_host() {
        let target = Url::parse("http://localhost:3000").unwrap();
        let public = Url::parse("https://demo.tunnel.example").unwrap();
        let t = BodyTransformer::new(&target, 8080, Some(&public));

        let out = t.rewrite_urls_in_body(br#"<a href="http://localhost:3000/x">"#);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"<a href="https://demo.tunnel.example/x">"#
        );
    }
}
