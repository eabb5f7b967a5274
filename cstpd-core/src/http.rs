//! Incremental HTTP/1.x request parsing for the control phase.
//!
//! The worker feeds decrypted TLS bytes in as they arrive; the parser
//! accumulates them until the header block completes and extracts the
//! handful of recognised headers into a bounded [`Request`] record.
//! Everything else is parsed and discarded. Two lifecycle flags are
//! raised: [`Request::headers_complete`] and
//! [`Request::message_complete`]; POST dispatch must wait for the
//! second, at which point the body belongs to the handler.

use bytes::{Buf, Bytes, BytesMut};

use crate::{COOKIE_SIZE, TLS_MASTER_SIZE};

/// URLs this long or longer invalidate the request.
pub const MAX_URL_SIZE: usize = 256;

/// Hostnames this long or longer are dropped (the request survives).
pub const MAX_HOSTNAME_SIZE: usize = 256;

const MAX_HEADER_BLOCK_SIZE: usize = 8 * 1024;
const MAX_BODY_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// Request methods the dispatcher distinguishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// CONNECT
    Connect,
    /// Anything else; answered with a 404.
    #[default]
    Other,
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "CONNECT" => Self::Connect,
            _ => Self::Other,
        }
    }
}

/// One parsed control request.
///
/// Only the headers the worker acts on are retained; every copy out of
/// the byte stream is bounded.
#[derive(Default)]
pub struct Request {
    /// The request method.
    pub method: Method,
    /// The request path. Empty until the request line has parsed.
    pub url: String,
    /// Minor HTTP version: 0 or 1. Keep-alive requires 1.
    pub http_minor: u8,
    /// `X-CSTP-Hostname`, when present and within bounds.
    pub hostname: Option<String>,
    /// The decoded `webvpn` cookie, when present and well formed.
    pub cookie: Option<[u8; COOKIE_SIZE]>,
    /// The decoded `X-DTLS-Master-Secret`, when present and well formed.
    pub master_secret: Option<[u8; TLS_MASTER_SIZE]>,
    /// `X-CSTP-MTU` advertised by the peer, 0 when absent.
    pub cstp_mtu: u16,
    /// `X-DTLS-MTU` advertised by the peer, 0 when absent.
    pub dtls_mtu: u16,
    /// POST body, owned. Present once `message_complete` is set on a
    /// request that carried one.
    pub body: Option<Bytes>,
    /// The header block has fully parsed.
    pub headers_complete: bool,
    /// The body (if any) has fully arrived.
    pub message_complete: bool,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Cookie and premaster are credentials; log presence only.
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("http_minor", &self.http_minor)
            .field("hostname", &self.hostname)
            .field("cookie", &self.cookie.is_some())
            .field("master_secret", &self.master_secret.is_some())
            .field("cstp_mtu", &self.cstp_mtu)
            .field("dtls_mtu", &self.dtls_mtu)
            .finish_non_exhaustive()
    }
}

/// Parse failures. Either way the control connection is done for.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The bytes do not form an HTTP/1.x request.
    #[error("error parsing HTTP request")]
    Malformed,
    /// The request line, header block or body exceeded a bound.
    #[error("HTTP request exceeds size limits")]
    TooLarge,
}

/// Byte-fed request parser. One instance per request.
#[derive(Default)]
pub struct RequestParser {
    buf: BytesMut,
    body: BytesMut,
    content_length: usize,
    request: Request,
}

impl RequestParser {
    /// A parser for a fresh request.
    pub fn new() -> Self {
        Self::default()
    }

    /// The record parsed so far.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Takes ownership of the record, body included.
    pub fn into_request(self) -> Request {
        self.request
    }

    /// Feeds another chunk of bytes from the control channel.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if self.request.message_complete {
            return Ok(());
        }

        if !self.request.headers_complete {
            if self.buf.len() + data.len() > MAX_HEADER_BLOCK_SIZE {
                return Err(ParseError::TooLarge);
            }
            self.buf.extend_from_slice(data);

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Request::new(&mut headers);
            let consumed = match parsed.parse(&self.buf) {
                Ok(httparse::Status::Complete(consumed)) => consumed,
                Ok(httparse::Status::Partial) => return Ok(()),
                Err(_) => return Err(ParseError::Malformed),
            };

            let mut request = Request {
                method: parsed.method.map(Method::from_token).unwrap_or_default(),
                http_minor: parsed.version.unwrap_or(0),
                headers_complete: true,
                ..Request::default()
            };

            let path = parsed.path.unwrap_or("");
            if path.len() >= MAX_URL_SIZE {
                return Err(ParseError::TooLarge);
            }
            request.url = path.to_owned();

            let mut content_length = 0usize;
            for header in parsed.headers.iter() {
                apply_header(&mut request, header.name, header.value, &mut content_length)?;
            }
            if content_length > MAX_BODY_SIZE {
                return Err(ParseError::TooLarge);
            }

            self.request = request;
            self.content_length = content_length;
            self.buf.advance(consumed);
        } else {
            self.buf.extend_from_slice(data);
        }

        self.drain_body();
        Ok(())
    }

    fn drain_body(&mut self) {
        let needed = self.content_length - self.body.len();
        let take = needed.min(self.buf.len());
        self.body.extend_from_slice(&self.buf.split_to(take));

        if self.body.len() == self.content_length {
            if self.content_length > 0 {
                self.request.body = Some(self.body.split().freeze());
            }
            self.request.message_complete = true;
        }
    }
}

fn apply_header(
    request: &mut Request,
    name: &str,
    value: &[u8],
    content_length: &mut usize,
) -> Result<(), ParseError> {
    if name.eq_ignore_ascii_case("Cookie") {
        request.cookie = parse_webvpn_cookie(value);
    } else if name.eq_ignore_ascii_case("X-DTLS-Master-Secret") {
        request.master_secret = parse_fixed_hex::<TLS_MASTER_SIZE>(value);
    } else if name.eq_ignore_ascii_case("X-DTLS-MTU") {
        request.dtls_mtu = parse_leading_int(value);
    } else if name.eq_ignore_ascii_case("X-CSTP-MTU") {
        request.cstp_mtu = parse_leading_int(value);
    } else if name.eq_ignore_ascii_case("X-CSTP-Hostname") {
        request.hostname = parse_hostname(value);
    } else if name.eq_ignore_ascii_case("Content-Length") {
        *content_length = std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(ParseError::Malformed)?;
    }
    // Any other header is parsed and discarded.

    Ok(())
}

/// Pulls the `webvpn=` value out of a Cookie header. The hex must
/// decode to exactly [`COOKIE_SIZE`] bytes; anything else leaves the
/// cookie unset.
fn parse_webvpn_cookie(value: &[u8]) -> Option<[u8; COOKIE_SIZE]> {
    const NEEDLE: &[u8] = b"webvpn=";

    let at = value.windows(NEEDLE.len()).position(|w| w == NEEDLE)?;
    let hex = &value[at + NEEDLE.len()..];
    parse_fixed_hex::<COOKIE_SIZE>(hex)
}

/// Decodes exactly `N * 2` leading hex characters, ignoring any
/// trailer. Too short or non-hex input yields `None`.
fn parse_fixed_hex<const N: usize>(value: &[u8]) -> Option<[u8; N]> {
    if value.len() < N * 2 {
        return None;
    }

    let mut out = [0u8; N];
    hex::decode_to_slice(&value[..N * 2], &mut out).ok()?;
    Some(out)
}

/// `atoi`-style integer parse: leading digits, 0 on anything else.
fn parse_leading_int(value: &[u8]) -> u16 {
    std::str::from_utf8(value)
        .ok()
        .map(|s| {
            let digits: &str = s
                .trim_start()
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .unwrap_or("");
            digits.parse().unwrap_or(0)
        })
        .unwrap_or(0)
}

fn parse_hostname(value: &[u8]) -> Option<String> {
    if value.len() >= MAX_HOSTNAME_SIZE {
        return None;
    }
    std::str::from_utf8(value).ok().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn parse(bytes: &[u8]) -> Result<Request, ParseError> {
        let mut parser = RequestParser::new();
        parser.feed(bytes)?;
        Ok(parser.into_request())
    }

    const COOKIE_HEX: &str =
        "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
    const MASTER_HEX: &str = "112233445566778899aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff00";

    #[test]
    fn get_root_http10() {
        let req = parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "/");
        assert_eq!(req.http_minor, 0);
        assert!(req.headers_complete);
        assert!(req.message_complete);
        assert!(req.body.is_none());
    }

    #[test]
    fn incremental_byte_at_a_time() {
        let raw = b"GET /auth HTTP/1.1\r\nHost: vpn.example.com\r\n\r\n";
        let mut parser = RequestParser::new();
        for b in raw {
            assert!(!parser.request().headers_complete);
            parser.feed(std::slice::from_ref(b)).unwrap();
        }
        let req = parser.into_request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "/auth");
        assert_eq!(req.http_minor, 1);
        assert!(req.message_complete);
    }

    #[test]
    fn connect_with_recognised_headers() {
        let raw = format!(
            "CONNECT /CSCOSSLC/tunnel HTTP/1.1\r\n\
             Cookie: webvpn={COOKIE_HEX}\r\n\
             X-DTLS-Master-Secret: {MASTER_HEX}\r\n\
             X-DTLS-MTU: 1400\r\n\
             X-CSTP-MTU: 1300\r\n\
             X-CSTP-Hostname: laptop\r\n\
             User-Agent: AnyConnect Linux 3.1\r\n\r\n"
        );
        let req = parse(raw.as_bytes()).unwrap();
        assert_eq!(req.method, Method::Connect);
        assert_eq!(req.url, "/CSCOSSLC/tunnel");
        assert_eq!(req.cookie.unwrap()[..4], [0x00, 0x11, 0x22, 0x33]);
        assert_eq!(req.master_secret.unwrap()[..2], [0x11, 0x22]);
        assert_eq!(req.dtls_mtu, 1400);
        assert_eq!(req.cstp_mtu, 1300);
        assert_eq!(req.hostname.as_deref(), Some("laptop"));
    }

    #[test]
    fn cookie_found_among_other_cookies() {
        let raw =
            format!("GET / HTTP/1.1\r\nCookie: lang=en; webvpn={COOKIE_HEX}; other=1\r\n\r\n");
        let req = parse(raw.as_bytes()).unwrap();
        assert!(req.cookie.is_some());
    }

    #[test_case(&format!("webvpn={}", &COOKIE_HEX[..62]); "hex too short")]
    #[test_case(&format!("webvpn=zz{}", &COOKIE_HEX[..62]); "not hex")]
    #[test_case("sessid=deadbeef"; "no webvpn value")]
    #[test_case("webvpn="; "empty value")]
    fn bad_cookies_leave_cookie_unset(value: &str) {
        let raw = format!("GET / HTTP/1.1\r\nCookie: {value}\r\n\r\n");
        let req = parse(raw.as_bytes()).unwrap();
        assert!(req.cookie.is_none());
    }

    #[test]
    fn short_master_secret_is_unset() {
        let raw = format!(
            "CONNECT /CSCOSSLC/tunnel HTTP/1.1\r\nX-DTLS-Master-Secret: {}\r\n\r\n",
            &MASTER_HEX[..95]
        );
        let req = parse(raw.as_bytes()).unwrap();
        assert!(req.master_secret.is_none());
    }

    #[test]
    fn url_bounds() {
        // One below the bound parses.
        let path = format!("/{}", "a".repeat(MAX_URL_SIZE - 2));
        let raw = format!("GET {path} HTTP/1.1\r\n\r\n");
        assert_eq!(parse(raw.as_bytes()).unwrap().url, path);

        // At the bound the request is rejected.
        let path = format!("/{}", "a".repeat(MAX_URL_SIZE - 1));
        let raw = format!("GET {path} HTTP/1.1\r\n\r\n");
        assert_eq!(parse(raw.as_bytes()).err(), Some(ParseError::TooLarge));
    }

    #[test]
    fn hostname_bounds() {
        let name = "h".repeat(MAX_HOSTNAME_SIZE - 1);
        let raw = format!("GET / HTTP/1.1\r\nX-CSTP-Hostname: {name}\r\n\r\n");
        assert_eq!(parse(raw.as_bytes()).unwrap().hostname.as_deref(), Some(&name[..]));

        let name = "h".repeat(MAX_HOSTNAME_SIZE);
        let raw = format!("GET / HTTP/1.1\r\nX-CSTP-Hostname: {name}\r\n\r\n");
        assert!(parse(raw.as_bytes()).unwrap().hostname.is_none());
    }

    #[test_case(b"1400", 1400; "plain")]
    #[test_case(b"1400;fudge", 1400; "leading digits")]
    #[test_case(b"fudge", 0; "no digits")]
    fn mtu_parses_like_atoi(value: &[u8], expected: u16) {
        let mut raw = b"GET / HTTP/1.1\r\nX-CSTP-MTU: ".to_vec();
        raw.extend_from_slice(value);
        raw.extend_from_slice(b"\r\n\r\n");
        assert_eq!(parse(&raw).unwrap().cstp_mtu, expected);
    }

    #[test]
    fn post_body_across_feeds() {
        let mut parser = RequestParser::new();
        parser
            .feed(b"POST /auth HTTP/1.1\r\nContent-Length: 11\r\n\r\nusern")
            .unwrap();
        assert!(parser.request().headers_complete);
        assert!(!parser.request().message_complete);

        parser.feed(b"ame=me").unwrap();
        let req = parser.into_request();
        assert!(req.message_complete);
        assert_eq!(req.body.as_deref(), Some(&b"username=me"[..]));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            parse(b"\x16\x03\x01\x02\x00garbage").err(),
            Some(ParseError::Malformed)
        );
    }

    #[test]
    fn unknown_method_is_other() {
        let req = parse(b"BREW /coffee HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::Other);
    }
}
