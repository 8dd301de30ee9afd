//! HTTP/1.1 wire framing: request/status lines, headers, and
//! content-length delimited bodies.
//!
//! Parsing is incremental over the inbound way's accumulation buffer: a
//! parse either yields a complete message plus the byte count it consumed,
//! yields `None` when more bytes are needed, or fails on malformed input.

use crate::buffer::Buffer;
use crate::error::Error;
use crate::message::{Request, Response, Scheme, Status};

/// Ceiling on a message head (start line + headers). A head that grows past
/// this without terminating is treated as malformed rather than buffered
/// forever.
const MAX_HEAD_BYTES: usize = 64 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Serializes a request in origin form. `Host` and `Content-Length` are
/// always emitted by the connector; caller copies of those headers are
/// skipped to avoid duplicates.
pub(crate) fn write_request(request: &Request, out: &mut Buffer) {
    out.write(request.method.as_bytes());
    out.write(b" ");
    out.write(request.path.as_bytes());
    out.write(b" HTTP/1.1\r\nHost: ");
    out.write(request.host.as_bytes());
    if let Some(port) = request.port {
        if port != request.scheme.default_port() {
            out.write(format!(":{port}").as_bytes());
        }
    }
    out.write(b"\r\n");
    write_common(&request.headers, request.body.len(), out);
    out.write(&request.body);
}

/// Serializes a response status line, headers, and body.
pub(crate) fn write_response(response: &Response, out: &mut Buffer) {
    out.write(b"HTTP/1.1 ");
    out.write(response.status.code.to_string().as_bytes());
    out.write(b" ");
    out.write(response.status.reason.as_bytes());
    out.write(b"\r\n");
    write_common(&response.headers, response.body.len(), out);
    out.write(&response.body);
}

fn write_common(headers: &[(String, String)], body_len: usize, out: &mut Buffer) {
    out.write(format!("Content-Length: {body_len}\r\n").as_bytes());
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.write(name.as_bytes());
        out.write(b": ");
        out.write(value.as_bytes());
        out.write(b"\r\n");
    }
    out.write(b"\r\n");
}

/// Attempts to parse one response from the front of `input`.
///
/// `eof` marks that the peer has closed its write side: a headers-complete
/// response without `Content-Length` is then taken as close-delimited and
/// consumes the rest of the input.
pub(crate) fn parse_response(input: &[u8], eof: bool) -> Result<Option<(Response, usize)>, Error> {
    let Some(head_len) = find_head_end(input)? else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&input[..head_len - HEAD_TERMINATOR.len()])
        .map_err(|_| Error::HttpParse("non-UTF-8 message head".into()))?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = parse_status_line(status_line)?;
    let headers = parse_headers(lines)?;

    let body_len = match content_length(&headers)? {
        Some(len) => len,
        // 1xx, 204 and 304 never carry a body; anything else without a
        // length is delimited by connection close.
        None if status.is_informational() || status.code == 204 || status.code == 304 => 0,
        None if eof => input.len() - head_len,
        None => return Ok(None),
    };
    if input.len() < head_len + body_len {
        return Ok(None);
    }
    let response = Response {
        status,
        headers,
        body: input[head_len..head_len + body_len].to_vec(),
        tls: None,
    };
    Ok(Some((response, head_len + body_len)))
}

/// Attempts to parse one request from the front of `input`.
///
/// The scheme is reported as `http`; the connection upgrades it to `https`
/// for requests that arrived over a TLS channel. Requests without
/// `Content-Length` have an empty body.
pub(crate) fn parse_request(input: &[u8]) -> Result<Option<(Request, usize)>, Error> {
    let Some(head_len) = find_head_end(input)? else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&input[..head_len - HEAD_TERMINATOR.len()])
        .map_err(|_| Error::HttpParse("non-UTF-8 message head".into()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() => (m, t, v),
        _ => {
            return Err(Error::HttpParse(format!(
                "malformed request line '{request_line}'"
            )))
        }
    };
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(Error::HttpParse(format!("unsupported version '{version}'")));
    }
    let headers = parse_headers(lines)?;

    let body_len = content_length(&headers)?.unwrap_or(0);
    if input.len() < head_len + body_len {
        return Ok(None);
    }

    let (host, port) = match header_value(&headers, "host") {
        Some(value) => split_host_port(value)?,
        None => (String::new(), None),
    };
    let request = Request {
        method: method.to_string(),
        scheme: Scheme::Http,
        host,
        port,
        path: target.to_string(),
        headers,
        body: input[head_len..head_len + body_len].to_vec(),
        tls: None,
    };
    Ok(Some((request, head_len + body_len)))
}

fn find_head_end(input: &[u8]) -> Result<Option<usize>, Error> {
    match input
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
    {
        Some(pos) => Ok(Some(pos + HEAD_TERMINATOR.len())),
        None if input.len() > MAX_HEAD_BYTES => Err(Error::HttpHeadTooLarge {
            limit: MAX_HEAD_BYTES,
        }),
        None => Ok(None),
    }
}

fn parse_status_line(line: &str) -> Result<Status, Error> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(Error::HttpParse(format!(
            "malformed status line '{line}'"
        )));
    }
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| Error::HttpParse(format!("malformed status line '{line}'")))?;
    Ok(Status::new(code, parts.next().unwrap_or_default()))
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, Error> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::HttpParse(format!("malformed header '{line}'")));
        };
        if name.is_empty() || name.contains(' ') {
            return Err(Error::HttpParse(format!("malformed header name '{name}'")));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, Error> {
    match header_value(headers, "content-length") {
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Error::HttpParse(format!("invalid Content-Length '{value}'"))),
        None => Ok(None),
    }
}

fn split_host_port(value: &str) -> Result<(String, Option<u16>), Error> {
    // A bare IPv6 literal contains ':' but never a port; only the
    // bracketed form or a value with a single ':' can carry one.
    let can_carry_port = value.starts_with('[') || value.matches(':').count() == 1;
    match value.rsplit_once(':') {
        Some((host, port))
            if can_carry_port
                && !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::HttpParse(format!("invalid Host port '{value}'")))?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((value.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize_request(request: &Request) -> Vec<u8> {
        let mut buf = Buffer::with_capacity(256);
        write_request(request, &mut buf);
        buf.peek().to_vec()
    }

    #[test]
    fn request_wire_form_has_host_and_length() {
        let request = Request::new("POST", Scheme::Http, "example.com", "/items")
            .with_header("Accept", "text/plain")
            .with_body("abc");
        let wire = serialize_request(&request);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("POST /items HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("Accept: text/plain\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn non_default_port_appears_in_host_header() {
        let request = Request::get(Scheme::Http, "example.com", "/").with_port(8080);
        let wire = serialize_request(&request);
        assert!(std::str::from_utf8(&wire)
            .unwrap()
            .contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn request_round_trips_through_parser() {
        let request = Request::new("PUT", Scheme::Http, "localhost", "/x?q=1")
            .with_port(8080)
            .with_body("payload");
        let wire = serialize_request(&request);
        let (parsed, consumed) = parse_request(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(parsed.method, "PUT");
        assert_eq!(parsed.path, "/x?q=1");
        assert_eq!(parsed.host, "localhost");
        assert_eq!(parsed.port, Some(8080));
        assert_eq!(parsed.body, b"payload");
    }

    #[test]
    fn partial_input_parses_to_none() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nab";
        assert!(parse_response(wire, false).unwrap().is_none());
        let partial_head = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert!(parse_response(partial_head, false).unwrap().is_none());
    }

    #[test]
    fn response_parses_with_trailing_pipelined_bytes() {
        let wire = b"HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\ngoneHTTP/1.1 200";
        let (response, consumed) = parse_response(wire, false).unwrap().unwrap();
        assert_eq!(response.status.code, 404);
        assert_eq!(response.status.reason, "Not Found");
        assert_eq!(response.body, b"gone");
        assert_eq!(&wire[consumed..], b"HTTP/1.1 200");
    }

    #[test]
    fn lengthless_response_waits_for_close() {
        let wire = b"HTTP/1.1 200 OK\r\n\r\nstream";
        assert!(parse_response(wire, false).unwrap().is_none());
        let (response, consumed) = parse_response(wire, true).unwrap().unwrap();
        assert_eq!(response.body, b"stream");
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn no_content_statuses_have_empty_bodies() {
        let wire = b"HTTP/1.1 204 No Content\r\n\r\n";
        let (response, consumed) = parse_response(wire, false).unwrap().unwrap();
        assert_eq!(response.status.code, 204);
        assert!(response.body.is_empty());
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn malformed_heads_are_rejected() {
        assert!(parse_response(b"NONSENSE 200 OK\r\n\r\n", false).is_err());
        assert!(parse_request(b"GET\r\n\r\n").is_err());
        assert!(parse_request(b"GET / HTTP/2.0\r\n\r\n").is_err());
        assert!(parse_response(b"HTTP/1.1 999999 X\r\n\r\n", false).is_err());
        assert!(
            parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: ten\r\n\r\n", false).is_err()
        );
    }

    #[test]
    fn ipv6_host_header_keeps_the_literal() {
        let (host, port) = split_host_port("[::1]:8080").unwrap();
        assert_eq!(host, "[::1]");
        assert_eq!(port, Some(8080));
        let (host, port) = split_host_port("::1").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, None);
        let (host, port) = split_host_port("2001:db8::1").unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, None);
        let (host, port) = split_host_port("example.com:8080").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, Some(8080));
    }

    #[test]
    fn unterminated_head_past_the_limit_errors() {
        let huge = vec![b'a'; MAX_HEAD_BYTES + 1];
        assert!(matches!(
            parse_response(&huge, false),
            Err(Error::HttpHeadTooLarge { .. })
        ));
    }
}
