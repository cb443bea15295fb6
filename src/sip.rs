//! SIP message model and parser.
//!
//! Parses a complete SIP message (request or response) out of a byte
//! slice: start line, a case-insensitive header multimap that honors the
//! RFC 3261 compact header forms, and the raw body. No semantic
//! validation happens here; dialogs and transactions are out of scope.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SipError {
    #[error("not a SIP message: {0}")]
    BadStartLine(String),
    #[error("missing header terminator")]
    NoHeaderEnd,
}

/// The SIP request methods defined by RFC 3261 and its common extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Options,
    Register,
    Cancel,
    Publish,
    Prack,
    Info,
    Subscribe,
    Notify,
    Update,
    Message,
    Refer,
}

impl SipMethod {
    /// Parse a method name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        let m = match s.to_ascii_uppercase().as_str() {
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            "REGISTER" => SipMethod::Register,
            "CANCEL" => SipMethod::Cancel,
            "PUBLISH" => SipMethod::Publish,
            "PRACK" => SipMethod::Prack,
            "INFO" => SipMethod::Info,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "UPDATE" => SipMethod::Update,
            "MESSAGE" => SipMethod::Message,
            "REFER" => SipMethod::Refer,
            _ => return None,
        };
        Some(m)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Register => "REGISTER",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Publish => "PUBLISH",
            SipMethod::Prack => "PRACK",
            SipMethod::Info => "INFO",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Update => "UPDATE",
            SipMethod::Message => "MESSAGE",
            SipMethod::Refer => "REFER",
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a header name to its canonical lowercase long form, folding the
/// RFC 3261 compact forms into their full names.
fn canonical_header(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "t" => "to".into(),
        "f" => "from".into(),
        "i" => "call-id".into(),
        "l" => "content-length".into(),
        "v" => "via".into(),
        "m" => "contact".into(),
        "s" => "subject".into(),
        "c" => "content-type".into(),
        "e" => "content-encoding".into(),
        "k" => "supported".into(),
        _ => lower,
    }
}

/// A parsed SIP message. Keeps the raw header and body bytes around so
/// the capture envelope can republish the message verbatim.
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub is_response: bool,
    pub method: Option<SipMethod>,
    pub response_code: Option<i64>,
    headers: Vec<(String, String)>,
    raw_headers: Vec<u8>,
    body: Vec<u8>,
}

impl SipMessage {
    /// Parse a complete SIP message from raw bytes. The start line must
    /// look like a SIP request or status line and the header block must
    /// be terminated by an empty line; anything after the empty line is
    /// the body.
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let boundary = find_subslice(data, b"\r\n\r\n").ok_or(SipError::NoHeaderEnd)?;
        let head = &data[..boundary];
        let body_start = boundary + 4;

        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");
        let start = lines.next().unwrap_or_default();

        let (is_response, method, response_code) = parse_start_line(start)?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // RFC 3261 header folding: continuation of the previous value.
                if let Some(last) = headers.last_mut() {
                    last.1.push(' ');
                    last.1.push_str(line.trim());
                }
                continue;
            }
            if let Some(colon) = line.find(':') {
                let name = canonical_header(&line[..colon]);
                let value = line[colon + 1..].trim().to_string();
                headers.push((name, value));
            }
        }

        Ok(SipMessage {
            is_response,
            method,
            response_code,
            headers,
            raw_headers: data[..body_start].to_vec(),
            body: data[body_start..].to_vec(),
        })
    }

    /// All values for a header, matching case-insensitively and across
    /// long/compact forms, in message order.
    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let want = canonical_header(name);
        self.headers
            .iter()
            .filter(move |(n, _)| *n == want)
            .map(|(_, v)| v.as_str())
    }

    /// The first value of a header, if any.
    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.first_header("call-id")
    }

    /// The start line and header block, including the blank line.
    pub fn raw_headers(&self) -> &[u8] {
        &self.raw_headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

fn parse_start_line(line: &str) -> Result<(bool, Option<SipMethod>, Option<i64>), SipError> {
    if let Some(rest) = line.strip_prefix("SIP/") {
        // Status-Line = SIP-Version SP Status-Code SP Reason-Phrase
        let mut parts = rest.splitn(3, ' ');
        let _version = parts.next();
        let code = parts
            .next()
            .and_then(|c| c.parse::<i64>().ok())
            .ok_or_else(|| SipError::BadStartLine(line.into()))?;
        return Ok((true, None, Some(code)));
    }

    // Request-Line = Method SP Request-URI SP SIP-Version
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().and_then(SipMethod::parse);
    let _uri = parts.next();
    let version = parts.next();
    match (method, version) {
        (Some(m), Some(v)) if v.starts_with("SIP/") => Ok((false, Some(m), None)),
        _ => Err(SipError::BadStartLine(line.into())),
    }
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
        To: Bob <sip:bob@biloxi.com>\r\n\
        f: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
        i: a84b4c76e66710@pc33.atlanta.com\r\n\
        Content-Length: 4\r\n\
        \r\n\
        ring";

    #[test]
    fn parses_request() {
        let msg = SipMessage::parse(INVITE).unwrap();
        assert!(!msg.is_response);
        assert_eq!(msg.method, Some(SipMethod::Invite));
        assert_eq!(msg.response_code, None);
        assert_eq!(msg.body(), b"ring");
    }

    #[test]
    fn parses_response() {
        let msg = SipMessage::parse(b"SIP/2.0 180 Ringing\r\nTo: Bob\r\n\r\n").unwrap();
        assert!(msg.is_response);
        assert_eq!(msg.response_code, Some(180));
        assert_eq!(msg.method, None);
        assert!(msg.body().is_empty());
    }

    #[test]
    fn compact_forms_alias_long_names() {
        let msg = SipMessage::parse(INVITE).unwrap();
        assert_eq!(msg.first_header("From"), Some("Alice <sip:alice@atlanta.com>;tag=1928301774"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710@pc33.atlanta.com"));
        // Long-form query finds compact-form header and vice versa.
        assert_eq!(msg.first_header("TO"), Some("Bob <sip:bob@biloxi.com>"));
        assert_eq!(msg.first_header("l"), Some("4"));
    }

    #[test]
    fn repeated_headers_keep_order() {
        let msg = SipMessage::parse(
            b"BYE sip:x@y SIP/2.0\r\nVia: first\r\nv: second\r\n\r\n",
        )
        .unwrap();
        let vias: Vec<_> = msg.header_values("via").collect();
        assert_eq!(vias, vec!["first", "second"]);
        assert_eq!(msg.first_header("Via"), Some("first"));
    }

    #[test]
    fn folded_header_joins_continuation() {
        let msg = SipMessage::parse(
            b"OPTIONS sip:x@y SIP/2.0\r\nSubject: first part\r\n  and the rest\r\n\r\n",
        )
        .unwrap();
        assert_eq!(msg.first_header("s"), Some("first part and the rest"));
    }

    #[test]
    fn rejects_junk() {
        assert!(SipMessage::parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"random bytes").is_err());
        assert!(SipMessage::parse(b"INVITE sip:x@y SIP/2.0\r\nNo: end").is_err());
    }

    #[test]
    fn raw_bytes_roundtrip() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let mut rebuilt = msg.raw_headers().to_vec();
        rebuilt.extend_from_slice(msg.body());
        assert_eq!(rebuilt, INVITE);
    }
}
