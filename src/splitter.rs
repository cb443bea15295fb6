//! Incremental SIP message framer for byte streams.
//!
//! A single SIP message may span multiple TCP segments, several messages
//! may share one long-lived stream, and messages do not have to start on
//! a segment boundary. The splitter consumes an accumulated buffer and
//! reports how many bytes to advance and whether those bytes form one
//! complete message, so the caller can frame a stream without copying.

use thiserror::Error;

use crate::sip::find_subslice;

const CRLF: &[u8] = b"\r\n";
const CRLF_CRLF: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    /// The message had a missing or unparsable Content-Length header and
    /// the splitter was configured to treat that as fatal.
    #[error("invalid Content-Length")]
    BadContentLength,
}

/// One framing step over the accumulated buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Not enough bytes yet; feed more and call again.
    More,
    /// The first `n` bytes are junk or an unrecoverable message; drop
    /// them and call again on the remainder.
    Skip(usize),
    /// The first `n` bytes are one complete SIP message.
    Message(usize),
}

/// Observation hooks run at each phase of splitting, for instrumentation.
/// Any hook may be absent. Hooks never affect framing decisions.
#[derive(Default)]
pub struct Trace {
    /// Non-SIP bytes are being dropped, either leading junk or a
    /// resynchronization after an unparsable message.
    pub discard: Option<Box<dyn FnMut(&[u8]) + Send>>,
    /// The stream does not yet hold a plausible request or status line.
    pub no_start_line: Option<Box<dyn FnMut() + Send>>,
    /// A plausible start line was found; the argument is the whole line.
    pub start_line: Option<Box<dyn FnMut(&[u8]) + Send>>,
    /// A start line exists but the header block is not complete yet.
    pub no_headers: Option<Box<dyn FnMut() + Send>>,
    /// The full header block, excluding the start line and the blank line.
    pub headers: Option<Box<dyn FnMut(&[u8]) + Send>>,
    /// Headers are complete but the body is still short of Content-Length.
    pub no_body: Option<Box<dyn FnMut() + Send>>,
    /// The full body, exactly Content-Length bytes.
    pub body: Option<Box<dyn FnMut(&[u8]) + Send>>,
    /// One whole message, start line through body.
    pub complete: Option<Box<dyn FnMut(&[u8]) + Send>>,
}

/// Stateful splitter that frames SIP messages out of a byte stream. The
/// default value is usable and will silently discard unparsable input.
#[derive(Default)]
pub struct Splitter {
    pub trace: Trace,
    /// Fail the stream on a missing/unparsable Content-Length instead of
    /// resynchronizing.
    pub exit_on_error: bool,

    // Buffer length seen by the previous invocation, so a final at-EOF
    // pass over an unchanged buffer does not re-run terminal hooks.
    last: usize,
}

impl Splitter {
    pub fn new(trace: Trace, exit_on_error: bool) -> Self {
        Splitter {
            trace,
            exit_on_error,
            last: 0,
        }
    }

    /// Examine the accumulated buffer and decide the next framing step.
    /// `at_eof` marks the final invocation for a stream; with an
    /// unchanged or empty buffer it is a no-op.
    pub fn split(&mut self, buf: &[u8], at_eof: bool) -> Result<Step, SplitError> {
        if at_eof && (buf.is_empty() || buf.len() == self.last) {
            return Ok(Step::More);
        }
        self.last = buf.len();

        let line_end = match find_start_line(buf) {
            StartScan::NeedMore => {
                if let Some(hook) = self.trace.no_start_line.as_mut() {
                    hook();
                }
                return Ok(Step::More);
            }
            StartScan::After(junk) => {
                // A start line exists, but junk precedes it. Discard the
                // junk and let the caller try again.
                if let Some(hook) = self.trace.discard.as_mut() {
                    hook(&buf[..junk]);
                }
                return Ok(Step::Skip(junk));
            }
            StartScan::AtStart(end) => end,
        };

        if let Some(hook) = self.trace.start_line.as_mut() {
            hook(&buf[..line_end]);
        }

        let Some(boundary) = find_subslice(buf, CRLF_CRLF) else {
            if let Some(hook) = self.trace.no_headers.as_mut() {
                hook();
            }
            return Ok(Step::More);
        };

        // The terminating CRLF belongs to the last header; the empty line
        // after it delimits the body.
        let headers_end = boundary + CRLF.len();
        if let Some(hook) = self.trace.headers.as_mut() {
            hook(&buf[line_end..headers_end]);
        }
        let body_start = headers_end + CRLF.len();

        let Some(content_length) = content_length(&buf[..body_start]) else {
            // Content-Length is junk; this message is irrecoverable.
            if self.exit_on_error {
                return Err(SplitError::BadContentLength);
            }
            // Discard through the current headers. The body bytes left
            // behind get discarded by the start-line scan on re-entry.
            if let Some(hook) = self.trace.discard.as_mut() {
                hook(&buf[..body_start]);
            }
            return Ok(Step::Skip(body_start));
        };

        let total = body_start + content_length;
        if total > buf.len() {
            if let Some(hook) = self.trace.no_body.as_mut() {
                hook();
            }
            return Ok(Step::More);
        }

        if let Some(hook) = self.trace.body.as_mut() {
            hook(&buf[body_start..total]);
        }
        if let Some(hook) = self.trace.complete.as_mut() {
            hook(&buf[..total]);
        }
        Ok(Step::Message(total))
    }
}

enum StartScan {
    /// No candidate start line; wait for more bytes.
    NeedMore,
    /// A start line begins after this many junk bytes.
    After(usize),
    /// The buffer begins with a start line ending at this offset.
    AtStart(usize),
}

/// Scan CRLF-delimited lines until one could plausibly begin a SIP
/// message. Matching is "good enough" rather than full validation; the
/// worst an adversarial stream can cause is extra discarded bytes.
fn find_start_line(buf: &[u8]) -> StartScan {
    let mut start = 0;
    while start < buf.len() {
        let Some(rel) = find_subslice(&buf[start..], CRLF) else {
            return StartScan::NeedMore;
        };
        let line_end = rel + CRLF.len();
        let line = &buf[start..start + line_end];
        if is_request_line(line) || is_status_line(line) {
            return if start == 0 { StartScan::AtStart(line_end) } else { StartScan::After(start) };
        }
        start += line_end;
    }
    StartScan::NeedMore
}

/// The method names that may begin a request line, ordered by rough
/// likelihood since they are scanned sequentially.
const METHODS: &[&[u8]] = &[
    b"INVITE",
    b"ACK",
    b"BYE",
    b"OPTIONS",
    b"REGISTER",
    b"CANCEL",
    b"PUBLISH",
    b"PRACK",
    b"INFO",
    b"SUBSCRIBE",
    b"NOTIFY",
    b"UPDATE",
    b"MESSAGE",
    b"REFER",
];

/// Could this line be `Method SP Request-URI SP "SIP/" version CRLF`?
fn is_request_line(line: &[u8]) -> bool {
    // Shorter than `ACK x SIP/2.0\r\n` cannot be a request, and every
    // method name starts with one of these bytes, so bail early.
    if line.len() < 15 || !b"BACONPURISM".contains(&line[0]) {
        return false;
    }

    let Some(s1) = line.iter().position(|&b| b == b' ') else {
        return false;
    };
    let Some(s2) = line[s1 + 1..].iter().position(|&b| b == b' ') else {
        return false;
    };
    let s2 = s2 + s1 + 1;

    if !METHODS.contains(&&line[..s1]) {
        return false;
    }
    // Could validate the URI or the exact SIP version here.
    line[s2 + 1..].starts_with(b"SIP/")
}

/// Could this line be `"SIP/" version SP status SP reason CRLF`?
fn is_status_line(line: &[u8]) -> bool {
    if line.len() < 14 || !line.starts_with(b"SIP/") {
        return false;
    }
    let Some(s1) = line.iter().position(|&b| b == b' ') else {
        return false;
    };
    line[s1 + 1..].iter().any(|&b| b == b' ')
}

/// Locate a Content-Length (or compact `l`) header in the message head
/// and parse its value. Matching is case-insensitive and keys off the
/// preceding CRLF, so it must be called on the full head including the
/// start line. Returns None when absent or unparsable.
fn content_length(head: &[u8]) -> Option<usize> {
    let value_start = find_header_value(head, b"content-length:")
        .or_else(|| find_header_value(head, b"l:"))?;
    let rest = &head[value_start..];
    let eol = find_subslice(rest, CRLF)?;
    let value = std::str::from_utf8(&rest[..eol]).ok()?;
    value.trim_matches(|c| c == ' ' || c == '\t').parse::<usize>().ok()
}

/// Find `CRLF name` case-insensitively; returns the offset just past the
/// name (the start of the header value).
fn find_header_value(head: &[u8], name: &[u8]) -> Option<usize> {
    let end = head.len().checked_sub(CRLF.len() + name.len())?;
    for pos in 0..=end {
        if !head[pos..].starts_with(CRLF) {
            continue;
        }
        let field = &head[pos + CRLF.len()..pos + CRLF.len() + name.len()];
        if field.eq_ignore_ascii_case(name) {
            return Some(pos + CRLF.len() + name.len());
        }
    }
    None
}
