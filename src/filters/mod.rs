//! SIP message matching filter DSL.
//!
//! Filters are written as s-expressions selecting which aspects of a SIP
//! message to match. The empty string compiles to a filter that passes
//! every message. Selection functions:
//!
//! ```text
//! request          the message is a SIP request
//! response         the message is a SIP response
//! (status n ...)   a response with any of the numeric status codes
//! (methods s ...)  the request method is one of the named SIP methods
//! (hasheader s)    a header with the given name is present
//! (header s re)    any instance of the named header matches the regexp
//! (to re)          the To header matches the regexp
//! (from re)        the From header matches the regexp
//! (body re)        the body matches the regexp
//! (message re)     the headers or the body match the regexp
//! (not f)          negation
//! (any f ...)      logical or
//! (all f ...)      logical and
//! ```
//!
//! String and regexp arguments use "double quotes" with no escape
//! processing; header name matching is case-insensitive and crosses SIP
//! long/short header forms. Regular expressions compile once, at filter
//! build time, since the compiled filter runs on the packet hot path.

pub mod sexp;

use regex::bytes;
use regex::Regex;
use thiserror::Error;

use crate::sip::{SipMessage, SipMethod};
use sexp::Expr;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unmatched parens")]
    MismatchedParen,
    #[error("unmatched quote")]
    MismatchedQuote,
    #[error("{0}: not an integer")]
    NeedInt(String),
    #[error("{0}: not a string")]
    NeedString(String),
    #[error("methods takes a list of sip method names, got {0}")]
    MethodsType(String),
    #[error("{0}: wrong number of args")]
    WrongArgCount(String),
    #[error("unexpected token after expression")]
    ExtraTokens,
    #[error("unknown filter function: {0}")]
    UnknownFunc(String),
    #[error("empty expression")]
    EmptyExpression,
    #[error("expression must start with a function name")]
    ExpressionType,
    #[error("unable to compile regexp: {0}")]
    BadRegexp(#[from] regex::Error),
}

/// A compiled filter: a pure predicate over SIP messages.
pub type Filter = Box<dyn Fn(&SipMessage) -> bool + Send + Sync>;

/// Compile s-expression source into an invokable [`Filter`]. Empty or
/// all-whitespace source compiles to the always-pass filter.
pub fn compile(source: &str) -> Result<Filter, FilterError> {
    let source = source.trim();
    if source.is_empty() {
        return Ok(Box::new(|_| true));
    }
    let expr = sexp::parse(source)?;
    compile_expr(&expr)
}

/// Compile one expression node. A bare atom is a zero-argument function;
/// a list is a function name followed by its arguments. Logic functions
/// recurse back here for their sub-filters.
fn compile_expr(expr: &Expr) -> Result<Filter, FilterError> {
    let (name, args): (&str, &[Expr]) = match expr {
        Expr::Atom(name) => (name.as_str(), &[]),
        Expr::List(items) => match items.split_first() {
            None => return Err(FilterError::EmptyExpression),
            Some((Expr::Atom(name), rest)) => (name.as_str(), rest),
            Some(_) => return Err(FilterError::ExpressionType),
        },
        _ => return Err(FilterError::ExpressionType),
    };

    match name {
        "request" => build_request(args),
        "response" => build_response(args),
        "methods" => build_methods(args),
        "status" => build_status(args),
        "hasheader" => build_hasheader(args),
        "header" => build_header(args),
        "to" => build_header_regex(args, "to"),
        "from" => build_header_regex(args, "from"),
        "body" => build_body(args),
        "message" => build_message(args),
        "not" => build_not(args),
        "any" => build_any(args),
        "all" => build_all(args),
        other => Err(FilterError::UnknownFunc(other.to_string())),
    }
}

fn one_regex(name: &str, args: &[Expr]) -> Result<Regex, FilterError> {
    match args {
        [Expr::Str(pattern)] => Ok(Regex::new(pattern)?),
        [_] => Err(FilterError::NeedString(name.to_string())),
        _ => Err(FilterError::WrongArgCount(name.to_string())),
    }
}

fn one_bytes_regex(name: &str, args: &[Expr]) -> Result<bytes::Regex, FilterError> {
    match args {
        [Expr::Str(pattern)] => Ok(bytes::Regex::new(pattern)?),
        [_] => Err(FilterError::NeedString(name.to_string())),
        _ => Err(FilterError::WrongArgCount(name.to_string())),
    }
}

fn build_request(args: &[Expr]) -> Result<Filter, FilterError> {
    if !args.is_empty() {
        return Err(FilterError::WrongArgCount("request takes no args".into()));
    }
    Ok(Box::new(|msg| !msg.is_response))
}

fn build_response(args: &[Expr]) -> Result<Filter, FilterError> {
    if !args.is_empty() {
        return Err(FilterError::WrongArgCount("response takes no args".into()));
    }
    Ok(Box::new(|msg| msg.is_response))
}

fn build_methods(args: &[Expr]) -> Result<Filter, FilterError> {
    let mut methods = Vec::with_capacity(args.len());
    for arg in args {
        let name = match arg {
            Expr::Atom(s) | Expr::Str(s) => s,
            other => return Err(FilterError::MethodsType(format!("{other:?}"))),
        };
        let method = SipMethod::parse(name)
            .ok_or_else(|| FilterError::MethodsType(name.clone()))?;
        methods.push(method);
    }
    Ok(Box::new(move |msg| {
        msg.method.map_or(false, |m| methods.contains(&m))
    }))
}

fn build_status(args: &[Expr]) -> Result<Filter, FilterError> {
    if args.is_empty() {
        return Err(FilterError::WrongArgCount("status needs 1 or more args".into()));
    }
    let mut codes = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Expr::Int(n) => codes.push(*n),
            other => return Err(FilterError::NeedInt(format!("{other:?}"))),
        }
    }
    Ok(Box::new(move |msg| {
        msg.is_response && msg.response_code.map_or(false, |c| codes.contains(&c))
    }))
}

fn build_hasheader(args: &[Expr]) -> Result<Filter, FilterError> {
    let field = match args {
        [Expr::Str(name)] => name.clone(),
        [_] => return Err(FilterError::NeedString("hasheader".into())),
        _ => return Err(FilterError::WrongArgCount("hasheader".into())),
    };
    Ok(Box::new(move |msg| {
        // Any value will do, as long as it is not empty.
        msg.first_header(&field).is_some_and(|v| !v.is_empty())
    }))
}

fn build_header(args: &[Expr]) -> Result<Filter, FilterError> {
    let (field, pattern) = match args {
        [Expr::Str(name), Expr::Str(pattern)] => (name.clone(), pattern),
        [_, _] => return Err(FilterError::NeedString("header".into())),
        _ => return Err(FilterError::WrongArgCount("header".into())),
    };
    let re = Regex::new(pattern)?;
    Ok(Box::new(move |msg| {
        msg.header_values(&field).any(|v| re.is_match(v))
    }))
}

fn build_header_regex(args: &[Expr], field: &'static str) -> Result<Filter, FilterError> {
    let re = one_regex(field, args)?;
    Ok(Box::new(move |msg| {
        re.is_match(msg.first_header(field).unwrap_or_default())
    }))
}

fn build_body(args: &[Expr]) -> Result<Filter, FilterError> {
    let re = one_bytes_regex("body", args)?;
    Ok(Box::new(move |msg| re.is_match(msg.body())))
}

fn build_message(args: &[Expr]) -> Result<Filter, FilterError> {
    let re = one_bytes_regex("message", args)?;
    Ok(Box::new(move |msg| {
        re.is_match(msg.raw_headers()) || re.is_match(msg.body())
    }))
}

fn build_not(args: &[Expr]) -> Result<Filter, FilterError> {
    let [arg] = args else {
        return Err(FilterError::WrongArgCount("not takes exactly one filter".into()));
    };
    let inner = compile_expr(arg)?;
    Ok(Box::new(move |msg| !inner(msg)))
}

fn compile_filter_args(name: &str, args: &[Expr]) -> Result<Vec<Filter>, FilterError> {
    if args.is_empty() {
        return Err(FilterError::WrongArgCount(name.to_string()));
    }
    args.iter().map(compile_expr).collect()
}

fn build_any(args: &[Expr]) -> Result<Filter, FilterError> {
    let filters = compile_filter_args("any", args)?;
    Ok(Box::new(move |msg| filters.iter().any(|f| f(msg))))
}

fn build_all(args: &[Expr]) -> Result<Filter, FilterError> {
    let filters = compile_filter_args("all", args)?;
    Ok(Box::new(move |msg| filters.iter().all(|f| f(msg))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SipMessage {
        SipMessage::parse(
            b"INVITE sip:alice@sip.provider.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 172.16.166.2:5060;branch=z9hG4bK776\r\n\
              To: Alice <sip:alice@sip.provider.com>\r\n\
              From: Bob <sip:bob@sip.provider.com>;tag=456248\r\n\
              Call-ID: 12345678@foo.com\r\n\
              Contact: <sip:bob@172.16.166.2>\r\n\
              CSeq: 1 INVITE\r\n\
              Content-Type: text/plain\r\n\
              Content-Length: 11\r\n\
              \r\n\
              Hello World",
        )
        .expect("request fixture parses")
    }

    fn response() -> SipMessage {
        SipMessage::parse(
            b"SIP/2.0 200 OK\r\n\
              Via: SIP/2.0/UDP 172.16.166.2:5060;branch=z9hG4bK776\r\n\
              To: Alice <sip:alice@sip.provider.com>;tag=as58f4\r\n\
              From: Bob <sip:bob@sip.provider.com>;tag=456248\r\n\
              Call-ID: 12345678@foo.com\r\n\
              CSeq: 1 INVITE\r\n\
              Content-Length: 0\r\n\
              \r\n",
        )
        .expect("response fixture parses")
    }

    #[test]
    fn compile_failures() {
        let cases: &[(&str, fn(&FilterError) -> bool)] = &[
            ("()", |e| matches!(e, FilterError::EmptyExpression)),
            ("doit", |e| matches!(e, FilterError::UnknownFunc(_))),
            ("response request", |e| matches!(e, FilterError::ExtraTokens)),
            ("(not ())", |e| matches!(e, FilterError::EmptyExpression)),
            ("(methods 100 200", |e| matches!(e, FilterError::MismatchedParen)),
            (")", |e| matches!(e, FilterError::MismatchedParen)),
            (r#"(to "blah)"#, |e| matches!(e, FilterError::MismatchedQuote)),
            ("hasheader blah", |e| matches!(e, FilterError::ExtraTokens)),
            ("(request blah)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(response blah)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(100)", |e| matches!(e, FilterError::ExpressionType)),
            ("body foo", |e| matches!(e, FilterError::ExtraTokens)),
            (r#"(body "foo" "bar")"#, |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(body 100)", |e| matches!(e, FilterError::NeedString(_))),
            (r#"(body "[")"#, |e| matches!(e, FilterError::BadRegexp(_))),
            ("not", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(not)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(not (any response) request)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(not 100)", |e| matches!(e, FilterError::ExpressionType)),
            ("(not body foo)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(any)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(any doit)", |e| matches!(e, FilterError::UnknownFunc(_))),
            ("(all body)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(all)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(methods 100)", |e| matches!(e, FilterError::MethodsType(_))),
            ("(methods foo)", |e| matches!(e, FilterError::MethodsType(_))),
            ("status", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(status foo)", |e| matches!(e, FilterError::NeedInt(_))),
            ("(to)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(to 18005551212)", |e| matches!(e, FilterError::NeedString(_))),
            ("(from)", |e| matches!(e, FilterError::WrongArgCount(_))),
            ("(from bob)", |e| matches!(e, FilterError::NeedString(_))),
            ("(hasheader 100)", |e| matches!(e, FilterError::NeedString(_))),
            (r#"(hasheader "foo" "bar")"#, |e| matches!(e, FilterError::WrongArgCount(_))),
            ("header", |e| matches!(e, FilterError::WrongArgCount(_))),
            (r#"(header "foo")"#, |e| matches!(e, FilterError::WrongArgCount(_))),
            (r#"(header "foo" "bar" "baz")"#, |e| matches!(e, FilterError::WrongArgCount(_))),
            (r#"(header "via" "[")"#, |e| matches!(e, FilterError::BadRegexp(_))),
            (r#"(header 100 "alice")"#, |e| matches!(e, FilterError::NeedString(_))),
            (r#"(header "via" 100)"#, |e| matches!(e, FilterError::NeedString(_))),
            (r#"(message "[" "that")"#, |e| matches!(e, FilterError::WrongArgCount(_))),
            (r#"(message "[")"#, |e| matches!(e, FilterError::BadRegexp(_))),
        ];
        for (src, check) in cases {
            let err = compile(src).err().unwrap_or_else(|| panic!("{src:?} should not compile"));
            assert!(check(&err), "{src:?} produced unexpected error {err:?}");
        }
    }

    #[test]
    fn empty_source_passes_everything() {
        for src in ["", "    ", "\t\n"] {
            let filter = compile(src).unwrap();
            assert!(filter(&request()));
            assert!(filter(&response()));
        }
    }

    #[test]
    fn evaluation() {
        let req = request();
        let resp = response();
        let cases: &[(&str, &SipMessage, bool)] = &[
            ("response", &resp, true),
            ("response", &req, false),
            ("request", &req, true),
            ("request", &resp, false),
            ("(status 200)", &resp, true),
            ("(status 403)", &resp, false),
            ("(status 100 180 200)", &resp, true),
            ("(status 200)", &req, false),
            (r#"(body "(?i:world)")"#, &req, true),
            ("(methods invite)", &req, true),
            ("(methods options)", &req, false),
            ("(methods options invite)", &req, true),
            (r#"(methods options "invite")"#, &req, true),
            (r#"(hasheader "Via")"#, &req, true),
            (r#"(hasheader "Not-There")"#, &req, false),
            (r#"(to "alice")"#, &req, true),
            (r#"(to "luigi")"#, &req, false),
            (r#"(from "bob")"#, &req, true),
            (r#"(from "luigi")"#, &req, false),
            (r#"(header "Contact" "bob")"#, &req, true),
            (r#"(header "Contact" "alice")"#, &req, false),
            (r#"(message "@172.*6{2,3}")"#, &req, true),
            (r#"(message "shazam")"#, &req, false),
            ("(not request)", &resp, true),
            ("(not response)", &resp, false),
            (r#"(any request (hasheader "magic"))"#, &req, true),
            ("(any request (status 200))", &resp, true),
            (r#"(any request (hasheader "magic"))"#, &resp, false),
            ("(all response (status 200))", &req, false),
            (r#"(all request (hasheader "magic"))"#, &req, false),
            ("(all response (status 200))", &resp, true),
        ];
        for (src, msg, expect) in cases {
            let filter = compile(src).unwrap_or_else(|e| panic!("{src:?} failed to compile: {e}"));
            assert_eq!(filter(msg), *expect, "{src:?}");
        }
    }

    #[test]
    fn complex_expression() {
        let filter = compile(
            r#"(all request
                    (methods invite publish)
                    (not (body "don't capture"))
                    (any (to "alice@.*provider.com")
                         (hasheader "magic")
                         (message "secrets")))"#,
        )
        .unwrap();
        assert!(filter(&request()));
        assert!(!filter(&response()));
    }

    #[test]
    fn methods_match_compact_and_case() {
        let filter = compile("(methods INVITE)").unwrap();
        assert!(filter(&request()));
        let filter = compile(r#"(methods "Bye")"#).unwrap();
        assert!(!filter(&request()));
    }

    #[test]
    fn header_matches_all_instances() {
        let msg = SipMessage::parse(
            b"INVITE sip:x@y SIP/2.0\r\nVia: SIP/2.0/UDP first\r\nVia: SIP/2.0/TCP second\r\n\r\n",
        )
        .unwrap();
        let filter = compile(r#"(header "via" "second")"#).unwrap();
        assert!(filter(&msg));
    }
}
