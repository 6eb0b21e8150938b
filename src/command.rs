use bytes::Bytes;

use crate::error::{ProxyError, Result};
use crate::resp::Frame;

/// A parsed client command: case-folded verb plus its arguments. The raw
/// encoded form travels separately so forwarding never re-encodes.
#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub verb: String,
    pub args: Vec<Bytes>,
}

impl ParsedCommand {
    pub fn arg(&self, idx: usize) -> Option<&Bytes> {
        self.args.get(idx)
    }
}

/// `HELLO [protover] [AUTH username password] [SETNAME name]`, pulled apart
/// because the proxy answers it locally instead of forwarding it.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    pub protover: Option<u64>,
    pub auth: Option<(String, String)>,
    pub setname: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Request {
    Command(ParsedCommand),
    Hello(HelloRequest),
}

pub fn parse_request(frame: &Frame) -> Result<Request> {
    let Frame::Array(items) = frame else {
        return Err(ProxyError::Protocol(
            "expected array frame for request".into(),
        ));
    };
    let Some((head, tail)) = items.split_first() else {
        return Err(ProxyError::Protocol("empty request array".into()));
    };

    let verb_bytes =
        frame_to_bytes(head).ok_or_else(|| ProxyError::Protocol("invalid command name".into()))?;
    let verb = ascii_upper(&verb_bytes);

    let mut args = Vec::with_capacity(tail.len());
    for item in tail {
        let b = frame_to_bytes(item)
            .ok_or_else(|| ProxyError::Protocol("invalid argument frame".into()))?;
        args.push(b);
    }

    if verb == "HELLO" {
        return Ok(Request::Hello(parse_hello_args(&args)?));
    }
    Ok(Request::Command(ParsedCommand { verb, args }))
}

fn frame_to_bytes(frame: &Frame) -> Option<Bytes> {
    match frame {
        Frame::BulkString(b) | Frame::SimpleString(b) => Some(b.clone()),
        // Be permissive: some clients encode numeric arguments as integers.
        Frame::Integer(i) => Some(Bytes::from(i.to_string())),
        _ => None,
    }
}

fn parse_hello_args(args: &[Bytes]) -> Result<HelloRequest> {
    let mut idx = 0;
    let mut protover = None;

    if let Some(first) = args.first() {
        let s = std::str::from_utf8(first).unwrap_or("");
        // A leading non-option token must be the protocol version.
        if !s.eq_ignore_ascii_case("AUTH") && !s.eq_ignore_ascii_case("SETNAME") {
            let v: u64 = s.parse().map_err(|_| {
                ProxyError::Protocol("HELLO protocol version is not an integer".into())
            })?;
            protover = Some(v);
            idx = 1;
        }
    }

    let mut auth = None;
    let mut setname = None;

    while idx < args.len() {
        let token = ascii_upper(&args[idx]);
        idx += 1;
        match token.as_str() {
            "AUTH" => {
                let (u, p) = match (args.get(idx), args.get(idx + 1)) {
                    (Some(u), Some(p)) => (u, p),
                    _ => {
                        return Err(ProxyError::Protocol(
                            "HELLO AUTH requires username and password".into(),
                        ));
                    }
                };
                idx += 2;
                auth = Some((
                    String::from_utf8_lossy(u).into_owned(),
                    String::from_utf8_lossy(p).into_owned(),
                ));
            }
            "SETNAME" => {
                let name = args
                    .get(idx)
                    .ok_or_else(|| ProxyError::Protocol("HELLO SETNAME missing name".into()))?;
                idx += 1;
                setname = Some(String::from_utf8_lossy(name).into_owned());
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unsupported HELLO option: {other}"
                )));
            }
        }
    }

    Ok(HelloRequest {
        protover,
        auth,
        setname,
    })
}

fn ascii_upper(bytes: &Bytes) -> String {
    bytes.iter().map(|b| b.to_ascii_uppercase() as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(parts: &[&str]) -> Request {
        let frame = Frame::Array(
            parts
                .iter()
                .map(|p| Frame::BulkString(Bytes::copy_from_slice(p.as_bytes())))
                .collect(),
        );
        parse_request(&frame).unwrap()
    }

    #[test]
    fn verb_is_case_folded() {
        let Request::Command(cmd) = request(&["get", "Key"]) else {
            panic!("expected plain command");
        };
        assert_eq!(cmd.verb, "GET");
        assert_eq!(cmd.arg(0).unwrap(), &Bytes::from_static(b"Key"));
    }

    #[test]
    fn hello_with_auth_and_setname() {
        let Request::Hello(hello) = request(&["HELLO", "2", "AUTH", "u", "p", "SETNAME", "cli"])
        else {
            panic!("expected hello");
        };
        assert_eq!(hello.protover, Some(2));
        assert_eq!(hello.auth, Some(("u".into(), "p".into())));
        assert_eq!(hello.setname.as_deref(), Some("cli"));
    }

    #[test]
    fn bare_hello_keeps_protocol() {
        let Request::Hello(hello) = request(&["HELLO"]) else {
            panic!("expected hello");
        };
        assert_eq!(hello.protover, None);
    }

    #[test]
    fn rejects_non_array_request() {
        let err = parse_request(&Frame::SimpleString(Bytes::from_static(b"OK"))).unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }
}
