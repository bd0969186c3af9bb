//! SIP message types and parsing

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Split a header into its name and value.
///
/// rsip renders every header, typed or not, as `Name: value`, so the
/// rendered form is the one place both kinds look the same.
fn split_header(header: &Header) -> Option<(String, String)> {
    let rendered = header.to_string();
    rendered
        .split_once(':')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
}

fn find_header(headers: &Headers, name: &str) -> Option<String> {
    headers
        .iter()
        .filter_map(split_header)
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn find_headers(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(split_header)
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
        .collect()
}

/// Replace the first header called `name`, or append it when absent.
fn set_header(headers: &Headers, name: &str, value: &str) -> Headers {
    let mut replaced = false;
    let mut out: Vec<Header> = Vec::new();

    for header in headers.iter() {
        let matches = split_header(header)
            .map(|(n, _)| n.eq_ignore_ascii_case(name))
            .unwrap_or(false);

        if matches && !replaced {
            out.push(Header::Other(name.to_string(), value.to_string()));
            replaced = true;
        } else {
            out.push(header.clone());
        }
    }

    if !replaced {
        out.push(Header::Other(name.to_string(), value.to_string()));
    }

    Headers::from(out)
}

/// Extract the branch parameter of a Via header value
pub fn via_branch(via: &str) -> Option<String> {
    via.split(';')
        .find_map(|p| p.trim().strip_prefix("branch="))
        .map(|b| b.trim().to_string())
}

/// Parse `CSeq` value (`314159 REGISTER`) into number and method
fn parse_cseq(value: &str) -> Option<(u32, String)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse().ok()?;
    let method = parts.next()?.to_string();
    Some((seq, method))
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    /// Value of the first header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<String> {
        find_header(&self.inner.headers, name)
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")
            .and_then(|v| parse_cseq(&v))
            .map(|(seq, _)| seq)
    }

    /// Branch parameter of the topmost Via
    pub fn branch(&self) -> Option<String> {
        self.header("Via").and_then(|v| via_branch(&v))
    }

    /// Copy of this request with the first `name` header replaced (or appended)
    pub fn with_header(&self, name: &str, value: &str) -> Self {
        let mut inner = self.inner.clone();
        inner.headers = set_header(&self.inner.headers, name, value);
        Self::new(inner)
    }

    /// Copy of this request whose topmost Via carries `branch`
    pub fn with_branch(&self, branch: &str) -> Result<Self, SipError> {
        let via = self
            .header("Via")
            .ok_or_else(|| SipError::InvalidMessage("Missing Via header".to_string()))?;

        let mut params: Vec<String> = via
            .split(';')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.starts_with("branch="))
            .collect();
        params.push(format!("branch={}", branch));

        Ok(self.with_header("Via", &params.join(";")))
    }

    /// Copy of this request with the CSeq number incremented
    pub fn with_next_cseq(&self) -> Result<Self, SipError> {
        let (seq, method) = self
            .header("CSeq")
            .and_then(|v| parse_cseq(&v))
            .ok_or_else(|| SipError::InvalidMessage("Missing or malformed CSeq".to_string()))?;

        Ok(self.with_header("CSeq", &format!("{} {}", seq.wrapping_add(1), method)))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn header(&self, name: &str) -> Option<String> {
        find_header(&self.inner.headers, name)
    }

    /// All values of headers with the given name, in message order
    pub fn header_values(&self, name: &str) -> Vec<String> {
        find_headers(&self.inner.headers, name)
    }

    pub fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")
            .and_then(|v| parse_cseq(&v))
            .map(|(seq, _)| seq)
    }

    pub fn branch(&self) -> Option<String> {
        self.header("Via").and_then(|v| via_branch(&v))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as response first; a client mostly receives those
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}
