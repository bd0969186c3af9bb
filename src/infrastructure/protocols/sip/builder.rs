//! SIP message builder utilities

use super::message::{SipError, SipRequest, SipResponse};
use super::transaction::TransactionId;
use super::transport::TransportProtocol;
use rand::Rng;
use rsip::{Header, Headers, Method, Response, StatusCode, Version};
use std::net::SocketAddr;

/// Build a simple SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            to_tag: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(Header::Other(name.to_string(), value.to_string()));
        self
    }

    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            let value = request
                .header(name)
                .ok_or_else(|| SipError::InvalidMessage(format!("Missing {} header", name)))?;

            let value = match (&self.to_tag, name) {
                (Some(tag), "To") if !value.contains(";tag=") => format!("{};tag={}", value, tag),
                _ => value,
            };
            headers.push(Header::Other(name.to_string(), value));
        }

        headers.extend(self.headers);
        headers.push(Header::ContentLength("0".into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: Vec::new(),
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Build the ACK for a non-2xx final response (RFC 3261 Section 17.1.1.3).
///
/// The ACK reuses the original Request-URI, top Via, From, Call-ID and Route
/// set; To comes from the response so it carries the remote tag.
pub fn build_ack(request: &SipRequest, response: &SipResponse) -> Result<SipRequest, SipError> {
    let via = request
        .header("Via")
        .ok_or_else(|| SipError::InvalidMessage("Missing Via header".to_string()))?;
    let from = request
        .header("From")
        .ok_or_else(|| SipError::InvalidMessage("Missing From header".to_string()))?;
    let call_id = request
        .call_id()
        .ok_or_else(|| SipError::InvalidMessage("Missing Call-ID header".to_string()))?;
    let seq = request
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("Missing CSeq header".to_string()))?;
    let to = response
        .header("To")
        .or_else(|| request.header("To"))
        .ok_or_else(|| SipError::InvalidMessage("Missing To header".to_string()))?;

    let mut headers = vec![
        Header::Other("Via".to_string(), via),
        Header::Other("From".to_string(), from),
        Header::Other("To".to_string(), to),
        Header::Other("Call-ID".to_string(), call_id),
        Header::Other("CSeq".to_string(), format!("{} ACK", seq)),
    ];

    for route in request.headers().iter().filter(|h| matches!(h, Header::Route(_))) {
        headers.push(route.clone());
    }

    headers.push(Header::Other("Max-Forwards".to_string(), "70".to_string()));
    headers.push(Header::ContentLength("0".into()));

    let mut inner = request.inner.clone();
    inner.method = Method::Ack;
    inner.headers = Headers::from(headers);
    inner.body = Vec::new();

    Ok(SipRequest::new(inner))
}

/// Addressing for a REGISTER request
#[derive(Debug, Clone)]
pub struct RegisterParams {
    /// Request-URI, the registrar domain (`sip:example.com`)
    pub registrar_uri: String,
    /// Address of record placed in From and To
    pub aor: String,
    /// Local address announced in Via and Contact
    pub local_addr: SocketAddr,
    pub transport: TransportProtocol,
    pub expires: u32,
}

/// Build an initial REGISTER with a fresh branch, Call-ID and From tag
pub fn build_register(params: &RegisterParams) -> Result<SipRequest, SipError> {
    let branch = TransactionId::generate();
    let tag = format!("{:08x}", rand::thread_rng().gen::<u32>());
    let call_id = format!("{}@{}", uuid::Uuid::new_v4(), params.local_addr.ip());
    let user = params
        .aor
        .trim_start_matches("sip:")
        .split('@')
        .next()
        .unwrap_or_default();

    let request = format!(
        "REGISTER {uri} SIP/2.0\r\n\
         Via: SIP/2.0/{transport} {local};branch={branch};rport\r\n\
         Max-Forwards: 70\r\n\
         From: <{aor}>;tag={tag}\r\n\
         To: <{aor}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 REGISTER\r\n\
         Contact: <sip:{user}@{local}>\r\n\
         Expires: {expires}\r\n\
         Content-Length: 0\r\n\r\n",
        uri = params.registrar_uri,
        transport = params.transport.as_str(),
        local = params.local_addr,
        branch = branch,
        aor = params.aor,
        tag = tag,
        call_id = call_id,
        user = user,
        expires = params.expires,
    );

    SipRequest::parse(request.as_bytes())
}
