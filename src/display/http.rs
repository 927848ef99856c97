use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use super::hub::Hub;
use crate::error::CaptureError;
use crate::state::StatePatch;

pub(crate) const MAX_REQUEST_BYTES: usize = 8192;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

/// Parse a request head (everything up to the blank line).
pub(crate) fn parse_head(head: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (raw_path, None),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        body: Vec::new(),
    })
}

pub(crate) fn head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read one request, including a `Content-Length` body.
pub(crate) fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request head"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(end) = head_end(&data) {
            break end;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    let mut request = parse_head(&data[..end])?;
    let content_length = match request.header("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(request)
}

/// Route one plain HTTP request.
pub(crate) fn handle_http(stream: &mut TcpStream, request: &HttpRequest, hub: &Hub) -> Result<()> {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/api/state") => {
            let body = serde_json::to_string(&hub.state())?;
            write_json_response(stream, 200, &body)
        }
        ("POST", "/api/state") => {
            let (status, body) = post_state(&request.body, hub);
            write_json_response(stream, status, &body.to_string())
        }
        (_, "/health") | (_, "/api/state") => {
            write_json_response(stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Validate, apply and broadcast an operator patch.
pub(crate) fn post_state(body: &[u8], hub: &Hub) -> (u16, Value) {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return rejected(&CaptureError::validation("Invalid JSON")),
    };
    match StatePatch::from_json(&value) {
        Ok(patch) => {
            let state = hub.apply_patch(&patch);
            (200, json!({"success": true, "state": state}))
        }
        Err(err) => rejected(&err),
    }
}

fn rejected(err: &CaptureError) -> (u16, Value) {
    log::warn!("state update rejected: {}", err);
    (400, json!({"success": false, "error": err.message()}))
}

pub(crate) fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CaptureStatus, RemoteState};

    #[test]
    fn parses_head_and_detects_upgrade() {
        let head = b"GET /ws?x=1&role=capture HTTP/1.1\r\nHost: a\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";
        let req = parse_head(head).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/ws");
        assert_eq!(req.query_param("role").as_deref(), Some("capture"));
        assert_eq!(req.query_param("missing"), None);
        assert!(req.is_websocket_upgrade());
        assert_eq!(head_end(head), Some(head.len()));
    }

    #[test]
    fn bogus_status_is_rejected_without_mutation() {
        let hub = Hub::new(RemoteState::default());
        let (status, body) = post_state(br#"{"status":"bogus"}"#, &hub);
        assert_eq!(status, 400);
        assert_eq!(body, json!({"success": false, "error": "Invalid status"}));
        assert_eq!(hub.state(), RemoteState::default());
    }

    #[test]
    fn unknown_keys_and_invalid_json_are_rejected() {
        let hub = Hub::new(RemoteState::default());
        let (status, body) = post_state(br#"{"object_id":1,"owner":"me"}"#, &hub);
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Invalid state keys");
        assert_eq!(hub.state().object_id, 0, "valid fields of a bad patch are not applied");

        let (status, body) = post_state(b"{not json", &hub);
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Invalid JSON");
    }

    #[test]
    fn valid_patch_returns_new_state() {
        let hub = Hub::new(RemoteState::default());
        let (status, body) = post_state(br#"{"object_id":4,"status":"processing"}"#, &hub);
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);
        assert_eq!(body["state"]["object_id"], 4);
        assert_eq!(hub.state().status, CaptureStatus::Processing);
    }
}
