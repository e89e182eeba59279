//! HTTP front end.
//!
//! Plain HTTP over tokio TCP, one spawned task per connection. Request
//! bodies are read to the declared content length so binary uploads arrive
//! intact. Every response carries permissive CORS headers; analysis failures
//! are part of the chat contract and still return 200 with the formatted
//! outcome, while input errors map to 4xx.

use crate::analyzer::Analyzer;
use crate::config::AgentConfig;
use crate::error::{AnalysisError, Result};
use crate::metadata;
use crate::upload;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

pub async fn run(config: AgentConfig, port: u16) -> Result<()> {
    let state = Arc::new(ServerState::new(config)?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(%addr, "accepted connection");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, state).await {
                warn!(%error, "connection failed");
            }
        });
    }
}

struct ServerState {
    analyzer: Analyzer,
    upload_dir: PathBuf,
}

impl ServerState {
    fn new(config: AgentConfig) -> Result<Self> {
        let upload_dir = config.upload_dir.clone();
        Ok(Self {
            analyzer: Analyzer::new(config)?,
            upload_dir,
        })
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let request = read_request(&mut stream).await?;
    let response = route(&request, &state).await;
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    let header_end = loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(invalid_request("connection closed before headers ended"));
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(end) = find_header_end(&buffer) {
            break end;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Err(invalid_request("request headers too large"));
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let (method, path, query, headers) =
        parse_head(&head).ok_or_else(|| invalid_request("malformed request line"))?;

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(invalid_request("request body too large"));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(HttpRequest {
        method,
        path,
        query,
        body,
    })
}

fn invalid_request(message: &str) -> AnalysisError {
    AnalysisError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message.to_string(),
    ))
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

type ParsedHead = (String, String, HashMap<String, String>, HashMap<String, String>);

fn parse_head(head: &str) -> Option<ParsedHead> {
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;

    let (raw_path, raw_query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let mut path = raw_path.trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    Some((method, path, parse_query(raw_query), headers))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

async fn route(request: &HttpRequest, state: &ServerState) -> String {
    info!(method = %request.method, path = %request.path, "request");

    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => create_response(200, "OK", ""),
        ("GET", "/api/health") => create_response(200, "OK", r#"{"status":"healthy"}"#),
        ("GET", "/api/tools") => create_response(200, "OK", &tool_descriptors()),
        ("POST", "/api/excel") => excel_endpoint(request),
        ("POST", "/api/chat") => chat_endpoint(request, state).await,
        ("POST", "/api/upload") => upload_endpoint(request, state),
        _ => create_response(
            404,
            "Not Found",
            &serde_json::json!({
                "error": format!("no such endpoint: {} {}", request.method, request.path)
            })
            .to_string(),
        ),
    }
}

fn tool_descriptors() -> String {
    serde_json::json!({
        "tools": [
            {
                "name": "analyze_file",
                "description": "Answer a natural-language question about a spreadsheet by generating and running an analysis script",
                "parameters": {
                    "file_path": "path to a stored workbook",
                    "query": "the question to answer"
                }
            },
            {
                "name": "excel_metadata",
                "description": "Describe a workbook: sheets, row count, columns and column types",
                "parameters": {
                    "file_path": "path to a stored workbook"
                }
            }
        ]
    })
    .to_string()
}

fn excel_endpoint(request: &HttpRequest) -> String {
    let Some(body) = json_body(request) else {
        return bad_request("body must be JSON with a file_path field");
    };
    let Some(file_path) = body.get("file_path").and_then(|v| v.as_str()) else {
        return bad_request("file_path is required");
    };

    match metadata::extract(Path::new(file_path)) {
        Ok(meta) => {
            let payload = serde_json::json!({
                "response": meta.summary(Path::new(file_path)),
                "sheets": meta.sheet_names,
                "total_rows": meta.total_rows,
                "columns": meta.columns,
            });
            create_response(200, "OK", &payload.to_string())
        }
        Err(error) => error_response(&error),
    }
}

async fn chat_endpoint(request: &HttpRequest, state: &ServerState) -> String {
    let Some(body) = json_body(request) else {
        return bad_request("body must be JSON with query and file_path fields");
    };
    let Some(query) = body.get("query").and_then(|v| v.as_str()) else {
        return bad_request("query is required");
    };
    let Some(file_path) = body.get("file_path").and_then(|v| v.as_str()) else {
        return bad_request("file_path is required");
    };

    let outcome = state.analyzer.analyze(Path::new(file_path), query).await;
    let payload = serde_json::json!({
        "response": outcome.answer,
        "success": outcome.success,
        "attempts": outcome.attempts,
    });
    create_response(200, "OK", &payload.to_string())
}

fn upload_endpoint(request: &HttpRequest, state: &ServerState) -> String {
    let Some(file_name) = request.query.get("filename") else {
        return bad_request("filename query parameter is required");
    };

    match upload::save_upload(&state.upload_dir, file_name, &request.body) {
        Ok((path, meta)) => {
            let payload = serde_json::json!({
                "file_path": path.display().to_string(),
                "total_rows": meta.total_rows,
                "columns": meta.columns,
            });
            create_response(200, "OK", &payload.to_string())
        }
        Err(error) => error_response(&error),
    }
}

fn json_body(request: &HttpRequest) -> Option<serde_json::Value> {
    let text = std::str::from_utf8(&request.body).ok()?;
    let start = text.find('{')?;
    serde_json::from_str(&text[start..]).ok()
}

fn bad_request(message: &str) -> String {
    create_response(
        400,
        "Bad Request",
        &serde_json::json!({ "error": message }).to_string(),
    )
}

fn error_response(error: &AnalysisError) -> String {
    let (status, status_text) = match error {
        AnalysisError::NotFound(_) => (404, "Not Found"),
        AnalysisError::UnsupportedFormat(_)
        | AnalysisError::EmptyFile(_)
        | AnalysisError::CorruptFile(_) => (400, "Bad Request"),
        _ => (500, "Internal Server Error"),
    };
    create_response(
        status,
        status_text,
        &serde_json::json!({ "error": error.to_string() }).to_string(),
    )
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, PUT, DELETE, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
