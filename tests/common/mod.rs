// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Minimal in-process cloud + inverter stub for integration tests
//!
//! Speaks just enough HTTP/1.1 for reqwest: one request per connection,
//! `Connection: close`. The cloud route verifies the device envelope,
//! records the inner payload, and answers with the next scripted reply
//! wrapped in a server-side envelope. The inverter write route echoes the
//! frame (the simulator's success signal); the FOTA chunk route serves
//! scripted base64 chunks.

// not every test crate uses every helper
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use solar_gateway::security;

/// Shared scripting surface of the stub server.
pub struct StubServer {
    pub addr: SocketAddr,
    /// Inner payloads uploaded by the device, post envelope verification.
    pub uploads: mpsc::UnboundedReceiver<Value>,
    /// Scripted inner reply JSONs, consumed one per upload.
    pub replies: Arc<Mutex<VecDeque<Value>>>,
    /// Scripted base64 chunk bodies served by the GET route.
    pub chunks: Arc<Mutex<Vec<String>>>,
    /// When set, the next reply reuses this exact pre-built envelope
    /// (for replay tests).
    pub canned_envelope: Arc<Mutex<Option<String>>>,
}

impl StubServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn push_reply(&self, reply: Value) {
        self.replies.lock().unwrap().push_back(reply);
    }
}

struct ServerState {
    psk: String,
    use_envelope: bool,
    device_nonce_seen: u64,
    server_nonce: u64,
    upload_tx: mpsc::UnboundedSender<Value>,
    replies: Arc<Mutex<VecDeque<Value>>>,
    chunks: Arc<Mutex<Vec<String>>>,
    canned_envelope: Arc<Mutex<Option<String>>>,
}

/// Bind the stub on an ephemeral port and start serving.
pub async fn spawn_stub(psk: &str, use_envelope: bool) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (upload_tx, uploads) = mpsc::unbounded_channel();
    let replies: Arc<Mutex<VecDeque<Value>>> = Arc::new(Mutex::new(VecDeque::new()));
    let chunks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let canned_envelope: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let mut state = ServerState {
        psk: psk.to_string(),
        use_envelope,
        device_nonce_seen: 0,
        server_nonce: 1000,
        upload_tx,
        replies: Arc::clone(&replies),
        chunks: Arc::clone(&chunks),
        canned_envelope: Arc::clone(&canned_envelope),
    };

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            handle_connection(&mut socket, &mut state).await;
        }
    });

    StubServer {
        addr,
        uploads,
        replies,
        chunks,
        canned_envelope,
    }
}

async fn handle_connection(socket: &mut TcpStream, state: &mut ServerState) {
    let Some((path, body)) = read_request(socket).await else {
        return;
    };

    if path.starts_with("/api/device/upload") {
        let inner = if state.use_envelope {
            match security::unwrap(&body, &state.psk, &mut state.device_nonce_seen, true) {
                Some(inner) => inner,
                None => {
                    respond(socket, 403, "{}").await;
                    return;
                }
            }
        } else {
            body
        };
        if let Ok(v) = serde_json::from_str::<Value>(&inner) {
            let _ = state.upload_tx.send(v);
        }
        let response = if let Some(canned) = state.canned_envelope.lock().unwrap().take() {
            canned
        } else {
            let reply = state
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| serde_json::json!({}));
            if state.use_envelope {
                state.server_nonce += 1;
                security::wrap(&reply.to_string(), &state.psk, state.server_nonce)
            } else {
                reply.to_string()
            }
        };
        respond(socket, 200, &response).await;
    } else if path.starts_with("/api/inverter/write") {
        // echo back the frame: byte-identical echo means success
        respond(socket, 200, &body).await;
    } else if path.starts_with("/api/inverter/read") {
        match read_reply_frame(&body) {
            Some(frame) => {
                respond(socket, 200, &serde_json::json!({ "frame": frame }).to_string()).await
            }
            None => respond(socket, 404, "{}").await,
        }
    } else if path.starts_with("/api/fota/chunk") {
        let chunk_index = path
            .split("chunk=")
            .nth(1)
            .and_then(|s| s.split('&').next())
            .and_then(|s| s.parse::<usize>().ok());
        let chunk = chunk_index.and_then(|i| state.chunks.lock().unwrap().get(i).cloned());
        match chunk {
            Some(chunk) => respond(socket, 200, &chunk).await,
            None => respond(socket, 404, "").await,
        }
    } else {
        respond(socket, 404, "{}").await;
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end;
    loop {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_header_end(&buf) {
            header_end = pos;
            break;
        }
        if buf.len() > 1 << 20 {
            return None;
        }
    }

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = headers
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .to_string();
    let content_length = headers
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    Some((path, String::from_utf8_lossy(&body).to_string()))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Simulated inverter: answer a 0x03 read with `1000 + addr` per register.
fn read_reply_frame(body: &str) -> Option<String> {
    use solar_gateway::modbus;

    let request: Value = serde_json::from_str(body).ok()?;
    let bytes = modbus::hex_to_bytes(request.get("frame")?.as_str()?);
    if bytes.len() != 8 || bytes[1] != 0x03 {
        return None;
    }
    let addr = (u16::from(bytes[2]) << 8) | u16::from(bytes[3]);
    let count = (u16::from(bytes[4]) << 8) | u16::from(bytes[5]);

    let mut frame = vec![bytes[0], 0x03, (count * 2) as u8];
    for i in 0..count {
        frame.extend_from_slice(&(1000 + addr + i).to_be_bytes());
    }
    let crc = modbus::crc16(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    Some(modbus::bytes_to_hex(&frame))
}

async fn respond(socket: &mut TcpStream, status: u16, body: &str) {
    let reason = match status {
        200 => "OK",
        403 => "Forbidden",
        _ => "Not Found",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.flush().await;
}
