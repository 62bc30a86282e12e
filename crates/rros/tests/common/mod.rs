// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loopback fixtures: a scriptable XMLRPC server (master or peer) and
//! scriptable TCPROS peers, each on its own thread, speaking the real wire
//! protocols at the node under test.

// Each test binary uses its own subset of the fixtures.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rros::tcpros::{encode_frame_into, TcprosHeader};
use rros::xmlrpc::{self, Value};

// ============================================================================
// XMLRPC fixture (master or peer slave)
// ============================================================================

pub struct XmlrpcServer {
    pub port: u16,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl XmlrpcServer {
    /// Serve requests with `handler(method, params) -> [code, status, payload]`.
    pub fn serve<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Vec<Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();
        let running = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let thread_running = running.clone();
        let thread_calls = calls.clone();

        let handle = std::thread::spawn(move || {
            while thread_running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut conn, _)) => {
                        conn.set_nonblocking(false).ok();
                        conn.set_read_timeout(Some(Duration::from_secs(2))).ok();
                        let Some(body) = read_http_body(&mut conn) else {
                            continue;
                        };
                        let Ok((method, params)) = xmlrpc::decode_request(&body) else {
                            continue;
                        };
                        thread_calls.lock().unwrap().push(method.clone());
                        let triple = handler(&method, &params);
                        let reply = xmlrpc::encode_response(&[Value::Array(triple)]);
                        let _ = conn.write_all(&reply);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            port,
            running,
            handle: Some(handle),
            calls,
        }
    }

    pub fn uri(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    pub fn called(&self, method: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|m| m == method)
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|m| *m == method).count()
    }
}

impl Drop for XmlrpcServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn read_http_body(conn: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Ok(Some(msg)) = xmlrpc::try_split_http(&buf) {
            return Some(String::from_utf8_lossy(&msg.body).into_owned());
        }
        match conn.read(&mut chunk) {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return None,
        }
    }
}

/// One-shot client call against an XMLRPC endpoint (e.g. the node's slave
/// API). Panics on transport errors; returns the decoded response params.
pub fn post_xmlrpc(port: u16, method: &str, params: &[Value]) -> Vec<Value> {
    let mut conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(2))).ok();
    conn.write_all(&xmlrpc::encode_request(method, params, "127.0.0.1", port))
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Ok(Some(msg)) = xmlrpc::try_split_http(&buf) {
            let body = String::from_utf8_lossy(&msg.body).into_owned();
            return xmlrpc::decode_response(&body).unwrap();
        }
        match conn.read(&mut chunk) {
            Ok(0) => panic!("no response from slave api"),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => panic!("slave api read: {}", e),
        }
    }
}

// ============================================================================
// TCPROS fixtures
// ============================================================================

fn read_frame(conn: &mut TcpStream) -> Option<Vec<u8>> {
    let mut len = [0u8; 4];
    conn.read_exact(&mut len).ok()?;
    let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
    conn.read_exact(&mut body).ok()?;
    Some(body)
}

pub struct TcprosPeer {
    pub port: u16,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    /// Headers received from connecting subscribers/callers.
    pub seen_headers: Arc<Mutex<Vec<TcprosHeader>>>,
    /// Number of connections that reached EOF (peer observed our close).
    pub closed_conns: Arc<Mutex<usize>>,
}

impl TcprosPeer {
    /// Publisher-role fixture: answers handshakes with the given reply
    /// fields and streams `payloads` to each subscriber, then holds the
    /// connection open.
    pub fn publisher(reply: TcprosHeader, payloads: Vec<Vec<u8>>) -> Self {
        Self::spawn(move |conn, running| {
            let Some(hello) = read_frame(conn) else { return None };
            let header = TcprosHeader::parse(&hello).ok()?;

            conn.write_all(&reply.encode()).ok()?;
            for payload in &payloads {
                let mut frame = Vec::new();
                encode_frame_into(payload, &mut frame);
                conn.write_all(&frame).ok()?;
            }
            // Hold the stream open until the fixture stops or the peer
            // hangs up.
            let mut probe = [0u8; 64];
            conn.set_read_timeout(Some(Duration::from_millis(50))).ok();
            while running.load(Ordering::Relaxed) {
                match conn.read(&mut probe) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(_) => break,
                }
            }
            Some(header)
        })
    }

    /// Service-role fixture: answers the handshake, then serves each
    /// request frame through `respond` (ok-byte 1 on `Ok`, 0 on `Err`).
    pub fn service<F>(reply: TcprosHeader, respond: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        let respond = Arc::new(respond);
        Self::spawn(move |conn, running| {
            let Some(hello) = read_frame(conn) else { return None };
            let header = TcprosHeader::parse(&hello).ok()?;
            conn.write_all(&reply.encode()).ok()?;

            conn.set_read_timeout(Some(Duration::from_millis(50))).ok();
            while running.load(Ordering::Relaxed) {
                let mut len = [0u8; 4];
                match conn.read_exact(&mut len) {
                    Ok(()) => {}
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(_) => break,
                }
                let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
                if conn.read_exact(&mut body).is_err() {
                    break;
                }
                let mut out = Vec::new();
                match respond(&body) {
                    Ok(response) => {
                        out.push(1);
                        encode_frame_into(&response, &mut out);
                    }
                    Err(msg) => {
                        out.push(0);
                        encode_frame_into(msg.as_bytes(), &mut out);
                    }
                }
                if conn.write_all(&out).is_err() {
                    break;
                }
            }
            Some(header)
        })
    }

    fn spawn<F>(per_conn: F) -> Self
    where
        F: Fn(&mut TcpStream, &AtomicBool) -> Option<TcprosHeader> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();
        let running = Arc::new(AtomicBool::new(true));
        let seen_headers = Arc::new(Mutex::new(Vec::new()));
        let closed_conns = Arc::new(Mutex::new(0usize));

        let thread_running = running.clone();
        let thread_headers = seen_headers.clone();
        let thread_closed = closed_conns.clone();
        let per_conn = Arc::new(per_conn);

        let handle = std::thread::spawn(move || {
            let mut workers: Vec<JoinHandle<()>> = Vec::new();
            while thread_running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut conn, _)) => {
                        conn.set_nonblocking(false).ok();
                        conn.set_read_timeout(Some(Duration::from_secs(2))).ok();
                        let per_conn = per_conn.clone();
                        let headers = thread_headers.clone();
                        let closed = thread_closed.clone();
                        let running = thread_running.clone();
                        workers.push(std::thread::spawn(move || {
                            if let Some(h) = per_conn(&mut conn, &running) {
                                headers.lock().unwrap().push(h);
                            }
                            *closed.lock().unwrap() += 1;
                        }));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
            for w in workers {
                let _ = w.join();
            }
        });

        Self {
            port,
            running,
            handle: Some(handle),
            seen_headers,
            closed_conns,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.seen_headers.lock().unwrap().len()
    }

    pub fn finished_count(&self) -> usize {
        *self.closed_conns.lock().unwrap()
    }
}

impl Drop for TcprosPeer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Standard publisher reply header for `std_msgs/String` with digest `md5`.
pub fn string_reply_header(md5: &str) -> TcprosHeader {
    TcprosHeader::new()
        .with("callerid", "/fixture_pub")
        .with("type", "std_msgs/String")
        .with("md5sum", md5)
        .with("message_definition", "string data\n")
        .with("latching", "0")
}
