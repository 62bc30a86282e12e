// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Envelope and HTTP/1.0 framing.
//!
//! Encoding builds the XML by hand (the envelope grammar is tiny); decoding
//! goes through roxmltree. Sessions feed raw socket bytes into
//! [`try_split_http`] until a complete message is buffered, then hand the
//! body to [`decode_request`] or [`decode_response`].

use crate::config::MAX_XMLRPC_BODY;
use crate::error::{Result, RosError};
use crate::xmlrpc::Value;

// ============================================================================
// Encoding
// ============================================================================

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

fn encode_value(v: &Value, out: &mut String) {
    out.push_str("<value>");
    match v {
        Value::Int(i) => {
            out.push_str("<i4>");
            out.push_str(&i.to_string());
            out.push_str("</i4>");
        }
        Value::Double(d) => {
            out.push_str("<double>");
            out.push_str(&d.to_string());
            out.push_str("</double>");
        }
        Value::Bool(b) => {
            out.push_str("<boolean>");
            out.push(if *b { '1' } else { '0' });
            out.push_str("</boolean>");
        }
        Value::Str(s) => {
            out.push_str("<string>");
            escape_into(s, out);
            out.push_str("</string>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(fields) => {
            out.push_str("<struct>");
            for (k, v) in fields {
                out.push_str("<member><name>");
                escape_into(k, out);
                out.push_str("</name>");
                encode_value(v, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn encode_params(params: &[Value], out: &mut String) {
    out.push_str("<params>");
    for p in params {
        out.push_str("<param>");
        encode_value(p, out);
        out.push_str("</param>");
    }
    out.push_str("</params>");
}

fn http_post(host: &str, port: u16, body: &str) -> Vec<u8> {
    let mut msg = format!(
        "POST /RPC2 HTTP/1.0\r\nHost: {}:{}\r\nUser-Agent: rros/{}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
        host,
        port,
        crate::VERSION,
        body.len()
    );
    msg.push_str(body);
    msg.into_bytes()
}

fn http_ok(body: &str) -> Vec<u8> {
    let mut msg = format!(
        "HTTP/1.0 200 OK\r\nServer: rros/{}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
        crate::VERSION,
        body.len()
    );
    msg.push_str(body);
    msg.into_bytes()
}

/// Encode a method call as a complete HTTP/1.0 POST.
pub fn encode_request(method: &str, params: &[Value], host: &str, port: u16) -> Vec<u8> {
    let mut body = String::with_capacity(256);
    body.push_str("<?xml version=\"1.0\"?>\n<methodCall><methodName>");
    escape_into(method, &mut body);
    body.push_str("</methodName>");
    encode_params(params, &mut body);
    body.push_str("</methodCall>");
    http_post(host, port, &body)
}

/// Encode a method response as a complete HTTP/1.0 reply.
pub fn encode_response(params: &[Value]) -> Vec<u8> {
    let mut body = String::with_capacity(256);
    body.push_str("<?xml version=\"1.0\"?>\n<methodResponse>");
    encode_params(params, &mut body);
    body.push_str("</methodResponse>");
    http_ok(&body)
}

/// Encode a fault response as a complete HTTP/1.0 reply.
pub fn encode_fault(code: i32, message: &str) -> Vec<u8> {
    let mut body = String::with_capacity(256);
    body.push_str("<?xml version=\"1.0\"?>\n<methodResponse><fault>");
    encode_value(
        &Value::Struct(vec![
            ("faultCode".to_string(), Value::Int(code)),
            ("faultString".to_string(), Value::string(message)),
        ]),
        &mut body,
    );
    body.push_str("</fault></methodResponse>");
    http_ok(&body)
}

// ============================================================================
// HTTP framing
// ============================================================================

/// A complete HTTP message split out of a receive buffer.
#[derive(Debug)]
pub struct HttpMessage {
    /// Status/request line plus headers.
    pub head: String,

    /// Exactly `Content-Length` body bytes.
    pub body: Vec<u8>,

    /// Total bytes consumed from the buffer.
    pub consumed: usize,
}

/// Try to split one complete HTTP/1.0 message off the front of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed. The caller drains
/// `consumed` bytes from the buffer on success.
pub fn try_split_http(buf: &[u8]) -> Result<Option<HttpMessage>> {
    let head_end = match find_head_end(buf) {
        Some(i) => i,
        None => {
            if buf.len() > MAX_XMLRPC_BODY {
                return Err(RosError::xmlrpc("malformed frame: header never terminated"));
            }
            return Ok(None);
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_len = content_length(&head)
        .ok_or_else(|| RosError::xmlrpc("malformed frame: missing Content-Length"))?;
    if content_len > MAX_XMLRPC_BODY {
        return Err(RosError::xmlrpc(format!(
            "malformed frame: body of {} bytes exceeds limit",
            content_len
        )));
    }

    let body_start = head_end + head_terminator_len(buf, head_end);
    if buf.len() < body_start + content_len {
        return Ok(None);
    }

    Ok(Some(HttpMessage {
        head,
        body: buf[body_start..body_start + content_len].to_vec(),
        consumed: body_start + content_len,
    }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n"))
}

fn head_terminator_len(buf: &[u8], head_end: usize) -> usize {
    if buf[head_end..].starts_with(b"\r\n\r\n") {
        4
    } else {
        2
    }
}

fn content_length(head: &str) -> Option<usize> {
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

/// Whether a response head carries a 200 status.
pub fn response_status_ok(head: &str) -> bool {
    head.lines()
        .next()
        .map(|line| line.split_whitespace().nth(1) == Some("200"))
        .unwrap_or(false)
}

// ============================================================================
// Decoding
// ============================================================================

fn decode_value(node: roxmltree::Node) -> Result<Value> {
    debug_assert_eq!(node.tag_name().name(), "value");

    let typed = node.children().find(roxmltree::Node::is_element);
    let Some(typed) = typed else {
        // Bare <value>text</value> is a string.
        return Ok(Value::Str(node.text().unwrap_or("").to_string()));
    };

    let text = typed.text().unwrap_or("");
    match typed.tag_name().name() {
        "i4" | "int" => text
            .trim()
            .parse::<i32>()
            .map(Value::Int)
            .map_err(|_| RosError::xmlrpc(format!("malformed frame: bad integer {:?}", text))),
        "double" => text
            .trim()
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| RosError::xmlrpc(format!("malformed frame: bad double {:?}", text))),
        "boolean" => match text.trim() {
            "1" | "true" => Ok(Value::Bool(true)),
            "0" | "false" => Ok(Value::Bool(false)),
            other => Err(RosError::xmlrpc(format!(
                "malformed frame: bad boolean {:?}",
                other
            ))),
        },
        "string" => Ok(Value::Str(text.to_string())),
        "array" => {
            let data = typed
                .children()
                .find(|n| n.tag_name().name() == "data")
                .ok_or_else(|| RosError::xmlrpc("malformed frame: array without data"))?;
            let mut items = Vec::new();
            for child in data.children().filter(|n| n.tag_name().name() == "value") {
                items.push(decode_value(child)?);
            }
            Ok(Value::Array(items))
        }
        "struct" => {
            let mut fields = Vec::new();
            for member in typed.children().filter(|n| n.tag_name().name() == "member") {
                let name = member
                    .children()
                    .find(|n| n.tag_name().name() == "name")
                    .and_then(|n| n.text())
                    .ok_or_else(|| RosError::xmlrpc("malformed frame: member without name"))?;
                let value = member
                    .children()
                    .find(|n| n.tag_name().name() == "value")
                    .ok_or_else(|| RosError::xmlrpc("malformed frame: member without value"))?;
                fields.push((name.to_string(), decode_value(value)?));
            }
            Ok(Value::Struct(fields))
        }
        other => Err(RosError::xmlrpc(format!("unsupported type: <{}>", other))),
    }
}

fn decode_params(parent: roxmltree::Node) -> Result<Vec<Value>> {
    let Some(params) = parent
        .children()
        .find(|n| n.tag_name().name() == "params")
    else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for param in params.children().filter(|n| n.tag_name().name() == "param") {
        let value = param
            .children()
            .find(|n| n.tag_name().name() == "value")
            .ok_or_else(|| RosError::xmlrpc("malformed frame: param without value"))?;
        out.push(decode_value(value)?);
    }
    Ok(out)
}

fn parse_document(body: &str) -> Result<roxmltree::Document<'_>> {
    roxmltree::Document::parse(body)
        .map_err(|e| RosError::xmlrpc(format!("malformed frame: {}", e)))
}

/// Decode a `<methodCall>` body into method name and parameters.
pub fn decode_request(body: &str) -> Result<(String, Vec<Value>)> {
    let doc = parse_document(body)?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodCall" {
        return Err(RosError::xmlrpc(format!(
            "malformed frame: expected methodCall, got <{}>",
            root.tag_name().name()
        )));
    }

    let method = root
        .children()
        .find(|n| n.tag_name().name() == "methodName")
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RosError::xmlrpc("malformed frame: missing methodName"))?;

    Ok((method.to_string(), decode_params(root)?))
}

/// Decode a `<methodResponse>` body into parameters, surfacing faults.
pub fn decode_response(body: &str) -> Result<Vec<Value>> {
    let doc = parse_document(body)?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodResponse" {
        return Err(RosError::xmlrpc(format!(
            "malformed frame: expected methodResponse, got <{}>",
            root.tag_name().name()
        )));
    }

    if let Some(fault) = root.children().find(|n| n.tag_name().name() == "fault") {
        let value = fault
            .children()
            .find(|n| n.tag_name().name() == "value")
            .map(decode_value)
            .transpose()?
            .ok_or_else(|| RosError::xmlrpc("malformed frame: empty fault"))?;
        let code = value.get("faultCode").and_then(Value::as_i32).unwrap_or(0);
        let msg = value
            .get("faultString")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return Err(RosError::xmlrpc(format!("fault {}: {}", code, msg)));
    }

    decode_params(root)
}

// ============================================================================
// Tests
// ============================================================================
