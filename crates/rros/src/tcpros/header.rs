// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handshake header codec.
//!
//! A header block is one outer length-prefixed frame whose payload is a
//! sequence of length-prefixed `key=value` fields. Validation order on
//! receipt is fixed: `md5sum` first, then `type`; a `*` digest is a
//! wildcard on the subscriber side.

use crate::config::MD5_WILDCARD;
use crate::error::{Result, RosError};
use crate::tcpros::frame::{encode_frame_into, LEN_PREFIX};

/// Key/value handshake header. Field order is kept for encoding; lookup is
/// by key, first match wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TcprosHeader {
    fields: Vec<(String, String)>,
}

impl TcprosHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    /// Builder-style append.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Value of a field, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value of a required field.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| RosError::protocol_header(format!("missing required field {:?}", key)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode as a complete header block (outer length included).
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(128);
        for (k, v) in &self.fields {
            let mut field = Vec::with_capacity(k.len() + v.len() + 1);
            field.extend_from_slice(k.as_bytes());
            field.push(b'=');
            field.extend_from_slice(v.as_bytes());
            encode_frame_into(&field, &mut body);
        }
        let mut block = Vec::with_capacity(LEN_PREFIX + body.len());
        encode_frame_into(&body, &mut block);
        block
    }

    /// Parse the payload of a header block (outer length already stripped).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut fields = Vec::new();
        let mut pos = 0usize;
        while pos < payload.len() {
            if payload.len() - pos < LEN_PREFIX {
                return Err(RosError::protocol_header("truncated field length"));
            }
            let len = u32::from_le_bytes([
                payload[pos],
                payload[pos + 1],
                payload[pos + 2],
                payload[pos + 3],
            ]) as usize;
            pos += LEN_PREFIX;
            if payload.len() - pos < len {
                return Err(RosError::protocol_header("truncated field body"));
            }
            let field = std::str::from_utf8(&payload[pos..pos + len])
                .map_err(|_| RosError::protocol_header("field is not utf-8"))?;
            pos += len;

            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| RosError::protocol_header(format!("field without '=': {:?}", field)))?;
            fields.push((key.to_string(), value.to_string()));
        }
        Ok(Self { fields })
    }

    /// Validate a peer header against expected digest and type, in the
    /// mandated order. `allow_wildcard` accepts `*` for either side of the
    /// digest comparison (subscriber side).
    pub fn validate(&self, expected_md5: &str, expected_type: &str, allow_wildcard: bool) -> Result<()> {
        let got_md5 = self.require("md5sum")?;
        let wildcard =
            allow_wildcard && (got_md5 == MD5_WILDCARD || expected_md5 == MD5_WILDCARD);
        if !wildcard && got_md5 != expected_md5 {
            return Err(RosError::protocol_header(format!(
                "md5sum mismatch: expected {}, got {}",
                expected_md5, got_md5
            )));
        }

        if let Some(got_type) = self.get("type") {
            let type_wildcard = allow_wildcard && (got_type == "*" || expected_type == "*");
            if !type_wildcard && got_type != expected_type {
                return Err(RosError::protocol_header(format!(
                    "type mismatch: expected {}, got {}",
                    expected_type, got_type
                )));
            }
        }
        Ok(())
    }

    /// Fault header sent before closing an inbound session.
    pub fn fault(message: &str) -> Self {
        Self::new().with("error", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tcpros::FrameReader;
    use std::collections::HashMap;

    fn subscriber_header() -> TcprosHeader {
        TcprosHeader::new()
            .with("callerid", "/listener")
            .with("topic", "/chatter")
            .with("type", "std_msgs/String")
            .with("md5sum", "992ce8a1687cec8c8bd883ec73ca41d1")
            .with("message_definition", "string data\n")
            .with("tcp_nodelay", "1")
    }

    #[test]
    fn test_round_trip_equal_map() {
        let header = subscriber_header();
        let block = header.encode();

        // The block is itself one frame.
        let mut reader = FrameReader::new(4096);
        reader.feed(&block);
        let payload = reader.next_frame().unwrap().unwrap();
        let parsed = TcprosHeader::parse(&payload).unwrap();

        let want: HashMap<_, _> = header.iter().collect();
        let got: HashMap<_, _> = parsed.iter().collect();
        assert_eq!(want, got);
    }

    #[test]
    fn test_value_may_contain_equals() {
        let header = TcprosHeader::new().with("message_definition", "int32 a=1\nint32 b\n");
        let block = header.encode();

        let mut reader = FrameReader::new(4096);
        reader.feed(&block);
        let parsed = TcprosHeader::parse(&reader.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(parsed.get("message_definition"), Some("int32 a=1\nint32 b\n"));
    }

    #[test]
    fn test_parse_rejects_truncated_field() {
        // Field claims 10 bytes, only 3 present.
        let mut payload = 10u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"a=b");
        let err = TcprosHeader::parse(&payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolHeader);
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let mut payload = Vec::new();
        encode_frame_into(b"no_separator_here", &mut payload);
        assert!(TcprosHeader::parse(&payload).is_err());
    }

    #[test]
    fn test_validate_md5_before_type() {
        // Both digest and type are wrong; the digest must be reported.
        let header = TcprosHeader::new()
            .with("md5sum", "bbbb")
            .with("type", "other_msgs/Other");
        let err = header
            .validate("aaaa", "std_msgs/String", false)
            .unwrap_err();
        assert!(err.detail().contains("md5sum mismatch"));
        assert!(err.detail().contains("aaaa"));
        assert!(err.detail().contains("bbbb"));
    }

    #[test]
    fn test_validate_type_mismatch() {
        let header = TcprosHeader::new()
            .with("md5sum", "aaaa")
            .with("type", "other_msgs/Other");
        let err = header
            .validate("aaaa", "std_msgs/String", false)
            .unwrap_err();
        assert!(err.detail().contains("type mismatch"));
    }

    #[test]
    fn test_validate_wildcard_md5() {
        let header = TcprosHeader::new().with("md5sum", "*");
        assert!(header.validate("aaaa", "std_msgs/String", true).is_ok());

        // Wildcard is only honored where the caller allows it.
        assert!(header.validate("aaaa", "std_msgs/String", false).is_err());
    }

    #[test]
    fn test_validate_requires_md5() {
        let header = TcprosHeader::new().with("type", "std_msgs/String");
        let err = header
            .validate("aaaa", "std_msgs/String", true)
            .unwrap_err();
        assert!(err.detail().contains("md5sum"));
    }

    #[test]
    fn test_fault_header() {
        let fault = TcprosHeader::fault("md5sum mismatch");
        assert_eq!(fault.get("error"), Some("md5sum mismatch"));
    }
}
