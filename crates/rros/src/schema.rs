// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message-schema collaborator interface.
//!
//! The runtime never interprets payload bytes; serialization belongs to the
//! host's message layer. What the runtime does need per type is the digest
//! and definition text that go into registrations and TCPROS handshakes,
//! and that is all [`SchemaDb`] answers.
//!
//! Two implementations ship with the crate: [`DirSchemaDb`] reads
//! definition files from a directory tree (`<root>/<package>/<Name>.msg`),
//! [`StaticSchemaDb`] holds digests handed in by the host - the right
//! choice when the host's serializer computes exact dependency-normalized
//! digests.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use md5::{Digest, Md5};

use crate::config::MD5_WILDCARD;
use crate::error::{Result, RosError};

/// Digest and definition of a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSchema {
    pub md5sum: String,
    pub definition: String,
}

/// Digest and request/response type names of a service type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSchema {
    pub md5sum: String,
    pub request_type: String,
    pub response_type: String,
    pub definition: String,
}

/// Source of type information for registrations and handshakes.
pub trait SchemaDb {
    fn message(&self, type_name: &str) -> Result<MessageSchema>;
    fn service(&self, type_name: &str) -> Result<ServiceSchema>;
}

fn md5_hex(text: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

// ============================================================================
// Directory database
// ============================================================================

/// Reads `<root>/<package>/<Name>.msg` and `.srv` definition files.
///
/// Digests are computed over the raw definition text. Hosts whose
/// serializer derives the exact recursive ROS digests should prefer
/// [`StaticSchemaDb`] or their own [`SchemaDb`].
pub struct DirSchemaDb {
    root: PathBuf,
}

impl DirSchemaDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, type_name: &str, extension: &str) -> Result<String> {
        let (package, name) = type_name.split_once('/').ok_or_else(|| {
            RosError::usage(format!(
                "type name {:?} is not package-qualified",
                type_name
            ))
        })?;
        let path = self
            .root
            .join(package)
            .join(format!("{}.{}", name, extension));
        fs::read_to_string(&path).map_err(|e| {
            RosError::usage(format!("no definition for {}: {}", type_name, e))
        })
    }
}

impl SchemaDb for DirSchemaDb {
    fn message(&self, type_name: &str) -> Result<MessageSchema> {
        let definition = self.read(type_name, "msg")?;
        Ok(MessageSchema {
            md5sum: md5_hex(&definition),
            definition,
        })
    }

    fn service(&self, type_name: &str) -> Result<ServiceSchema> {
        let definition = self.read(type_name, "srv")?;
        Ok(ServiceSchema {
            md5sum: md5_hex(&definition),
            request_type: format!("{}Request", type_name),
            response_type: format!("{}Response", type_name),
            definition,
        })
    }
}

// ============================================================================
// Static database
// ============================================================================

/// In-memory schema table, optionally answering unknown types with the
/// wildcard digest (useful for introspection tools that accept anything).
#[derive(Default)]
pub struct StaticSchemaDb {
    messages: HashMap<String, MessageSchema>,
    services: HashMap<String, ServiceSchema>,
    wildcard_fallback: bool,
}

impl StaticSchemaDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown types resolve to the `*` digest instead of failing.
    pub fn with_wildcard_fallback(mut self) -> Self {
        self.wildcard_fallback = true;
        self
    }

    pub fn insert_message(
        &mut self,
        type_name: impl Into<String>,
        md5sum: impl Into<String>,
        definition: impl Into<String>,
    ) {
        self.messages.insert(
            type_name.into(),
            MessageSchema {
                md5sum: md5sum.into(),
                definition: definition.into(),
            },
        );
    }

    pub fn insert_service(
        &mut self,
        type_name: impl Into<String>,
        md5sum: impl Into<String>,
        definition: impl Into<String>,
    ) {
        let type_name = type_name.into();
        self.services.insert(
            type_name.clone(),
            ServiceSchema {
                md5sum: md5sum.into(),
                request_type: format!("{}Request", type_name),
                response_type: format!("{}Response", type_name),
                definition: definition.into(),
            },
        );
    }
}

impl SchemaDb for StaticSchemaDb {
    fn message(&self, type_name: &str) -> Result<MessageSchema> {
        if let Some(schema) = self.messages.get(type_name) {
            return Ok(schema.clone());
        }
        if self.wildcard_fallback {
            return Ok(MessageSchema {
                md5sum: MD5_WILDCARD.to_string(),
                definition: String::new(),
            });
        }
        Err(RosError::usage(format!(
            "unknown message type {:?}",
            type_name
        )))
    }

    fn service(&self, type_name: &str) -> Result<ServiceSchema> {
        if let Some(schema) = self.services.get(type_name) {
            return Ok(schema.clone());
        }
        if self.wildcard_fallback {
            return Ok(ServiceSchema {
                md5sum: MD5_WILDCARD.to_string(),
                request_type: format!("{}Request", type_name),
                response_type: format!("{}Response", type_name),
                definition: String::new(),
            });
        }
        Err(RosError::usage(format!(
            "unknown service type {:?}",
            type_name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex_shape() {
        let digest = md5_hex("string data\n");
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic.
        assert_eq!(digest, md5_hex("string data\n"));
        assert_ne!(digest, md5_hex("string data"));
    }

    #[test]
    fn test_dir_db_reads_msg_and_srv() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("std_msgs");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("String.msg"), "string data\n").unwrap();

        let srv_pkg = dir.path().join("roscpp_tutorials");
        fs::create_dir_all(&srv_pkg).unwrap();
        fs::write(srv_pkg.join("TwoInts.srv"), "int64 a\nint64 b\n---\nint64 sum\n").unwrap();

        let db = DirSchemaDb::new(dir.path());
        let msg = db.message("std_msgs/String").unwrap();
        assert_eq!(msg.definition, "string data\n");
        assert_eq!(msg.md5sum.len(), 32);

        let srv = db.service("roscpp_tutorials/TwoInts").unwrap();
        assert_eq!(srv.request_type, "roscpp_tutorials/TwoIntsRequest");
        assert_eq!(srv.response_type, "roscpp_tutorials/TwoIntsResponse");
    }

    #[test]
    fn test_dir_db_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let db = DirSchemaDb::new(dir.path());

        let err = db.message("std_msgs/Missing").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Usage);

        let err = db.message("unqualified").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Usage);
    }

    #[test]
    fn test_static_db() {
        let mut db = StaticSchemaDb::new();
        db.insert_message("std_msgs/String", "992ce8a1687cec8c8bd883ec73ca41d1", "string data\n");

        let msg = db.message("std_msgs/String").unwrap();
        assert_eq!(msg.md5sum, "992ce8a1687cec8c8bd883ec73ca41d1");
        assert!(db.message("std_msgs/Other").is_err());
    }

    #[test]
    fn test_static_db_wildcard_fallback() {
        let db = StaticSchemaDb::new().with_wildcard_fallback();
        assert_eq!(db.message("any/Type").unwrap().md5sum, "*");
        assert_eq!(db.service("any/Srv").unwrap().md5sum, "*");
    }
}
