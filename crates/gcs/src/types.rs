//! Google Cloud Storage JSON API resources.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use snapvault_store::{Crc32c, ObjectAttrs};

use crate::Error;

/// Subset of the `Object` resource the store needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectResource {
    pub name: String,
    /// Decimal string, per the JSON API.
    #[serde(default)]
    pub size: Option<String>,
    /// Base64 of the big-endian CRC32C.
    #[serde(default)]
    pub crc32c: Option<String>,
}

impl ObjectResource {
    pub fn into_attrs(self) -> Result<ObjectAttrs, Error> {
        let size = match &self.size {
            Some(s) => s
                .parse()
                .map_err(|_| Error::InvalidResponse(format!("bad size {s:?} for {}", self.name)))?,
            None => 0,
        };
        let crc32c = self.crc32c.as_deref().map(decode_crc32c).transpose()?;
        Ok(ObjectAttrs {
            name: self.name,
            size,
            crc32c,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectList {
    #[serde(default)]
    pub items: Vec<ObjectResource>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ComposeRequest<'a> {
    pub source_objects: Vec<SourceObject<'a>>,
    pub destination: Destination<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SourceObject<'a> {
    pub name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Destination<'a> {
    pub content_type: &'a str,
}

impl<'a> ComposeRequest<'a> {
    pub fn new(sources: &'a [String], content_type: &'a str) -> Self {
        Self {
            source_objects: sources.iter().map(|name| SourceObject { name }).collect(),
            destination: Destination { content_type },
        }
    }
}

pub(crate) fn encode_crc32c(crc: Crc32c) -> String {
    STANDARD.encode(crc.to_be_bytes())
}

pub(crate) fn decode_crc32c(encoded: &str) -> Result<Crc32c, Error> {
    STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| Crc32c::from_be_slice(&bytes))
        .ok_or_else(|| Error::InvalidResponse(format!("bad crc32c {encoded:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_wire_format() {
        // Empty content.
        assert_eq!(encode_crc32c(Crc32c(0)), "AAAAAA==");
        // 32 zero bytes, a published CRC32C test vector.
        let crc = Crc32c::of(&[0u8; 32]);
        assert_eq!(decode_crc32c(&encode_crc32c(crc)).unwrap(), crc);
        assert_eq!(encode_crc32c(crc), "ipE2qg==");
    }

    #[test]
    fn rejects_malformed_crc32c() {
        assert!(decode_crc32c("not base64!").is_err());
        // Valid base64, wrong width.
        assert!(decode_crc32c("AAAA").is_err());
    }

    #[test]
    fn object_resource_to_attrs() {
        let json = r#"{"kind":"storage#object","name":"a.part.0","size":"1024","crc32c":"ipE2qg==","bucket":"b"}"#;
        let resource: ObjectResource = serde_json::from_str(json).unwrap();
        let attrs = resource.into_attrs().unwrap();
        assert_eq!(attrs.name, "a.part.0");
        assert_eq!(attrs.size, 1024);
        assert_eq!(attrs.crc32c, Some(Crc32c(0x8a91_36aa)));
    }

    #[test]
    fn bad_size_is_invalid_response() {
        let resource: ObjectResource =
            serde_json::from_str(r#"{"name":"a","size":"lots"}"#).unwrap();
        assert!(matches!(resource.into_attrs(), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn empty_listing() {
        let list: ObjectList = serde_json::from_str(r#"{"kind":"storage#objects"}"#).unwrap();
        assert!(list.items.is_empty());
        assert!(list.next_page_token.is_none());
    }

    #[test]
    fn compose_request_body() {
        let sources = vec!["d".to_string(), "d.part.10".to_string()];
        let body = serde_json::to_value(ComposeRequest::new(&sources, "application/octet-stream"))
            .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "sourceObjects": [{"name": "d"}, {"name": "d.part.10"}],
                "destination": {"contentType": "application/octet-stream"}
            })
        );
    }
}
