//! Minimal XML handling for the S3 wire protocol.
//!
//! Only the three documents the provider actually exchanges: ListObjectsV2
//! responses, InitiateMultipartUpload responses, and the
//! CompleteMultipartUpload request body.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::provider::CompletedPart;
use vaultdrop_common::{Error, Result};

/// One object entry from a ListObjectsV2 page.
#[derive(Debug, Clone)]
pub(crate) struct ListEntry {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// One parsed ListObjectsV2 page.
#[derive(Debug)]
pub(crate) struct ListPage {
    pub entries: Vec<ListEntry>,
    pub next_token: Option<String>,
}

fn xml_error(e: quick_xml::Error) -> Error {
    Error::Serialization(format!("Malformed XML response: {}", e))
}

/// Parse a ListBucketResult document.
pub(crate) fn parse_list_page(xml: &str) -> Result<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut next_token = None;
    let mut in_contents = false;
    let mut current: Option<ListEntry> = None;
    let mut field: Option<Vec<u8>> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.name().as_ref() {
                b"Contents" => {
                    in_contents = true;
                    current = Some(ListEntry {
                        key: String::new(),
                        size: 0,
                        modified: None,
                        etag: None,
                    });
                }
                name => field = Some(name.to_vec()),
            },
            Event::End(e) => match e.name().as_ref() {
                b"Contents" => {
                    in_contents = false;
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                _ => field = None,
            },
            Event::Text(text) => {
                let value = text.unescape().map_err(xml_error)?.into_owned();
                match (in_contents, field.as_deref()) {
                    (true, Some(b"Key")) => {
                        if let Some(entry) = current.as_mut() {
                            entry.key = value;
                        }
                    }
                    (true, Some(b"Size")) => {
                        if let Some(entry) = current.as_mut() {
                            entry.size = value.parse().unwrap_or(0);
                        }
                    }
                    (true, Some(b"LastModified")) => {
                        if let Some(entry) = current.as_mut() {
                            entry.modified = DateTime::parse_from_rfc3339(&value)
                                .ok()
                                .map(|d| d.with_timezone(&Utc));
                        }
                    }
                    (true, Some(b"ETag")) => {
                        if let Some(entry) = current.as_mut() {
                            entry.etag = Some(value);
                        }
                    }
                    (false, Some(b"NextContinuationToken")) => next_token = Some(value),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(ListPage {
        entries,
        next_token,
    })
}

/// Extract the UploadId from an InitiateMultipartUploadResult document.
pub(crate) fn parse_upload_id(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut in_upload_id = false;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => in_upload_id = e.name().as_ref() == b"UploadId",
            Event::End(_) => in_upload_id = false,
            Event::Text(text) if in_upload_id => {
                return Ok(text.unescape().map_err(xml_error)?.into_owned());
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(Error::Serialization(
        "Initiate response carries no UploadId".to_string(),
    ))
}

/// Build a CompleteMultipartUpload request body.
///
/// # Preconditions
/// - `parts` is already sorted ascending by part number
pub(crate) fn complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            part.etag.replace('&', "&amp;").replace('<', "&lt;")
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>bucket</Name>
  <Prefix>uploads/t-1/</Prefix>
  <KeyCount>2</KeyCount>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token-abc</NextContinuationToken>
  <Contents>
    <Key>uploads/t-1/a.txt</Key>
    <LastModified>2024-03-01T12:00:00.000Z</LastModified>
    <ETag>&quot;etag-1&quot;</ETag>
    <Size>1024</Size>
  </Contents>
  <Contents>
    <Key>uploads/t-1/b.bin</Key>
    <LastModified>2024-03-02T08:30:00.000Z</LastModified>
    <ETag>&quot;etag-2&quot;</ETag>
    <Size>2048</Size>
  </Contents>
</ListBucketResult>"#;

        let page = parse_list_page(xml).unwrap();
        assert_eq!(page.next_token.as_deref(), Some("token-abc"));
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].key, "uploads/t-1/a.txt");
        assert_eq!(page.entries[0].size, 1024);
        assert_eq!(page.entries[0].etag.as_deref(), Some("\"etag-1\""));
        assert!(page.entries[0].modified.is_some());
        assert_eq!(page.entries[1].key, "uploads/t-1/b.bin");
        assert_eq!(page.entries[1].size, 2048);
    }

    #[test]
    fn test_parse_list_page_empty() {
        let xml = r#"<ListBucketResult><Name>bucket</Name><KeyCount>0</KeyCount></ListBucketResult>"#;
        let page = parse_list_page(xml).unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next_token.is_none());
    }

    #[test]
    fn test_parse_upload_id() {
        let xml = r#"<InitiateMultipartUploadResult>
  <Bucket>bucket</Bucket>
  <Key>uploads/t-1/big.bin</Key>
  <UploadId>VXBsb2FkIElE</UploadId>
</InitiateMultipartUploadResult>"#;
        assert_eq!(parse_upload_id(xml).unwrap(), "VXBsb2FkIElE");
    }

    #[test]
    fn test_parse_upload_id_missing_fails() {
        let err = parse_upload_id("<InitiateMultipartUploadResult/>").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_complete_body() {
        let body = complete_body(&[
            CompletedPart {
                part_number: 1,
                etag: "\"e1\"".to_string(),
            },
            CompletedPart {
                part_number: 2,
                etag: "\"e2\"".to_string(),
            },
        ]);
        assert_eq!(
            body,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }
}
