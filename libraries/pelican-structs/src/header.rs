use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;

/// One RFC-5322 envelope header, name and value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Serialize a header list for sealing. Stable JSON so the sealed bytes are
/// reproducible from the same input.
pub fn headers_to_json(headers: &[Header]) -> String {
    serde_json::to_string(headers).expect("header serialization failed")
}

/// Parse a sealed header list back from its JSON form.
pub fn headers_from_json(raw: &str) -> Result<Vec<Header>, serde_json::Error> {
    serde_json::from_str(raw)
}

/// An attachment carried by a send task.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde_as(as = "Base64")]
    pub bytes: Vec<u8>,
}
