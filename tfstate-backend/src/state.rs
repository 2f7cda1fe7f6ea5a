//! State file structures for persisting infrastructure state
//!
//! The stored body is a Terraform state document. The backend keeps the raw
//! bytes it was given (so external tooling sees exactly what was written) and
//! parses only what it needs to populate [`StateData`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};

/// Terraform state format version written for fresh states
pub const STATE_FORMAT_VERSION: u32 = 4;

/// A state document as pulled from or pushed to a backend
#[derive(Debug, Clone, PartialEq)]
pub struct StateData {
    /// State file format version
    pub version: u32,
    /// Version of Terraform that last modified this state
    pub terraform_version: String,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Raw state document; when empty, `push` renders one from the fields
    pub data: Vec<u8>,
    pub resources: Vec<StateResource>,
    pub outputs: serde_json::Map<String, serde_json::Value>,
    /// Base64 SHA-256 of `data`
    pub checksum: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// The subset of the document the backend understands
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    terraform_version: String,
    #[serde(default)]
    serial: u64,
    #[serde(default)]
    lineage: String,
    #[serde(default)]
    outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    resources: Vec<StateResource>,
}

impl StateData {
    /// The state reported for a workspace that has never been written
    pub fn empty() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    /// Create a new empty state with a specific lineage (for initialization)
    pub fn with_lineage(lineage: impl Into<String>) -> Self {
        let mut state = Self {
            version: STATE_FORMAT_VERSION,
            terraform_version: String::new(),
            serial: 0,
            lineage: lineage.into(),
            data: Vec::new(),
            resources: Vec::new(),
            outputs: serde_json::Map::new(),
            checksum: String::new(),
            last_modified: Utc::now(),
            size: 0,
        };
        // Rendering a document built from plain fields cannot fail
        if let Ok(data) = state.render() {
            state.checksum = compute_checksum(&data);
            state.data = data;
        }
        state
    }

    /// Parse a stored document
    pub fn from_bytes(data: Vec<u8>, last_modified: DateTime<Utc>) -> BackendResult<Self> {
        let document: StateDocument = serde_json::from_slice(&data)
            .map_err(|e| BackendError::InvalidState(format!("Failed to parse state: {}", e)))?;

        Ok(Self {
            version: document.version,
            terraform_version: document.terraform_version,
            serial: document.serial,
            lineage: document.lineage,
            resources: document.resources,
            outputs: document.outputs,
            checksum: compute_checksum(&data),
            size: data.len() as u64,
            last_modified,
            data,
        })
    }

    /// Increment serial for a new state write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
    }

    /// Bytes to store for this state
    ///
    /// Raw bytes are kept verbatim when their header agrees with the struct
    /// fields. Otherwise `version`, `terraform_version`, `serial` and
    /// `lineage` are rewritten inside the document, keeping every other key
    /// and the key order untouched.
    pub fn encode(&self) -> BackendResult<Vec<u8>> {
        if self.data.is_empty() {
            return self.render();
        }

        let mut document: serde_json::Value = serde_json::from_slice(&self.data)
            .map_err(|e| BackendError::InvalidState(format!("state is not valid JSON: {}", e)))?;
        let Some(object) = document.as_object_mut() else {
            return Err(BackendError::InvalidState(
                "state document must be a JSON object".to_string(),
            ));
        };

        let matches = object.get("version").and_then(|v| v.as_u64()) == Some(self.version as u64)
            && object.get("serial").and_then(|v| v.as_u64()) == Some(self.serial)
            && object.get("lineage").and_then(|v| v.as_str()) == Some(self.lineage.as_str())
            && object
                .get("terraform_version")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                == self.terraform_version;
        if matches {
            return Ok(self.data.clone());
        }

        object.insert("version".to_string(), self.version.into());
        object.insert(
            "terraform_version".to_string(),
            self.terraform_version.clone().into(),
        );
        object.insert("serial".to_string(), self.serial.into());
        object.insert("lineage".to_string(), self.lineage.clone().into());

        serde_json::to_vec_pretty(&document)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize state: {}", e)))
    }

    fn render(&self) -> BackendResult<Vec<u8>> {
        let document = StateDocument {
            version: self.version,
            terraform_version: self.terraform_version.clone(),
            serial: self.serial,
            lineage: self.lineage.clone(),
            outputs: self.outputs.clone(),
            resources: self.resources.clone(),
        };
        serde_json::to_vec_pretty(&document)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize state: {}", e)))
    }

    /// Find a resource by type and name
    pub fn find_resource(&self, resource_type: &str, name: &str) -> Option<&StateResource> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }
}

impl Default for StateData {
    fn default() -> Self {
        Self::empty()
    }
}

/// A resource block of a Terraform state document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Resource type (e.g., "aws_s3_bucket")
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub instances: Vec<ResourceInstance>,
}

fn default_mode() -> String {
    "managed".to_string()
}

/// One instance of a resource (several with `count`/`for_each`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    #[serde(default)]
    pub schema_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_key: Option<serde_json::Value>,
    #[serde(default)]
    pub attributes: serde_json::Value,
    /// Keys this crate doesn't interpret (sensitive_attributes, dependencies, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One entry of a backend's state history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersion {
    pub id: String,
    /// Substrate-native identifier (S3 version ID, blob snapshot, generation, ...)
    pub version_id: String,
    pub serial: u64,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub checksum: String,
    pub is_latest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Order history newest first and make sure exactly one entry is latest
///
/// An entry the substrate flagged as latest wins; otherwise the newest does.
pub(crate) fn normalize_versions(mut versions: Vec<StateVersion>) -> Vec<StateVersion> {
    versions.sort_by(|a, b| b.created.cmp(&a.created));
    let latest = versions.iter().position(|v| v.is_latest).unwrap_or(0);
    for (i, version) in versions.iter_mut().enumerate() {
        version.is_latest = i == latest;
    }
    if latest > 0 {
        let entry = versions.remove(latest);
        versions.insert(0, entry);
    }
    versions
}

/// Base64 SHA-256 digest of a state body
pub fn compute_checksum(data: &[u8]) -> String {
    STANDARD.encode(ring::digest::digest(&ring::digest::SHA256, data))
}

/// Decide whether `next` may replace `current`
///
/// Returns `Ok(false)` when `next_bytes` are identical to what is stored, in
/// which case nothing needs to be written.
pub(crate) fn check_successor(
    current: Option<&StateData>,
    next: &StateData,
    next_bytes: &[u8],
) -> BackendResult<bool> {
    let Some(current) = current else {
        return Ok(true);
    };

    if current.lineage != next.lineage {
        // A freshly initialized state may be replaced by any lineage
        if current.serial == 0 || current.lineage.is_empty() {
            return Ok(true);
        }
        return Err(BackendError::LineageMismatch {
            expected: current.lineage.clone(),
            actual: next.lineage.clone(),
        });
    }

    if next.serial > current.serial || (current.serial == 0 && next.serial == 0) {
        return Ok(true);
    }
    if current.data == next_bytes {
        return Ok(false);
    }
    Err(BackendError::SerialRegression {
        lineage: current.lineage.clone(),
        current: current.serial,
        attempted: next.serial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const SAMPLE: &str = r#"{
  "version": 4,
  "terraform_version": "1.7.5",
  "serial": 3,
  "lineage": "b6c3e7d2-0000-4000-8000-000000000001",
  "outputs": {
    "bucket_arn": { "value": "arn:aws:s3:::logs", "type": "string" }
  },
  "resources": [
    {
      "mode": "managed",
      "type": "aws_s3_bucket",
      "name": "logs",
      "provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
      "instances": [
        {
          "schema_version": 0,
          "attributes": { "bucket": "logs", "id": "logs" },
          "sensitive_attributes": [],
          "private": "bnVsbA=="
        }
      ]
    }
  ],
  "check_results": null
}"#;

    #[test]
    fn test_state_data_empty() {
        let state = StateData::empty();
        assert_eq!(state.version, 4);
        assert_eq!(state.serial, 0);
        assert!(!state.lineage.is_empty());
        assert!(state.resources.is_empty());

        let parsed = StateData::from_bytes(state.data.clone(), Utc::now()).unwrap();
        assert_eq!(parsed.lineage, state.lineage);
        assert_eq!(parsed.checksum, state.checksum);
    }

    #[test]
    fn test_from_bytes_parses_header_and_resources() {
        let state = StateData::from_bytes(SAMPLE.as_bytes().to_vec(), Utc::now()).unwrap();
        assert_eq!(state.version, 4);
        assert_eq!(state.terraform_version, "1.7.5");
        assert_eq!(state.serial, 3);
        assert_eq!(state.size, SAMPLE.len() as u64);
        assert_eq!(state.resources.len(), 1);

        let bucket = state.find_resource("aws_s3_bucket", "logs").unwrap();
        assert_eq!(bucket.instances[0].attributes["bucket"], "logs");
        assert!(bucket.instances[0].extra.contains_key("private"));
        assert!(state.outputs.contains_key("bucket_arn"));
    }

    #[test]
    fn test_from_bytes_rejects_malformed() {
        let result = StateData::from_bytes(b"{not json".to_vec(), Utc::now());
        assert!(matches!(result, Err(BackendError::InvalidState(_))));
    }

    #[test]
    fn test_encode_keeps_matching_bytes_verbatim() {
        let state = StateData::from_bytes(SAMPLE.as_bytes().to_vec(), Utc::now()).unwrap();
        assert_eq!(state.encode().unwrap(), SAMPLE.as_bytes());
    }

    #[test]
    fn test_encode_rewrites_stale_header() {
        let mut state = StateData::from_bytes(SAMPLE.as_bytes().to_vec(), Utc::now()).unwrap();
        state.increment_serial();

        let encoded = state.encode().unwrap();
        let reparsed = StateData::from_bytes(encoded.clone(), Utc::now()).unwrap();
        assert_eq!(reparsed.serial, 4);
        assert_eq!(reparsed.lineage, state.lineage);
        assert_eq!(reparsed.resources, state.resources);

        // Key order of the original document survives the rewrite
        let text = String::from_utf8(encoded).unwrap();
        let version_at = text.find("\"version\"").unwrap();
        let resources_at = text.find("\"resources\"").unwrap();
        let checks_at = text.find("\"check_results\"").unwrap();
        assert!(version_at < resources_at && resources_at < checks_at);
    }

    #[test]
    fn test_encode_rejects_non_object() {
        let mut state = StateData::empty();
        state.data = b"[1, 2, 3]".to_vec();
        assert!(matches!(state.encode(), Err(BackendError::InvalidState(_))));

        state.data = b"garbage".to_vec();
        assert!(matches!(state.encode(), Err(BackendError::InvalidState(_))));
    }

    #[test]
    fn test_check_successor() {
        let mut current = StateData::with_lineage("L1");
        current.serial = 5;
        current.data = current.encode().unwrap();

        let mut next = StateData::with_lineage("L1");
        next.serial = 6;
        assert!(check_successor(Some(&current), &next, b"{}").unwrap());
        assert!(check_successor(None, &next, b"{}").unwrap());

        next.serial = 5;
        assert!(matches!(
            check_successor(Some(&current), &next, b"{}"),
            Err(BackendError::SerialRegression { current: 5, attempted: 5, .. })
        ));
        // Re-pushing identical bytes is a no-op
        assert!(!check_successor(Some(&current), &next, &current.data).unwrap());

        let other = StateData::with_lineage("L2");
        assert!(matches!(
            check_successor(Some(&current), &other, b"{}"),
            Err(BackendError::LineageMismatch { .. })
        ));

        // A fresh state may be replaced by another lineage
        let fresh = StateData::with_lineage("L0");
        assert!(check_successor(Some(&fresh), &next, b"{}").unwrap());
    }

    #[test]
    fn test_normalize_versions() {
        let now = Utc::now();
        let entry = |id: &str, age: i64, latest: bool| StateVersion {
            id: id.to_string(),
            version_id: id.to_string(),
            serial: 0,
            created: now - Duration::seconds(age),
            size: 0,
            checksum: String::new(),
            is_latest: latest,
            description: None,
        };

        let versions = normalize_versions(vec![entry("old", 30, false), entry("new", 1, false)]);
        assert_eq!(versions[0].id, "new");
        assert!(versions[0].is_latest);
        assert!(!versions[1].is_latest);

        let versions = normalize_versions(vec![entry("a", 5, false), entry("b", 10, true)]);
        assert_eq!(versions[0].id, "b");
        assert_eq!(versions.iter().filter(|v| v.is_latest).count(), 1);
    }

    #[test]
    fn test_checksum_stable() {
        assert_eq!(compute_checksum(b"abc"), compute_checksum(b"abc"));
        assert_ne!(compute_checksum(b"abc"), compute_checksum(b"abd"));
    }
}
