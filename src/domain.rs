use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VaultError;

/// The two point-cloud encodings the converter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointCloudFormat {
    Las,
    Laz,
}

impl PointCloudFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PointCloudFormat::Las => "las",
            PointCloudFormat::Laz => "laz",
        }
    }

    /// Resolves the format from a client-supplied file name, case-insensitively.
    pub fn from_file_name(name: &str) -> Result<Self, VaultError> {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .ok_or_else(|| VaultError::InvalidExtension(name.to_string()))?;
        match ext.as_str() {
            "las" => Ok(PointCloudFormat::Las),
            "laz" => Ok(PointCloudFormat::Laz),
            _ => Err(VaultError::InvalidExtension(name.to_string())),
        }
    }
}

impl fmt::Display for PointCloudFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = Uuid::parse_str(value.trim())
            .map_err(|_| VaultError::InvalidProjectId(value.to_string()))?;
        Ok(Self(parsed.hyphenated().to_string()))
    }
}

impl TryFrom<String> for ProjectId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

/// Identifier issued by the identity provider. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(VaultError::MissingField("owner_id"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for OwnerId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OwnerId> for String {
    fn from(id: OwnerId) -> Self {
        id.0
    }
}

/// Durable descriptor of a converted project. Its presence on disk is what
/// makes the project visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub owner_id: OwnerId,
    pub original_name: String,
    pub byte_size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub viewer_url: String,
    pub artifact_root_url: String,
}

impl Project {
    pub fn new(
        id: ProjectId,
        owner_id: OwnerId,
        original_name: String,
        byte_size: u64,
        uploaded_at: DateTime<Utc>,
        url_prefix: &str,
    ) -> Self {
        let artifact_root_url = artifact_root_url(url_prefix, &id);
        let viewer_url = format!("{artifact_root_url}index.html");
        Self {
            id,
            owner_id,
            original_name,
            byte_size,
            uploaded_at,
            viewer_url,
            artifact_root_url,
        }
    }
}

pub fn artifact_root_url(url_prefix: &str, id: &ProjectId) -> String {
    format!("{}/{}/", url_prefix.trim_end_matches('/'), id.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoPointer {
    pub project_id: ProjectId,
    pub display_name: String,
    pub set_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_urls_derive_from_id() {
        let id: ProjectId = "5f0c6c1e-8a43-4c57-9b7e-2f7f3f1d9a10".parse().unwrap();
        let owner: OwnerId = "U1".parse().unwrap();
        let project = Project::new(
            id,
            owner,
            "scan.las".to_string(),
            42,
            Utc::now(),
            "/data/converted/",
        );
        assert_eq!(
            project.artifact_root_url,
            "/data/converted/5f0c6c1e-8a43-4c57-9b7e-2f7f3f1d9a10/"
        );
        assert!(project.viewer_url.ends_with("/index.html"));
    }
}
