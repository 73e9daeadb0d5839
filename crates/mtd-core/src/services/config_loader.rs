use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{MtdError, Result};
use crate::models::CloudSettings;

static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}(-[a-z]+)+-\d+$").unwrap());

/// Check the external inputs before any cloud or proxy traffic: the document
/// and credentials must exist and at least one well-formed region must be
/// configured. Contents are not inspected.
pub fn validate_inputs(document_path: &Path, cloud: &CloudSettings) -> Result<()> {
    if !document_path.exists() {
        return Err(MtdError::ConfigNotFound(document_path.to_path_buf()));
    }
    if !cloud.credentials_path.exists() {
        return Err(MtdError::CredentialsNotFound(cloud.credentials_path.clone()));
    }
    if cloud.regions.is_empty() {
        return Err(MtdError::InvalidConfig(
            "cloud.regions must list at least one region".into(),
        ));
    }
    if let Some(bad) = cloud.regions.iter().find(|r| !REGION_RE.is_match(r)) {
        return Err(MtdError::InvalidConfig(format!("invalid region name '{bad}'")));
    }
    if cloud.provider.is_empty() || cloud.provider.contains('_') {
        return Err(MtdError::InvalidConfig(format!(
            "invalid provider tag '{}'",
            cloud.provider
        )));
    }
    Ok(())
}
