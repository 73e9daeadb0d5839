use std::fmt;
use std::str::FromStr;

use crate::error::{MtdError, Result};

const SEPARATOR: char = '_';

/// Identifies one compute instance: `<provider>_<region>_<instance-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloudLocator {
    provider: String,
    region: String,
    instance_id: String,
}

impl CloudLocator {
    pub fn new(provider: &str, region: &str, instance_id: &str) -> Result<Self> {
        for part in [provider, region, instance_id] {
            if part.is_empty() || part.contains(SEPARATOR) {
                return Err(MtdError::MalformedLocator(format!(
                    "{provider}{SEPARATOR}{region}{SEPARATOR}{instance_id}"
                )));
            }
        }
        Ok(Self {
            provider: provider.to_string(),
            region: region.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split(SEPARATOR).collect();
        match parts.as_slice() {
            [provider, region, instance_id]
                if !provider.is_empty() && !region.is_empty() && !instance_id.is_empty() =>
            {
                Ok(Self {
                    provider: provider.to_string(),
                    region: region.to_string(),
                    instance_id: instance_id.to_string(),
                })
            }
            _ => Err(MtdError::MalformedLocator(input.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl fmt::Display for CloudLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.provider, self.region, self.instance_id
        )
    }
}

impl FromStr for CloudLocator {
    type Err = MtdError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
