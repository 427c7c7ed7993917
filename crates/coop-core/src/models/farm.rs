//! Farm model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::entity::SyncEntity;

/// A registered farm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Farm {
    /// Owning user
    pub owner_id: String,
    /// Display name
    pub name: String,
    /// Free-form location (village, district)
    #[serde(default)]
    pub location: Option<String>,
    /// Number of flocks registered on the farm
    #[serde(default)]
    pub flock_count: u32,
    /// Whether the farm passed verification
    #[serde(default)]
    pub verified: bool,
}

impl Farm {
    /// Create an unverified farm with no flocks
    #[must_use]
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            name: name.into(),
            location: None,
            flock_count: 0,
            verified: false,
        }
    }
}

impl SyncEntity for Farm {
    const COLLECTION: &'static str = "farms";

    fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::InvalidInput("farm owner cannot be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("farm name cannot be empty".into()));
        }
        Ok(())
    }

    fn search_text(&self) -> String {
        match &self.location {
            Some(location) => format!("{} {location}", self.name),
            None => self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_farm_validation() {
        assert!(Farm::new("u1", "Green Acres").validate().is_ok());
        assert!(Farm::new("u1", "  ").validate().is_err());
        assert!(Farm::new("", "Green Acres").validate().is_err());
    }

    #[test]
    fn test_search_text_includes_location() {
        let mut farm = Farm::new("u1", "Green Acres");
        farm.location = Some("Guntur".to_string());
        assert!(farm.search_text().contains("Guntur"));
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let farm: Farm = serde_json::from_str(r#"{"owner_id":"u1","name":"F"}"#).unwrap();
        assert_eq!(farm.flock_count, 0);
        assert!(!farm.verified);
    }
}
