//! Community user profile model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::entity::SyncEntity;

const MAX_DISPLAY_NAME_CHARS: usize = 50;

/// Public profile shown next to posts and comments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub follower_count: u32,
    #[serde(default)]
    pub following_count: u32,
}

impl Profile {
    #[must_use]
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            bio: None,
            avatar_url: None,
            location: None,
            follower_count: 0,
            following_count: 0,
        }
    }
}

impl SyncEntity for Profile {
    const COLLECTION: &'static str = "profiles";

    fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::InvalidInput("profile user id cannot be empty".into()));
        }
        let name = self.display_name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("display name cannot be empty".into()));
        }
        if name.chars().count() > MAX_DISPLAY_NAME_CHARS {
            return Err(Error::InvalidInput(format!(
                "display name is longer than {MAX_DISPLAY_NAME_CHARS} characters"
            )));
        }
        Ok(())
    }

    fn search_text(&self) -> String {
        let mut text = self.display_name.clone();
        if let Some(bio) = &self.bio {
            text.push(' ');
            text.push_str(bio);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_validation() {
        assert!(Profile::new("u1", "Ravi").validate().is_ok());
        assert!(Profile::new("u1", "   ").validate().is_err());
        assert!(Profile::new("u1", "x".repeat(51)).validate().is_err());
    }
}
