//! Comment model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::entity::SyncEntity;

/// A comment on a community post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Post the comment belongs to
    pub post_id: String,
    pub author_id: String,
    pub content: String,
    /// Parent comment for threaded replies
    #[serde(default)]
    pub parent_comment_id: Option<String>,
    #[serde(default)]
    pub like_count: u32,
    #[serde(default)]
    pub reply_count: u32,
}

impl Comment {
    #[must_use]
    pub fn new(
        post_id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            post_id: post_id.into(),
            author_id: author_id.into(),
            content: content.into(),
            parent_comment_id: None,
            like_count: 0,
            reply_count: 0,
        }
    }
}

impl SyncEntity for Comment {
    const COLLECTION: &'static str = "comments";

    fn validate(&self) -> Result<()> {
        if self.post_id.trim().is_empty() {
            return Err(Error::InvalidInput("comment must reference a post".into()));
        }
        if self.author_id.trim().is_empty() {
            return Err(Error::InvalidInput("comment author cannot be empty".into()));
        }
        if self.content.trim().is_empty() {
            return Err(Error::InvalidInput("comment content cannot be empty".into()));
        }
        Ok(())
    }

    fn search_text(&self) -> String {
        self.content.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_validation() {
        assert!(Comment::new("p1", "u1", "Nice birds").validate().is_ok());
        assert!(Comment::new("", "u1", "Nice birds").validate().is_err());
        assert!(Comment::new("p1", "u1", "").validate().is_err());
    }
}
