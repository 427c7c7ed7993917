//! Community post model

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::entity::SyncEntity;

/// A post in the community feed
///
/// Counters are server-maintained; the client never increments them
/// optimistically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub author_id: String,
    #[serde(default)]
    pub author_display_name: String,
    pub content: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub like_count: u32,
    #[serde(default)]
    pub comment_count: u32,
    #[serde(default)]
    pub is_edited: bool,
}

impl Post {
    #[must_use]
    pub fn new(author_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
            author_display_name: String::new(),
            content: content.into(),
            image_urls: Vec::new(),
            tags: Vec::new(),
            like_count: 0,
            comment_count: 0,
            is_edited: false,
        }
    }

    /// Whether the post carries the tag (case-insensitive)
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

impl SyncEntity for Post {
    const COLLECTION: &'static str = "posts";

    fn validate(&self) -> Result<()> {
        if self.author_id.trim().is_empty() {
            return Err(Error::InvalidInput("post author cannot be empty".into()));
        }
        if self.content.trim().is_empty() {
            return Err(Error::InvalidInput("post content cannot be empty".into()));
        }
        Ok(())
    }

    fn search_text(&self) -> String {
        let mut text = self.content.clone();
        for tag in &self.tags {
            text.push_str(" #");
            text.push_str(tag);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_validation() {
        assert!(Post::new("u1", "Hello").validate().is_ok());
        assert!(Post::new("u1", " \n ").validate().is_err());
        assert!(Post::new(" ", "Hello").validate().is_err());
    }

    #[test]
    fn test_has_tag() {
        let mut post = Post::new("u1", "Vaccination day");
        post.tags = vec!["Poultry".to_string()];
        assert!(post.has_tag("poultry"));
        assert!(!post.has_tag("cattle"));
        assert!(post.search_text().contains("#Poultry"));
    }
}
