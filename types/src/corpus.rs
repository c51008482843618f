//! Corpus units: the posts the annotator reads and the scenes they form.

use serde::{Deserialize, Serialize};

use crate::{PostId, ThreadId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryPost {
    pub post_id: PostId,
    pub thread_id: ThreadId,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// An ordered group of posts from one thread, processed as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub thread_id: ThreadId,
    pub posts: Vec<StoryPost>,
}

impl Scene {
    #[must_use]
    pub fn first_post_id(&self) -> Option<PostId> {
        self.posts.first().map(|p| p.post_id)
    }

    #[must_use]
    pub fn last_post_id(&self) -> Option<PostId> {
        self.posts.last().map(|p| p.post_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}
