//! Domain types shared by every annotator crate.
//!
//! Pure data: no IO, no async, no storage.

mod corpus;
mod glossary;
mod ids;
mod message;
pub mod text;

pub use corpus::{Scene, StoryPost};
pub use glossary::{EntryStatus, GlossaryEntry, UnknownStatus};
pub use ids::{EntryId, PostId, SnapshotId, ThreadId};
pub use message::{
    AssistantMessage, Message, Role, SystemMessage, ToolCall, ToolMessage, TurnTags, UserMessage,
    WireError,
};
