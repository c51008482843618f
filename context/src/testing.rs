//! In-process fakes for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use annotator_providers::{AgentBackend, AgentClientError, BackendFut, ChatReply, ChatRequest};
use annotator_types::{EntryId, EntryStatus, GlossaryEntry, Message, ThreadId};

use crate::error::StorageError;
use crate::glossary::{Glossary, ThreadField};

/// Replies to `chat` from a queue (an exhausted queue is a server error),
/// answers `tokenize` with fixed ids or an error, and records requests.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, u16>>>,
    tokens: Option<Vec<u32>>,
    requests: Mutex<Vec<ChatRequest>>,
    chat_calls: AtomicUsize,
    tokenize_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_reply(self, content: &str) -> Self {
        self.push(Ok(content.to_string()));
        self
    }

    pub(crate) fn with_error(self, status: u16) -> Self {
        self.push(Err(status));
        self
    }

    pub(crate) fn with_tokens(mut self, tokens: Vec<u32>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub(crate) fn failing_tokenize(mut self) -> Self {
        self.tokens = None;
        self
    }

    fn push(&self, reply: Result<String, u16>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    pub(crate) fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn tokenize_calls(&self) -> usize {
        self.tokenize_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl AgentBackend for ScriptedBackend {
    fn chat<'a>(&'a self, request: &'a ChatRequest) -> BackendFut<'a, ChatReply> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .unwrap_or(Err(503));
        Box::pin(async move {
            match next {
                Ok(content) => Ok(ChatReply {
                    message: Message::assistant(content),
                    raw: serde_json::Value::Null,
                }),
                Err(status) => Err(AgentClientError::Server {
                    status,
                    body: "scripted failure".into(),
                }),
            }
        })
    }

    fn tokenize<'a>(&'a self, _text: &'a str) -> BackendFut<'a, Vec<u32>> {
        self.tokenize_calls.fetch_add(1, Ordering::SeqCst);
        let tokens = self.tokens.clone();
        Box::pin(async move {
            tokens.ok_or_else(|| AgentClientError::Malformed("tokenize unavailable".into()))
        })
    }

    fn health(&self) -> BackendFut<'_, bool> {
        Box::pin(async { Ok(true) })
    }
}

/// A glossary with no entries.
pub(crate) struct EmptyGlossary;

impl Glossary for EmptyGlossary {
    fn search(
        &self,
        _query: &str,
        _tags: &[String],
        _status: Option<EntryStatus>,
        _limit: usize,
    ) -> Result<Vec<GlossaryEntry>, StorageError> {
        Ok(Vec::new())
    }

    fn get(&self, _id: EntryId) -> Result<Option<GlossaryEntry>, StorageError> {
        Ok(None)
    }

    fn get_by_thread(
        &self,
        _thread_id: ThreadId,
        _field: ThreadField,
    ) -> Result<Vec<GlossaryEntry>, StorageError> {
        Ok(Vec::new())
    }

    fn count(&self) -> Result<u64, StorageError> {
        Ok(0)
    }

    fn all_entries(&self) -> Result<Vec<GlossaryEntry>, StorageError> {
        Ok(Vec::new())
    }
}
