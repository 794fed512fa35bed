//! Session state: structured messages, their rendered text, and how much of
//! that text the model has consumed.
//!
//! ```text
//! rendered:  |<------- committed ------->|<--- pending --->|
//!            0                      committed          rendered.len()
//! ```
//!
//! `committed` is character bookkeeping. The KV cell count reported by the
//! engine is the canonical measure of consumption; whenever the committed
//! text shrinks, the removed text is re-tokenized to find how many trailing
//! cells to evict.

use serde::{Deserialize, Serialize};

use crate::inference::llama_ffi::ChatMessageRef;
use crate::inference::template::ChatTemplate;
use crate::session::message::{Message, Role};

/// Length in bytes of the longest common prefix of `a` and `b`, always on a
/// char boundary of both.
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    messages: Vec<Message>,
    rendered: String,
    committed: usize,
    template: ChatTemplate,

    /// KV cells in use after the last mutation.
    used_cells: usize,
    last_tokens_per_second: f32,
    last_role: Option<Role>,
}

impl SessionState {
    pub fn new(template: ChatTemplate) -> Self {
        Self {
            template,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    pub fn committed_len(&self) -> usize {
        self.committed
    }

    pub fn committed_text(&self) -> &str {
        &self.rendered[..self.committed]
    }

    /// Rendered text not yet fed to decode.
    pub fn pending(&self) -> &str {
        &self.rendered[self.committed..]
    }

    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    pub fn used_cells(&self) -> usize {
        self.used_cells
    }

    pub fn set_used_cells(&mut self, cells: usize) {
        self.used_cells = cells;
    }

    pub fn last_role(&self) -> Option<Role> {
        self.last_role
    }

    pub fn record_throughput(&mut self, role: Role, tokens_per_second: f32) {
        self.last_role = Some(role);
        self.last_tokens_per_second = tokens_per_second;
    }

    /// Borrowed role/content pairs for the template renderer.
    pub fn message_refs(&self) -> Vec<ChatMessageRef<'_>> {
        self.messages
            .iter()
            .map(|m| ChatMessageRef {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect()
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn pop_message(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    pub fn last_message_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut()
    }

    /// Drop the last `n` messages (clamped); returns how many were removed.
    pub fn truncate_messages(&mut self, n: usize) -> usize {
        let n = n.min(self.messages.len());
        self.messages.truncate(self.messages.len() - n);
        n
    }

    /// Split `new_render` against the committed text: the byte length that
    /// both share, and the committed text beyond it that the model has seen
    /// but the new render no longer contains.
    pub fn plan_rebase<'a>(&'a self, new_render: &str) -> (usize, &'a str) {
        let committed = self.committed_text();
        let keep = common_prefix_len(committed, new_render);
        (keep, &committed[keep..])
    }

    /// Replace the rendered text, keeping the first `keep` bytes committed.
    pub fn rebase(&mut self, new_render: String, keep: usize) {
        self.committed = keep.min(new_render.len());
        self.rendered = new_render;
    }

    /// Mark everything up to `len` as consumed.
    pub fn commit_to(&mut self, len: usize) {
        self.committed = len.min(self.rendered.len()).max(self.committed);
    }

    /// Append text that was decoded directly (raw prompts, generated replies).
    ///
    /// Pending rendered text is discarded: the model saw `text` instead.
    pub fn extend_committed(&mut self, text: &str) {
        self.rendered.truncate(self.committed);
        self.rendered.push_str(text);
        self.committed = self.rendered.len();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.rendered.clear();
        self.committed = 0;
        self.used_cells = 0;
    }

    pub fn snapshot(&self, lifecycle: ModelLifecycle, context_max: usize) -> ModelState {
        ModelState {
            lifecycle,
            context_history: self.rendered.clone(),
            chat_history: self.messages.clone(),
            committed_length: self.committed,
            context_used: self.used_cells,
            context_max,
            last_tokens_per_second: self.last_tokens_per_second,
            last_role: self.last_role,
            template: self.template.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelLifecycle {
    #[default]
    Unloaded,
    Idle,
    Generating,
}

/// Copy of the session state handed to the foreground.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub lifecycle: ModelLifecycle,

    /// Rendered conversation text.
    pub context_history: String,
    pub chat_history: Vec<Message>,
    pub committed_length: usize,
    pub context_used: usize,
    pub context_max: usize,
    pub last_tokens_per_second: f32,
    pub last_role: Option<Role>,
    pub template: ChatTemplate,
}

impl ModelState {
    pub fn is_loaded(&self) -> bool {
        self.lifecycle != ModelLifecycle::Unloaded
    }

    pub fn is_generating(&self) -> bool {
        self.lifecycle == ModelLifecycle::Generating
    }
}
