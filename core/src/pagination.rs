/// Per-conversation history paging
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// A history fetch the caller should issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_id: String,
    pub page: u32,
}

/// Paging state of one conversation. Page 1 is the newest; `current_page` is the oldest page loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageState {
    pub current_page: u32,
    pub total_pages: u32,
    pub in_flight: Option<u32>,
}

impl PageState {
    pub fn has_more(&self) -> bool {
        self.current_page < self.total_pages
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }
}

#[derive(Debug, Default)]
pub struct PaginationCursor {
    states: HashMap<String, PageState>,
}

impl PaginationCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start over from the newest page
    pub fn load_initial(&mut self, conversation_id: &str) -> Option<PageRequest> {
        let state = self
            .states
            .entry(conversation_id.to_string())
            .or_insert(PageState {
                current_page: 0,
                total_pages: 0,
                in_flight: None,
            });
        if state.in_flight == Some(1) {
            return None;
        }
        state.in_flight = Some(1);
        Some(PageRequest {
            conversation_id: conversation_id.to_string(),
            page: 1,
        })
    }

    /// Next older page, or `None` at the last page, while loading, or before the first page landed
    pub fn load_older(&mut self, conversation_id: &str) -> Option<PageRequest> {
        let state = self.states.get_mut(conversation_id)?;
        if state.is_loading() || state.current_page == 0 || !state.has_more() {
            debug!(
                conversation_id,
                current = state.current_page,
                total = state.total_pages,
                loading = state.is_loading(),
                "load older refused"
            );
            return None;
        }
        let page = state.current_page + 1;
        state.in_flight = Some(page);
        Some(PageRequest {
            conversation_id: conversation_id.to_string(),
            page,
        })
    }

    /// Record a successful response; stale responses (not the page in flight) are rejected
    pub fn complete(&mut self, conversation_id: &str, page: u32, total_pages: u32) -> bool {
        let Some(state) = self.states.get_mut(conversation_id) else {
            return false;
        };
        if state.in_flight != Some(page) {
            debug!(conversation_id, page, "stale page response ignored");
            return false;
        }
        state.in_flight = None;
        state.current_page = page;
        state.total_pages = total_pages.max(page).max(1);
        true
    }

    /// Release the in-flight guard after a failed fetch
    pub fn fail(&mut self, conversation_id: &str, page: u32) -> bool {
        match self.states.get_mut(conversation_id) {
            Some(state) if state.in_flight == Some(page) => {
                state.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_in_flight(&self, conversation_id: &str, page: u32) -> bool {
        self.states
            .get(conversation_id)
            .map(|s| s.in_flight == Some(page))
            .unwrap_or(false)
    }

    pub fn has_more(&self, conversation_id: &str) -> bool {
        self.states
            .get(conversation_id)
            .map(PageState::has_more)
            .unwrap_or(false)
    }

    pub fn state(&self, conversation_id: &str) -> Option<PageState> {
        self.states.get(conversation_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, PageState> {
        self.states.clone()
    }

    pub fn forget(&mut self, conversation_id: &str) {
        self.states.remove(conversation_id);
    }
}

/// Keeps the viewport on the same message while older history is prepended
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    height: f64,
    offset: f64,
}

impl ScrollAnchor {
    /// Capture before the prepend lands
    pub fn capture(content_height: f64, scroll_offset: f64) -> Self {
        Self {
            height: content_height,
            offset: scroll_offset,
        }
    }

    /// Offset that shows the same content after the height grew to `new_height`
    pub fn restore(&self, new_height: f64) -> f64 {
        (self.offset + (new_height - self.height)).max(0.0)
    }
}
