//! Oversize gadget output storage and the built-in viewer gadget.
//!
//! When output limiting is enabled, a gadget result larger than the
//! configured budget is moved into the [`OutputStore`] and replaced by a
//! pointer message telling the model to page through it with the
//! built-in [`GadgetOutputViewer`] gadget. The limiting pass runs before
//! any user result interceptors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::executor::GadgetContext;
use crate::gadget::{Gadget, GadgetError, GadgetReturn, OUTPUT_VIEWER_NAME};

/// Options bounding gadget results relative to the model context window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputLimitOptions {
    /// Fraction of the context window a single result may occupy.
    pub context_fraction: f64,
    /// Conservative characters-per-token constant.
    pub chars_per_token: usize,
    /// Window used when the catalog does not know the model.
    pub fallback_context_window: u32,
}

impl Default for OutputLimitOptions {
    fn default() -> Self {
        Self {
            context_fraction: 0.25,
            chars_per_token: 4,
            fallback_context_window: 128_000,
        }
    }
}

impl OutputLimitOptions {
    /// The character budget for one result given a context window.
    #[must_use]
    pub fn max_chars(&self, context_window: u32) -> usize {
        let budget =
            f64::from(context_window) * self.chars_per_token as f64 * self.context_fraction;
        (budget as usize).max(1)
    }
}

#[derive(Debug, Clone)]
struct StoredOutput {
    text: String,
    page_size: usize,
}

/// One page of a stored output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPage {
    /// Page content.
    pub content: String,
    /// 1-indexed page number.
    pub page: usize,
    /// Total page count.
    pub total_pages: usize,
}

/// Store of oversize outputs keyed by opaque id. Cloning shares the
/// store.
#[derive(Debug, Clone, Default)]
pub struct OutputStore {
    entries: Arc<Mutex<HashMap<String, StoredOutput>>>,
}

impl OutputStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a text, returning its opaque id.
    pub fn store(&self, text: String, page_size: usize) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                StoredOutput {
                    text,
                    page_size: page_size.max(1),
                },
            );
        id
    }

    /// Total pages of a stored output.
    #[must_use]
    pub fn page_count(&self, id: &str) -> Option<usize> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(id).map(|o| page_count(&o.text, o.page_size))
    }

    /// Read one 1-indexed page of a stored output.
    #[must_use]
    pub fn page(&self, id: &str, page: usize) -> Option<OutputPage> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let output = entries.get(id)?;
        let total_pages = page_count(&output.text, output.page_size);
        if page == 0 || page > total_pages {
            return None;
        }
        let content: String = output
            .text
            .chars()
            .skip((page - 1) * output.page_size)
            .take(output.page_size)
            .collect();
        Some(OutputPage {
            content,
            page,
            total_pages,
        })
    }
}

fn page_count(text: &str, page_size: usize) -> usize {
    text.chars().count().div_ceil(page_size).max(1)
}

/// Replace `text` with a pointer message when it exceeds `max_chars`.
///
/// This pass composes before any user `gadget_result` interceptor.
#[must_use]
pub fn apply_output_limit(
    store: &OutputStore,
    gadget_name: &str,
    text: String,
    max_chars: usize,
) -> String {
    let len = text.chars().count();
    if len <= max_chars {
        return text;
    }
    let id = store.store(text, max_chars);
    let pages = store.page_count(&id).unwrap_or(1);
    format!(
        "Output of {gadget_name} was {len} characters, above the {max_chars} character limit. \
         It was stored under id \"{id}\" ({pages} pages). \
         Call {OUTPUT_VIEWER_NAME} with output_id \"{id}\" and page set to 1..{pages} to read it."
    )
}

/// Built-in gadget that pages through stored oversize outputs.
#[derive(Debug, Clone)]
pub struct GadgetOutputViewer {
    outputs: OutputStore,
}

impl GadgetOutputViewer {
    /// Create a viewer reading from the given store.
    #[must_use]
    pub const fn new(outputs: OutputStore) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl Gadget for GadgetOutputViewer {
    fn name(&self) -> &str {
        OUTPUT_VIEWER_NAME
    }

    fn description(&self) -> &str {
        "Reads one page of a stored oversize gadget output by its id."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "output_id": {
                    "type": "string",
                    "description": "Id from the pointer message"
                },
                "page": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "1-indexed page to read (default 1)"
                }
            },
            "required": ["output_id"]
        })
    }

    async fn execute(
        &self,
        params: Value,
        _ctx: &GadgetContext,
    ) -> Result<GadgetReturn, GadgetError> {
        let output_id = params
            .get("output_id")
            .and_then(Value::as_str)
            .ok_or_else(|| GadgetError::failed("output_id is required"))?;
        let page = params
            .get("page")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1) as usize;

        let Some(page) = self.outputs.page(output_id, page) else {
            return Err(GadgetError::failed(format!(
                "no stored output for id \"{output_id}\" (or page out of range)"
            )));
        };

        Ok(GadgetReturn::text(format!(
            "{}\n\n[page {} of {}]",
            page.content, page.page, page.total_pages
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn small_output_is_untouched() {
        let store = OutputStore::new();
        let text = apply_output_limit(&store, "Fetch", "short".to_owned(), 100);
        assert_eq!(text, "short");
    }

    #[test]
    fn oversize_output_becomes_a_pointer() {
        let store = OutputStore::new();
        let big = "x".repeat(250);
        let pointer = apply_output_limit(&store, "Fetch", big, 100);
        assert!(pointer.contains(OUTPUT_VIEWER_NAME));
        assert!(pointer.contains("250 characters"));
        assert!(pointer.contains("3 pages"));
    }

    #[test]
    fn pages_cover_the_whole_text() {
        let store = OutputStore::new();
        let id = store.store("abcdefghij".to_owned(), 4);
        assert_eq!(store.page_count(&id), Some(3));
        assert_eq!(store.page(&id, 1).unwrap().content, "abcd");
        assert_eq!(store.page(&id, 2).unwrap().content, "efgh");
        assert_eq!(store.page(&id, 3).unwrap().content, "ij");
        assert!(store.page(&id, 4).is_none());
        assert!(store.page(&id, 0).is_none());
    }

    #[test]
    fn max_chars_scales_with_window() {
        let options = OutputLimitOptions::default();
        // 1000 tokens * 4 chars * 0.25 fraction.
        assert_eq!(options.max_chars(1000), 1000);
    }
}
