//! The single mutable cell shared between request handlers and the reload
//! scheduler. Readers take a lock-free snapshot; writers replace the whole
//! `ServedModel` and never mutate one in place.

use crate::model::ServedModel;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
pub struct ModelSlot {
    current: ArcSwapOption<ServedModel>,
    writer: Mutex<()>,
}

impl ModelSlot {
    pub fn new() -> Self { Self::default() }

    /// Snapshot of the served model, or `None` while not ready. Never blocks.
    pub fn read(&self) -> Option<Arc<ServedModel>> { self.current.load_full() }

    pub fn is_ready(&self) -> bool { self.current.load().is_some() }

    /// Installs `next` and hands back what was served before it. Concurrent
    /// replaces are serialized; readers see either the old or the new model.
    pub fn replace(&self, next: ServedModel) -> Option<Arc<ServedModel>> {
        let _guard = self.writer.lock();
        self.current.swap(Some(Arc::new(next)))
    }
}

impl std::fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSlot").field("current", &self.read()).finish()
    }
}
