use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::instance::Bindings;
use crate::response::Response;
use crate::sampler::GenerationParams;
use crate::schema::{NodePath, SchemaTree};

/// Cooperative cancellation handle. Checked before each collaborator call; a
/// call already dispatched always runs to completion.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One generation request as sent to the engine thread.
pub struct Request {
    pub schema: Arc<SchemaTree>,
    /// Module paths to include, in the order they should appear. The engine
    /// never reorders them.
    pub selection: Vec<NodePath>,
    pub bindings: Bindings,
    pub params: GenerationParams,
    pub response: Sender<Response>,
    pub id: usize,
    pub cancel: CancelToken,
}

impl Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let selection: Vec<String> = self.selection.iter().map(ToString::to_string).collect();
        write!(
            f,
            "Request {} {{ selection: {selection:?}, params: {:?} }}",
            self.id, self.params
        )
    }
}
