//! Rendering destination identity.
//!
//! A task may name the view that will eventually display its image. The
//! scheduler never renders anything itself; it only needs to answer "do these
//! two tasks resolve to the same destination?" so that an older request for a
//! view can be dropped when a newer one arrives. Tasks hold a weak reference,
//! never ownership, so a pending task cannot keep a torn-down view alive.

use std::fmt;
use std::sync::{Arc, Weak};

/// Marker for anything an image can be rendered into (an image view, a
/// surface, a tile slot).
pub trait RenderTarget: Send + Sync {}

impl<T: Send + Sync> RenderTarget for T {}

/// Weak back-reference to a [`RenderTarget`].
#[derive(Clone)]
pub struct TargetRef {
    target: Weak<dyn RenderTarget>,
}

impl TargetRef {
    /// Reference `target` without taking ownership of it
    pub fn new<T: RenderTarget + 'static>(target: &Arc<T>) -> Self {
        let target: Arc<dyn RenderTarget> = target.clone();
        Self {
            target: Arc::downgrade(&target),
        }
    }

    /// Check whether the destination still exists
    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    /// Check whether both references resolve to the same live destination.
    ///
    /// A destination that has already been dropped resolves to nothing and
    /// therefore matches nothing.
    pub fn same_destination(&self, other: &TargetRef) -> bool {
        self.is_alive() && other.is_alive() && Weak::ptr_eq(&self.target, &other.target)
    }
}

impl fmt::Debug for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRef")
            .field("address", &Weak::as_ptr(&self.target).cast::<()>())
            .field("alive", &self.is_alive())
            .finish()
    }
}
