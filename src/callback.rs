//! Callbacks and owner liveness.
//!
//! A registration fires only while its owner is alive. Instead of relying on
//! the garbage collector, liveness is an explicit capability of the callback:
//! [`Callback::is_alive`]. Plain closures are always alive; [`WeakCallback`]
//! ties a closure to an `Arc` owner without keeping that owner alive.
//!
//! ```
//! use std::sync::Arc;
//! use busline::{Callback, CallbackResult, Extra, Message, WeakCallback};
//!
//! struct Dashboard;
//!
//! let owner = Arc::new(Dashboard);
//! let cb = WeakCallback::new(&owner, |_dashboard: &Dashboard, _msg: &Message, _extra: &Extra| -> CallbackResult {
//!     Ok(())
//! });
//! assert!(Callback::<Message>::is_alive(&cb));
//! drop(owner);
//! assert!(!Callback::<Message>::is_alive(&cb));
//! ```

use std::error::Error;
use std::sync::{Arc, Weak};

use crate::message::Extra;

/// Error a callback may return. Reported to the error sink, never retried.
pub type CallbackError = Box<dyn Error + Send + Sync>;

pub type CallbackResult = Result<(), CallbackError>;

/// Something that receives messages of type `M`.
///
/// Implemented for every `Fn(&M, &Extra) -> CallbackResult` closure.
pub trait Callback<M>: Send + Sync {
    fn call(&self, message: &M, extra: &Extra) -> CallbackResult;

    /// Whether the owner of this callback still exists. Registrations whose
    /// callback is no longer alive are skipped and dropped.
    fn is_alive(&self) -> bool {
        true
    }
}

impl<M, F> Callback<M> for F
where
    F: Fn(&M, &Extra) -> CallbackResult + Send + Sync,
{
    fn call(&self, message: &M, extra: &Extra) -> CallbackResult {
        self(message, extra)
    }
}

/// A callback bound to an owner held by weak reference.
pub struct WeakCallback<T, F> {
    owner: Weak<T>,
    f: F,
}

impl<T, F> WeakCallback<T, F> {
    pub fn new(owner: &Arc<T>, f: F) -> Self {
        Self {
            owner: Arc::downgrade(owner),
            f,
        }
    }
}

impl<M, T, F> Callback<M> for WeakCallback<T, F>
where
    T: Send + Sync,
    F: Fn(&T, &M, &Extra) -> CallbackResult + Send + Sync,
{
    fn call(&self, message: &M, extra: &Extra) -> CallbackResult {
        match self.owner.upgrade() {
            Some(owner) => (self.f)(&owner, message, extra),
            None => Ok(()),
        }
    }

    fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }
}
