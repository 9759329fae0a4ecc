//! Error hooks run before a failed request is returned to the caller.
//!
//! Each hook takes the [`RequestError`] by value and returns it, usually
//! after rewriting its message or stack. Hooks cannot fail, so a buggy hook
//! cannot replace the original error with one of its own.

use std::fmt;
use std::sync::Arc;

use crate::error::RequestError;

/// A transform applied to every failed request.
pub trait ErrorHook: Send + Sync {
    /// Rewrites the error and hands it back.
    fn before_error(&self, err: RequestError) -> RequestError;
}

impl<F> ErrorHook for F
where
    F: Fn(RequestError) -> RequestError + Send + Sync,
{
    fn before_error(&self, err: RequestError) -> RequestError {
        self(err)
    }
}

/// An ordered list of [`ErrorHook`]s.
///
/// Hooks run in registration order, each receiving the previous one's output.
#[derive(Clone, Default)]
pub struct ErrorHooks {
    hooks: Arc<[Arc<dyn ErrorHook>]>,
}

impl fmt::Debug for ErrorHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHooks")
            .field("hooks", &format!("[{} hooks]", self.hooks.len()))
            .finish()
    }
}

impl ErrorHooks {
    /// Creates an empty hook list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook.
    #[must_use]
    pub fn with_hook(self, hook: impl ErrorHook + 'static) -> Self {
        self.with_arc(Arc::new(hook))
    }

    /// Appends an already shared hook.
    #[must_use]
    pub fn with_arc(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        let mut hooks = self.hooks.to_vec();
        hooks.push(hook);
        self.hooks = Arc::from(hooks);
        self
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns `true` if no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every hook over `err`, in order.
    #[must_use]
    pub fn apply(&self, err: RequestError) -> RequestError {
        self.hooks
            .iter()
            .fold(err, |err, hook| hook.before_error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RequestErrorKind, RequestOptions};
    use reqwest::Method;

    fn error() -> RequestError {
        RequestError::new(
            RequestErrorKind::Transport,
            "base",
            RequestOptions::new(Method::GET),
        )
    }

    #[test]
    fn test_empty_hooks_return_error_untouched() {
        let hooks = ErrorHooks::new();
        assert!(hooks.is_empty());
        let err = hooks.apply(error());
        assert_eq!(err.message(), "base");
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let hooks = ErrorHooks::new()
            .with_hook(|mut err: RequestError| {
                let message = format!("{} first", err.message());
                err.set_message(message);
                err
            })
            .with_hook(|mut err: RequestError| {
                let message = format!("{} second", err.message());
                err.set_message(message);
                err
            });
        assert_eq!(hooks.len(), 2);

        let err = hooks.apply(error());
        assert_eq!(err.message(), "base first second");
        assert_eq!(err.kind(), RequestErrorKind::Transport);
    }

    #[test]
    fn test_clones_share_hooks() {
        let hooks = ErrorHooks::new().with_hook(|err: RequestError| err);
        let cloned = hooks.clone();
        assert_eq!(cloned.len(), 1);
        assert_eq!(format!("{cloned:?}"), "ErrorHooks { hooks: \"[1 hooks]\" }");
    }
}
