//! The small contract every cache implementation and decorator agrees on.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Available,
    NotFound,
    PermissionDenied,
}

/// Receives the outcome of a single `get`.
///
/// `done` is invoked exactly once. When the state is `Available` the value
/// has been handed over through `set_value` beforehand. Decorators that
/// forward to another callback must copy the value before forwarding.
pub trait Callback {
    fn set_value(&mut self, value: Bytes);

    /// Lets the receiver reject a hit (for example a stale payload); a
    /// rejected hit is reported as `NotFound`.
    fn validate_candidate(&mut self, _key: &[u8], _state: KeyState) -> bool {
        true
    }

    fn done(&mut self, state: KeyState);
}

pub trait CacheInterface: Send + Sync {
    /// May invoke `callback` on the calling thread before returning.
    fn get(&self, key: &[u8], callback: &mut dyn Callback);
    fn put(&self, key: &[u8], value: Bytes);
    fn delete(&self, key: &[u8]);

    fn name(&self) -> String;
    fn is_blocking(&self) -> bool;
    fn is_healthy(&self) -> bool;
    fn shut_down(&self);
}

/// Applies `validate_candidate` and fires `done`.
pub fn validate_and_report_result(key: &[u8], state: KeyState, callback: &mut dyn Callback) {
    let state = if state == KeyState::Available && !callback.validate_candidate(key, state) {
        KeyState::NotFound
    } else {
        state
    };
    callback.done(state);
}

/// Records the result of a blocking `get`.
#[derive(Debug)]
pub struct SynchronousCallback {
    called: bool,
    state: KeyState,
    value: Bytes,
}

impl SynchronousCallback {
    pub fn new() -> Self {
        SynchronousCallback {
            called: false,
            state: KeyState::NotFound,
            value: Bytes::new(),
        }
    }

    pub fn reset(&mut self) -> &mut Self {
        self.called = false;
        self.state = KeyState::NotFound;
        self.value = Bytes::new();
        self
    }

    pub fn called(&self) -> bool {
        self.called
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }
}

impl Default for SynchronousCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for SynchronousCallback {
    fn set_value(&mut self, value: Bytes) {
        self.value = value;
    }

    fn done(&mut self, state: KeyState) {
        debug_assert!(!self.called, "callback invoked twice");
        self.called = true;
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Picky {
        inner: SynchronousCallback,
    }

    impl Callback for Picky {
        fn set_value(&mut self, value: Bytes) {
            self.inner.set_value(value);
        }

        fn validate_candidate(&mut self, _key: &[u8], _state: KeyState) -> bool {
            self.inner.value().as_ref() != b"stale"
        }

        fn done(&mut self, state: KeyState) {
            self.inner.done(state);
        }
    }

    #[test]
    fn rejected_candidate_reports_not_found() {
        let mut cb = Picky {
            inner: SynchronousCallback::new(),
        };
        cb.set_value(Bytes::from_static(b"stale"));
        validate_and_report_result(b"k", KeyState::Available, &mut cb);
        assert!(cb.inner.called());
        assert_eq!(cb.inner.state(), KeyState::NotFound);
    }

    #[test]
    fn reset_clears_previous_result() {
        let mut cb = SynchronousCallback::new();
        cb.set_value(Bytes::from_static(b"v"));
        validate_and_report_result(b"k", KeyState::Available, &mut cb);
        assert_eq!(cb.state(), KeyState::Available);
        assert_eq!(cb.value().as_ref(), b"v");

        cb.reset();
        assert!(!cb.called());
        assert!(cb.value().is_empty());
    }
}
