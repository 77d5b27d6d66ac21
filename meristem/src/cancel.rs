//! One-shot cancellation tokens for lifetime cutoff.

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use parking_lot::Mutex;

/// A one-shot abort signal.
///
/// Cells, effects and scopes constructed with a token dispose themselves when
/// the token aborts. A token that is already aborted at construction time
/// yields a born-disposed primitive.
///
/// Clones share the same abort state.
#[derive(Clone, Default)]
pub struct CancellationToken {
	inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
	aborted: AtomicBool,
	hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CancellationToken {
	/// Creates a token in the non-aborted state.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether this token has been aborted.
	#[must_use]
	pub fn aborted(&self) -> bool {
		self.inner.aborted.load(Ordering::Acquire)
	}

	/// Aborts the token, running every registered hook once.
	///
	/// Idempotent: later calls are no-ops.
	pub fn abort(&self) {
		if self.inner.aborted.swap(true, Ordering::AcqRel) {
			return;
		}
		let hooks = std::mem::take(&mut *self.inner.hooks.lock());
		for hook in hooks {
			hook();
		}
	}

	/// Registers `hook` to run when the token aborts.
	///
	/// If the token is already aborted, `hook` runs immediately.
	pub fn on_abort(&self, hook: impl FnOnce() + Send + 'static) {
		if self.aborted() {
			hook();
			return;
		}
		let mut hooks = self.inner.hooks.lock();
		// Racing abort: the flag may have flipped while acquiring the lock.
		if self.inner.aborted.load(Ordering::Acquire) {
			drop(hooks);
			hook();
		} else {
			hooks.push(Box::new(hook));
		}
	}
}

impl std::fmt::Debug for CancellationToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CancellationToken")
			.field("aborted", &self.aborted())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[test]
	fn fires_each_hook_once() {
		let fired = Arc::new(AtomicUsize::new(0));
		let token = CancellationToken::new();
		token.on_abort({
			let fired = Arc::clone(&fired);
			move || {
				fired.fetch_add(1, Ordering::SeqCst);
			}
		});
		token.abort();
		token.abort();
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn late_hooks_fire_immediately() {
		let token = CancellationToken::new();
		token.abort();
		let fired = Arc::new(AtomicUsize::new(0));
		token.on_abort({
			let fired = Arc::clone(&fired);
			move || {
				fired.fetch_add(1, Ordering::SeqCst);
			}
		});
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}
}
