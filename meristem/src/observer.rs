//! The observer contract of subscriptions.

use crate::{error::RecipeError, value::Value};

/// Callbacks a subscription delivers to.
///
/// All hooks default to no-ops, so implementors override only what they need.
///
/// # Logic
///
/// `dirty` **must** arrive before the `next` that resolves it, for every
/// observer transitively downstream of a write. `error` **may** fire multiple
/// times; it is informational, not terminal. `complete` fires exactly once,
/// when the observed cell is disposed.
pub trait Observer: Send {
	/// A new value was produced by the observed cell.
	fn next(&mut self, value: &Value) {
		let _ = value;
	}

	/// The observed cell's recipe failed.
	fn error(&mut self, error: &RecipeError) {
		let _ = error;
	}

	/// The observed cell was disposed. No further hooks will fire.
	fn complete(&mut self) {}

	/// The observed cell's cached value may be stale.
	fn dirty(&mut self) {}
}

/// A closure-assembled [`Observer`].
///
/// ```
/// use meristem::observer::Hooks;
///
/// let observer = Hooks::new()
/// 	.on_next(|value| println!("{value:?}"))
/// 	.on_complete(|| println!("done"));
/// ```
#[derive(Default)]
#[must_use = "Assembled hooks do nothing until passed to `subscribe`."]
pub struct Hooks {
	next: Option<Box<dyn FnMut(&Value) + Send>>,
	error: Option<Box<dyn FnMut(&RecipeError) + Send>>,
	complete: Option<Box<dyn FnMut() + Send>>,
	dirty: Option<Box<dyn FnMut() + Send>>,
}

impl Hooks {
	/// Creates a set of hooks that are all no-ops.
	pub fn new() -> Self {
		Self::default()
	}

	/// Replaces the `next` hook.
	pub fn on_next(mut self, next: impl FnMut(&Value) + Send + 'static) -> Self {
		self.next = Some(Box::new(next));
		self
	}

	/// Replaces the `error` hook.
	pub fn on_error(mut self, error: impl FnMut(&RecipeError) + Send + 'static) -> Self {
		self.error = Some(Box::new(error));
		self
	}

	/// Replaces the `complete` hook.
	pub fn on_complete(mut self, complete: impl FnMut() + Send + 'static) -> Self {
		self.complete = Some(Box::new(complete));
		self
	}

	/// Replaces the `dirty` hook.
	pub fn on_dirty(mut self, dirty: impl FnMut() + Send + 'static) -> Self {
		self.dirty = Some(Box::new(dirty));
		self
	}
}

impl Observer for Hooks {
	fn next(&mut self, value: &Value) {
		if let Some(next) = &mut self.next {
			next(value);
		}
	}

	fn error(&mut self, error: &RecipeError) {
		if let Some(hook) = &mut self.error {
			hook(error);
		}
	}

	fn complete(&mut self) {
		if let Some(complete) = &mut self.complete {
			complete();
		}
	}

	fn dirty(&mut self) {
		if let Some(dirty) = &mut self.dirty {
			dirty();
		}
	}
}
