use meristem::{
	runtime::{self, CellHandle, CellOptions},
	value::Value,
};

/// A reaction: runs its function once at construction and again after any of
/// the cells it read changes, at the next [`settle`](`crate::settle`).
///
/// An effect is its own scope. Cells, scopes and effects created while it
/// runs are disposed before every re-run, so nothing leaks across runs.
///
/// Consecutive dependency changes coalesce into a single re-run per drain.
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use tendril::{settle, Effect, SourceCell};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let cell = SourceCell::new(1.0);
/// let _effect = Effect::new({
/// 	let (cell, seen) = (cell.clone(), Arc::clone(&seen));
/// 	move || seen.lock().unwrap().push(cell.get().as_number().unwrap())
/// });
///
/// cell.set(2.0);
/// settle();
/// assert_eq!(*seen.lock().unwrap(), [1.0, 2.0]);
/// ```
#[must_use = "Effects are cancelled when dropped."]
#[derive(Debug)]
pub struct Effect(CellHandle);

impl Effect {
	/// Creates the effect and runs `f` once, synchronously.
	pub fn new(mut f: impl FnMut() + Send + 'static) -> Self {
		Self::with_options(
			move || {
				f();
			},
			&CellOptions::default(),
		)
	}

	/// Creates the effect with explicit options.
	pub fn with_options(mut f: impl FnMut() + Send + 'static, options: &CellOptions) -> Self {
		Self(runtime::effect(
			move || {
				f();
				Value::Null
			},
			options,
		))
	}

	/// Creates an effect whose `cleanup` consumes the previous run's output
	/// before every re-run and on disposal.
	///
	/// Both functions are part of the dependency detection scope.
	pub fn with_cleanup(
		f: impl FnMut() -> Value + Send + 'static,
		cleanup: impl FnMut(Value) + Send + 'static,
	) -> Self {
		Self::with_cleanup_and_options(f, cleanup, &CellOptions::default())
	}

	/// Creates an effect with a cleanup function and explicit options.
	pub fn with_cleanup_and_options(
		f: impl FnMut() -> Value + Send + 'static,
		cleanup: impl FnMut(Value) + Send + 'static,
		options: &CellOptions,
	) -> Self {
		Self(runtime::effect_with_cleanup(f, cleanup, options))
	}

	/// Re-runs the effect immediately, regardless of dirtiness.
	pub fn run(&self) {
		self.0.run();
	}

	/// Re-enables the effect. The next dependency change re-runs it; a change
	/// swallowed while disabled does not retroactively fire.
	pub fn enable(&self) {
		self.0.enable();
	}

	/// Disables the effect: dependency changes still mark it dirty, but it
	/// does not run until re-enabled.
	pub fn disable(&self) {
		self.0.disable();
	}

	/// Whether the effect currently reacts to changes.
	#[must_use]
	pub fn is_enabled(&self) -> bool {
		self.0.is_enabled()
	}

	/// The cells the last run read, in read order.
	#[must_use]
	pub fn observed(&self) -> Vec<CellHandle> {
		self.0.observed()
	}

	/// Cancels the effect, disposing everything it owns. Idempotent.
	pub fn dispose(&self) {
		self.0.dispose();
	}

	/// Whether the effect has been disposed.
	#[must_use]
	pub fn is_disposed(&self) -> bool {
		self.0.is_disposed()
	}
}

impl Drop for Effect {
	fn drop(&mut self) {
		self.0.dispose();
	}
}
