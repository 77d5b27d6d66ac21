use meristem::{
	observer::Observer,
	runtime::{self, CellHandle, CellOptions},
	value::Value,
};

use crate::{AsCell, Subscription};

/// A cell holding an immediate value.
///
/// Reads inside an active frame register as dependencies. Writes that are
/// [identical](`Value::identical`) to the stored value notify nobody; plain
/// record values are wrapped into [`ReactiveRecord`](`crate::ReactiveRecord`)
/// facades unless the cell was constructed shallow.
///
/// Writing another cell (via [`forward_to`](`Self::forward_to`) or a
/// [`Value::Cell`]) switches this cell into forwarding mode: it adopts the
/// upstream's current value and every later one, until a plain write severs
/// the link.
///
/// ```
/// use tendril::SourceCell;
///
/// let cell = SourceCell::new(1.0);
/// assert_eq!(cell.get().as_number(), Some(1.0));
///
/// cell.set(2.0);
/// assert_eq!(cell.get().as_number(), Some(2.0));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceCell(CellHandle);

impl SourceCell {
	/// Creates a cell holding `initial`.
	pub fn new(initial: impl Into<Value>) -> Self {
		Self::with_options(initial, &CellOptions::default())
	}

	/// Creates a cell holding `initial` with explicit options.
	pub fn with_options(initial: impl Into<Value>, options: &CellOptions) -> Self {
		Self(runtime::source(initial.into(), options))
	}

	/// The current value; registers this cell as a dependency of the active
	/// frame. Reads of disposed cells return the last value untracked.
	#[must_use]
	pub fn get(&self) -> Value {
		self.0.get()
	}

	/// Registers the dependency without cloning the value out.
	pub fn touch(&self) {
		self.0.touch()
	}

	/// Stores `value` and broadcasts to subscribers if it actually changed.
	///
	/// Writes to disposed cells are silently ignored; the return value stays
	/// `true` either way.
	pub fn set(&self, value: impl Into<Value>) -> bool {
		self.0.set(value.into())
	}

	/// Switches this cell into forwarding mode onto `upstream`.
	pub fn forward_to(&self, upstream: &impl AsCell) -> bool {
		self.0.set(Value::Cell(upstream.as_cell().clone()))
	}

	/// Functional in-place update: `f` maps the current value to the next.
	pub fn update(&self, f: impl FnOnce(Value) -> Value) -> bool {
		self.0.update(f)
	}

	/// Subscribes `observer` to this cell's broadcasts.
	pub fn subscribe(&self, observer: impl Observer + 'static) -> Subscription {
		Subscription::new(self.0.subscribe(observer))
	}

	/// Disposes the cell, completing all subscriptions. Idempotent.
	pub fn dispose(&self) {
		self.0.dispose()
	}

	/// Whether the cell has been disposed.
	#[must_use]
	pub fn is_disposed(&self) -> bool {
		self.0.is_disposed()
	}
}

impl AsCell for SourceCell {
	fn as_cell(&self) -> &CellHandle {
		&self.0
	}
}
