use meristem::{
	observer::Observer,
	runtime::{self, CellHandle, CellOptions},
	value::Value,
};

use crate::{AsCell, Subscription};

/// A cell whose value is computed from other cells by a recipe.
///
/// The recipe runs lazily: on the first read, and again only when a read or
/// the settle queue finds that a dependency's value actually changed since
/// the cached result. A derived cell nobody subscribes to never recomputes
/// spontaneously, no matter how often its dependencies change.
///
/// Derived cells are also scopes: cells and effects created while the recipe
/// runs are owned by it.
///
/// ```
/// use tendril::{DerivedCell, SourceCell, Value};
///
/// let base = SourceCell::new(2.0);
/// let squared = DerivedCell::computed({
/// 	let base = base.clone();
/// 	move || {
/// 		let n = base.get().as_number().unwrap();
/// 		Value::Number(n * n)
/// 	}
/// });
/// assert_eq!(squared.get().as_number(), Some(4.0));
///
/// base.set(3.0);
/// assert_eq!(squared.get().as_number(), Some(9.0));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedCell(CellHandle);

impl DerivedCell {
	/// Creates a derived cell over `recipe`.
	pub fn computed(recipe: impl FnMut() -> Value + Send + 'static) -> Self {
		Self::computed_with_options(recipe, &CellOptions::default())
	}

	/// Creates a derived cell over `recipe` with explicit options.
	pub fn computed_with_options(
		recipe: impl FnMut() -> Value + Send + 'static,
		options: &CellOptions,
	) -> Self {
		Self(runtime::derived(recipe, options))
	}

	/// Creates a writable derived cell: `get` computes the value, `set`
	/// accepts writes.
	pub fn accessor(
		get: impl FnMut() -> Value + Send + 'static,
		set: impl FnMut(Value) + Send + 'static,
	) -> Self {
		Self::accessor_with_options(get, set, &CellOptions::default())
	}

	/// Creates a writable derived cell with explicit options.
	pub fn accessor_with_options(
		get: impl FnMut() -> Value + Send + 'static,
		set: impl FnMut(Value) + Send + 'static,
		options: &CellOptions,
	) -> Self {
		Self(runtime::derived_with_writer(get, set, options))
	}

	/// The current value, recomputed first if a dependency changed;
	/// registers this cell as a dependency of the active frame.
	///
	/// # Panics
	///
	/// Forwards a recipe failure to the caller.
	#[must_use]
	pub fn get(&self) -> Value {
		self.0.get()
	}

	/// Validates and registers the dependency without cloning the value out.
	pub fn touch(&self) {
		self.0.touch()
	}

	/// Routes `value` through the writer.
	///
	/// # Panics
	///
	/// Panics if this cell was built without a writer.
	pub fn set(&self, value: impl Into<Value>) -> bool {
		self.0.set(value.into())
	}

	/// Subscribes `observer`. A cell that never computed runs a protected
	/// first evaluation whose failure is swallowed.
	pub fn subscribe(&self, observer: impl Observer + 'static) -> Subscription {
		Subscription::new(self.0.subscribe(observer))
	}

	/// The cells the last recipe run read, in read order.
	#[must_use]
	pub fn observed(&self) -> Vec<CellHandle> {
		self.0.observed()
	}

	/// The scopes and cells owned by this cell's recipe runs.
	#[must_use]
	pub fn children(&self) -> Vec<CellHandle> {
		self.0.children()
	}

	/// Disposes the cell: owned children first, then all graph edges.
	/// Idempotent.
	pub fn dispose(&self) {
		self.0.dispose()
	}

	/// Whether the cell has been disposed.
	#[must_use]
	pub fn is_disposed(&self) -> bool {
		self.0.is_disposed()
	}
}

impl AsCell for DerivedCell {
	fn as_cell(&self) -> &CellHandle {
		&self.0
	}
}
