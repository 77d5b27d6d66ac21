use meristem::runtime::{self, CellHandle, CellOptions, Parent};

use crate::AsCell;

/// A lifetime node.
///
/// Scopes form a tree: disposing one disposes every descendant scope, cell
/// and effect first, depth-first, then severs the parent link. Construction
/// attaches to the currently running recipe's cell by default; use
/// [`detached`](`Self::detached`) or explicit options to opt out.
///
/// A plain scope can also act as a non-recomputing dependency collector via
/// [`observe`](`Self::observe`) and [`capture`](`Self::capture`): it records
/// which cells were read without ever re-running anything.
///
/// ```
/// use tendril::{Scope, SourceCell};
///
/// let cell = SourceCell::new(1.0);
/// let scope = Scope::detached();
/// scope.capture(|| {
/// 	let _ = cell.get();
/// });
/// assert_eq!(scope.observed().len(), 1);
///
/// scope.dispose();
/// assert!(scope.is_disposed());
/// ```
#[derive(Clone, Debug)]
pub struct Scope(CellHandle);

impl Scope {
	/// Creates a scope attached to the active frame, or detached if none is
	/// running.
	#[must_use]
	pub fn new() -> Self {
		Self::with_options(&CellOptions::default())
	}

	/// Creates a scope with no parent.
	#[must_use]
	pub fn detached() -> Self {
		Self::with_options(&CellOptions {
			parent: Parent::Detached,
			..CellOptions::default()
		})
	}

	/// Creates a scope with explicit options.
	///
	/// # Panics
	///
	/// Panics if the options name a disposed parent.
	#[must_use]
	pub fn with_options(options: &CellOptions) -> Self {
		Self(runtime::scope(options))
	}

	/// Records `source` in this scope's observation set.
	pub fn observe(&self, source: &impl AsCell) {
		self.0.observe(source.as_cell());
	}

	/// Runs `f` with this scope as the active frame: every cell read inside
	/// lands in the observation set.
	pub fn capture<T>(&self, f: impl FnOnce() -> T) -> T {
		self.0.capture(f)
	}

	/// The observed cells, in unspecified order, as a snapshot.
	#[must_use]
	pub fn observed(&self) -> Vec<CellHandle> {
		self.0.observed()
	}

	/// The direct children, as a snapshot.
	#[must_use]
	pub fn children(&self) -> Vec<CellHandle> {
		self.0.children()
	}

	/// Disposes this scope and everything it owns, depth-first. Idempotent.
	pub fn dispose(&self) {
		self.0.dispose();
	}

	/// Whether the scope has been disposed.
	#[must_use]
	pub fn is_disposed(&self) -> bool {
		self.0.is_disposed()
	}

	/// The handle backing this scope, usable as an explicit
	/// [`Parent`](`meristem::runtime::Parent`).
	#[must_use]
	pub fn handle(&self) -> &CellHandle {
		&self.0
	}
}

impl Default for Scope {
	fn default() -> Self {
		Self::new()
	}
}
