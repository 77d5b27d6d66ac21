#![warn(clippy::pedantic)]

//! Fine-grained reactive primitives over the [`meristem`] cell graph.
//!
//! Declare values with [`SourceCell`], derive from them with [`DerivedCell`],
//! react to them with [`Effect`], and bound lifetimes with [`Scope`]. Reads
//! inside a recipe register automatically as dependencies; writes propagate
//! dirtiness immediately and recomputation of watched cells is deferred
//! until [`settle`] runs the queue.
//!
//! ```
//! use tendril::{settle, DerivedCell, Effect, SourceCell, Value};
//!
//! let a = SourceCell::new(1.0);
//! let b = DerivedCell::computed({
//! 	let a = a.clone();
//! 	move || Value::Number(a.get().as_number().unwrap() * 2.0)
//! });
//! assert_eq!(b.get().as_number(), Some(2.0));
//!
//! let _watch = Effect::new({
//! 	let b = b.clone();
//! 	move || {
//! 		let _ = b.get();
//! 	}
//! });
//! a.set(3.0);
//! settle();
//! assert_eq!(b.get().as_number(), Some(6.0));
//! ```

mod source_cell;
pub use source_cell::SourceCell;

mod derived_cell;
pub use derived_cell::DerivedCell;

mod effect;
pub use effect::Effect;

mod scope;
pub use scope::Scope;

mod subscription;
pub use subscription::Subscription;

mod conversions;

pub use meristem::{
	cancel::CancellationToken,
	error::{PropertyError, RecipeError},
	observer::{Hooks, Observer},
	reactive::{is_reactive, property_cell, ReactiveRecord},
	runtime::{settle, untracked, CellHandle, CellId, CellOptions, Parent},
	value::{Accessor, Key, List, Property, Record, Symbol, Value},
};

/// Interop hook: anything that can expose the cell backing it.
///
/// Cells, derived cells and reactive primitives built on top of them all
/// answer with the same underlying handle, so observer machinery written
/// against [`CellHandle`] composes with every wrapper.
pub trait AsCell {
	/// The cell backing this value.
	fn as_cell(&self) -> &CellHandle;
}

impl AsCell for CellHandle {
	fn as_cell(&self) -> &CellHandle {
		self
	}
}
