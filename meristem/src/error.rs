//! Error types surfaced by the engine.

use std::{any::Any, sync::Arc};

use thiserror::Error;

/// A failure raised by a recipe while it was recomputing a cell.
///
/// Panic payloads that are not strings are replaced by a generic message;
/// string payloads are carried verbatim. The failing cell keeps its cached
/// value and stays dirty, so a later upstream change revalidates it as usual.
#[derive(Clone, Debug, Error)]
#[error("recipe failed: {message}")]
pub struct RecipeError {
	/// The stringified panic payload.
	pub message: Arc<str>,
}

impl RecipeError {
	pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
		let message = if let Some(message) = payload.downcast_ref::<&str>() {
			Arc::from(*message)
		} else if let Some(message) = payload.downcast_ref::<String>() {
			Arc::from(message.as_str())
		} else {
			Arc::from("recipe panicked")
		};
		Self { message }
	}
}

/// A failure of the property-to-cell helpers on reactive records.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
	/// The value passed in is not a reactive record, so it has no backing
	/// cells to hand out.
	#[error("value is not a reactive record")]
	NotReactive,
	/// Symbol-keyed properties pass through to the backing record and never
	/// synthesize cells.
	#[error("symbol-keyed properties are not tracked")]
	SymbolKey,
}
