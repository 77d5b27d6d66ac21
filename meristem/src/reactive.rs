//! The reactive record facade: transparent property access over a plain
//! [`Record`], synthesizing one backing cell per property on first reactive
//! use.
//!
//! Untracked reads of plain properties stay zero-cost: no cell exists until
//! a property is read inside an active frame, written through, or requested
//! via [`ReactiveRecord::property_cell`].

use std::{
	collections::BTreeMap,
	fmt::{self, Debug, Formatter},
	sync::Arc,
};

use parking_lot::Mutex;

use crate::{
	error::PropertyError,
	runtime::{self, CellHandle, CellOptions, Parent, Writer},
	value::{Key, Property, Record, Value},
};

/// A transparent facade over a backing [`Record`].
///
/// Clones share identity, the backing record and the per-property cells. The
/// cell backing a property, once synthesized, is the unique cell every later
/// access observes.
#[derive(Clone)]
pub struct ReactiveRecord(Arc<ReactiveInner>);

struct ReactiveInner {
	backing: Record,
	cells: Mutex<BTreeMap<Key, CellHandle>>,
}

/// Construction options for the cells a facade synthesizes: they belong to
/// the facade, not to whatever frame happens to be running.
fn facade_cell_options() -> CellOptions {
	CellOptions {
		parent: Parent::Detached,
		..CellOptions::default()
	}
}

impl ReactiveRecord {
	/// Creates a facade over a fresh, empty record.
	#[must_use]
	pub fn new() -> Self {
		Self::over(Record::new())
	}

	/// Creates a facade over an existing backing record.
	#[must_use]
	pub fn over(backing: Record) -> Self {
		Self(Arc::new(ReactiveInner {
			backing,
			cells: Mutex::new(BTreeMap::new()),
		}))
	}

	/// The backing record, for untracked raw access.
	#[must_use]
	pub fn backing(&self) -> &Record {
		&self.0.backing
	}

	/// Whether `self` and `other` are the same facade.
	#[must_use]
	pub fn same(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}

	/// Reads property `key`.
	///
	/// Goes through the property's backing cell when one exists or when a
	/// frame is active (synthesizing it on the spot), so the read registers
	/// as a dependency. Symbol keys pass through to the backing record
	/// unmediated. Untracked reads of plain values return them raw, with no
	/// cell synthesized.
	#[must_use]
	pub fn get(&self, key: &Key) -> Value {
		if let Some(cell) = self.0.cells.lock().get(key).cloned() {
			return cell.get();
		}
		if key.is_symbol() {
			return self.raw_read(key);
		}
		if runtime::frame_active() {
			return self.ensure_cell(key).get();
		}
		match self.0.backing.property(key) {
			Some(Property::Value(Value::Cell(_) | Value::Record(_) | Value::List(_))) => {
				// Adopt a stored cell, or wrap a nested aggregate, so that
				// property observation works from here on.
				self.ensure_cell(key).get()
			}
			Some(Property::Value(value)) => value,
			Some(Property::Accessor(accessor)) => (accessor.get)(self),
			None => Value::Null,
		}
	}

	/// Writes `value` to property `key`.
	///
	/// Delegates to the property's backing cell when one exists; a cell
	/// value synthesizes a forwarding source cell; otherwise this is a plain
	/// record write with no tracking.
	pub fn set(&self, key: &Key, value: Value) {
		if let Some(cell) = self.0.cells.lock().get(key).cloned() {
			cell.set(value);
			return;
		}
		if key.is_symbol() {
			self.0.backing.set(key.clone(), value);
			return;
		}
		if value.as_cell().is_some() {
			let cell = runtime::source(value, &facade_cell_options());
			self.publish(key, cell);
			return;
		}
		match self.0.backing.property(key) {
			Some(Property::Value(Value::Cell(stored))) => {
				let cell = self.publish(key, stored);
				cell.set(value);
			}
			Some(Property::Accessor(_)) => {
				self.ensure_cell(key).set(value);
			}
			_ => self.0.backing.set(key.clone(), value),
		}
	}

	/// The stable cell backing property `key`, synthesizing it if absent.
	///
	/// Every call for the same key returns the same cell for the lifetime of
	/// the facade, enabling interop between property access and cell-based
	/// subscription.
	///
	/// # Errors
	///
	/// [`PropertyError::SymbolKey`] for symbol keys, which are never tracked.
	pub fn property_cell(&self, key: &Key) -> Result<CellHandle, PropertyError> {
		if key.is_symbol() {
			return Err(PropertyError::SymbolKey);
		}
		Ok(self.ensure_cell(key))
	}

	/// The keys currently present on the backing record.
	#[must_use]
	pub fn keys(&self) -> Vec<Key> {
		self.0.backing.keys()
	}

	fn raw_read(&self, key: &Key) -> Value {
		match self.0.backing.property(key) {
			Some(Property::Value(value)) => value,
			Some(Property::Accessor(accessor)) => (accessor.get)(self),
			None => Value::Null,
		}
	}

	/// Synthesizes the backing cell for `key`.
	///
	/// A stored cell value is adopted as-is. An accessor property becomes a
	/// derived cell whose recipe runs the getter (and whose writer runs the
	/// setter) bound to this facade. Anything else becomes a source cell
	/// initialized from the current backing value.
	fn ensure_cell(&self, key: &Key) -> CellHandle {
		if let Some(cell) = self.0.cells.lock().get(key).cloned() {
			return cell;
		}
		let cell = match self.0.backing.property(key) {
			Some(Property::Value(Value::Cell(stored))) => stored,
			Some(Property::Accessor(accessor)) => {
				let recipe = {
					let facade = self.clone();
					let getter = Arc::clone(&accessor.get);
					move || getter(&facade)
				};
				let writer = accessor.set.as_ref().map(|setter| {
					let facade = self.clone();
					let setter = Arc::clone(setter);
					let writer: Writer =
						Arc::new(Mutex::new(move |value| setter(&facade, value)));
					writer
				});
				runtime::derived_raw(
					Arc::new(Mutex::new(recipe)),
					writer,
					&facade_cell_options(),
				)
			}
			Some(Property::Value(value)) => runtime::source(value, &facade_cell_options()),
			None => runtime::source(Value::Null, &facade_cell_options()),
		};
		self.publish(key, cell)
	}

	/// Caches `cell` for `key` unless another caller won the race, and
	/// returns the unique winner.
	fn publish(&self, key: &Key, cell: CellHandle) -> CellHandle {
		let mut cells = self.0.cells.lock();
		match cells.get(key) {
			Some(existing) => existing.clone(),
			None => {
				cells.insert(key.clone(), cell.clone());
				cell
			}
		}
	}
}

impl Default for ReactiveRecord {
	fn default() -> Self {
		Self::new()
	}
}

impl Debug for ReactiveRecord {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("ReactiveRecord").field(&self.0.backing).finish()
	}
}

/// Whether `value` is a reactive record facade.
#[must_use]
pub fn is_reactive(value: &Value) -> bool {
	matches!(value, Value::Reactive(_))
}

/// The stable cell backing property `key` of a reactive record value.
///
/// # Errors
///
/// [`PropertyError::NotReactive`] if `value` was never made reactive,
/// [`PropertyError::SymbolKey`] for symbol keys.
pub fn property_cell(value: &Value, key: &Key) -> Result<CellHandle, PropertyError> {
	value
		.as_reactive()
		.ok_or(PropertyError::NotReactive)?
		.property_cell(key)
}

/// Wraps plain record values into reactive record facades, so property
/// observation works on stored objects. Everything else is stored as-is.
pub(crate) fn auto_wrap(value: Value, shallow: bool) -> Value {
	match value {
		Value::Record(record) if !shallow => Value::Reactive(ReactiveRecord::over(record)),
		other => other,
	}
}
