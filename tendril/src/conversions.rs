//! Conversions between the primitives and [`Value`].

use meristem::value::Value;

use crate::{AsCell, DerivedCell, SourceCell};

impl From<SourceCell> for Value {
	fn from(cell: SourceCell) -> Self {
		Self::Cell(cell.as_cell().clone())
	}
}

impl From<&SourceCell> for Value {
	fn from(cell: &SourceCell) -> Self {
		Self::Cell(cell.as_cell().clone())
	}
}

impl From<DerivedCell> for Value {
	fn from(cell: DerivedCell) -> Self {
		Self::Cell(cell.as_cell().clone())
	}
}

impl From<&DerivedCell> for Value {
	fn from(cell: &DerivedCell) -> Self {
		Self::Cell(cell.as_cell().clone())
	}
}
