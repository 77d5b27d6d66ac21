//! Graph state: cell and subscription records plus the pure bookkeeping that
//! never calls back into user code.
//!
//! Everything here runs under the runtime's critical section with the state
//! borrow held. The invocation of recipes and observer hooks lives one layer
//! up, in [`runtime`](`crate::runtime`), which releases the borrow first.

use std::{
	collections::{BTreeMap, VecDeque},
	sync::{Arc, Weak},
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
	observer::Observer,
	runtime::{CellHandle, CellId, HandleCore, SubId},
	value::Value,
};

pub(crate) type Recipe = Arc<Mutex<dyn FnMut() -> Value + Send>>;
pub(crate) type Writer = Arc<Mutex<dyn FnMut(Value) + Send>>;
pub(crate) type Cleanup = Arc<Mutex<dyn FnMut(Value) + Send>>;
pub(crate) type SharedObserver = Arc<Mutex<dyn Observer>>;

/// Bit positions of the per-cell state word.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CellFlags(u8);

impl CellFlags {
	pub(crate) const ENABLED: Self = Self(1);
	pub(crate) const DISPOSED: Self = Self(1 << 1);
	pub(crate) const DIRTY: Self = Self(1 << 2);
	pub(crate) const QUEUED: Self = Self(1 << 3);
	pub(crate) const SHALLOW: Self = Self(1 << 4);

	pub(crate) fn has(self, flag: Self) -> bool {
		self.0 & flag.0 != 0
	}

	pub(crate) fn insert(&mut self, flag: Self) {
		self.0 |= flag.0;
	}

	pub(crate) fn remove(&mut self, flag: Self) {
		self.0 &= !flag.0;
	}
}

impl std::fmt::Debug for CellFlags {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let mut list = f.debug_list();
		for (flag, name) in [
			(Self::ENABLED, "Enabled"),
			(Self::DISPOSED, "Disposed"),
			(Self::DIRTY, "Dirty"),
			(Self::QUEUED, "Queued"),
			(Self::SHALLOW, "Shallow"),
		] {
			if self.has(flag) {
				list.entry(&name);
			}
		}
		list.finish()
	}
}

/// The discriminant that replaces a class hierarchy: one record shape, four
/// behaviors.
pub(crate) enum CellKind {
	Source {
		/// The inbound subscription while this cell tracks another cell.
		forward: Option<SubId>,
	},
	Derived {
		recipe: Recipe,
		writer: Option<Writer>,
	},
	Effect {
		recipe: Recipe,
		cleanup: Option<Cleanup>,
	},
	Scope,
}

impl CellKind {
	pub(crate) fn is_effect(&self) -> bool {
		matches!(self, Self::Effect { .. })
	}
}

/// What a subscription delivers to.
pub(crate) enum Sink {
	/// A derived cell or effect consuming this source as a dependency.
	Cell(CellId),
	/// A source cell in forwarding mode adopting every produced value.
	Forward(CellId),
	/// An external observer.
	External(SharedObserver),
}

/// One edge of the graph.
///
/// The two indices mirror the positions this record occupies in its
/// endpoints' lists; pop-and-swap removal keeps them exact.
pub(crate) struct SubRecord {
	/// Keeps the observed cell's record alive while the edge exists.
	pub(crate) source: CellHandle,
	pub(crate) sink: Sink,
	/// Position in the source's downstream list, [`None`] while disabled.
	pub(crate) source_index: Option<usize>,
	/// Position in the consumer's upstream list, cell sinks only.
	pub(crate) consumer_index: Option<usize>,
	/// The source's value when this edge was last validated.
	pub(crate) snapshot: Option<Value>,
	pub(crate) enabled: bool,
	pub(crate) disposed: bool,
}

/// One node of the graph; also one node of the ownership tree.
pub(crate) struct CellRecord {
	pub(crate) kind: CellKind,
	pub(crate) flags: CellFlags,
	/// Current (source) or cached (derived) value. [`None`] marks a derived
	/// cell that never computed.
	pub(crate) value: Option<Value>,
	pub(crate) downstream: SmallVec<[SubId; 2]>,
	/// Ordered dependencies of a derived cell or effect, in recipe read order.
	pub(crate) upstream: SmallVec<[SubId; 2]>,
	pub(crate) parent: Option<CellId>,
	pub(crate) child_index: usize,
	/// Owned children; [`None`] once disposed.
	pub(crate) children: Option<Vec<CellHandle>>,
	/// Unordered observations of a plain scope.
	pub(crate) observed: BTreeMap<CellId, CellHandle>,
	/// The canonical external handle, if one is currently live.
	pub(crate) handle: Weak<HandleCore>,
}

impl CellRecord {
	pub(crate) fn new(kind: CellKind, value: Option<Value>, flags: CellFlags) -> Self {
		Self {
			kind,
			flags,
			value,
			downstream: SmallVec::new(),
			upstream: SmallVec::new(),
			parent: None,
			child_index: 0,
			children: Some(Vec::new()),
			observed: BTreeMap::new(),
			handle: Weak::new(),
		}
	}

	pub(crate) fn disposed(&self) -> bool {
		self.flags.has(CellFlags::DISPOSED)
	}
}

/// The active dependency-collection target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
	pub(crate) id: CellId,
	/// Index into the frame cell's upstream list for subscription reuse.
	pub(crate) cursor: usize,
}

pub(crate) struct Engine {
	pub(crate) cells: BTreeMap<CellId, CellRecord>,
	pub(crate) subs: BTreeMap<SubId, SubRecord>,
	/// [`None`] entries are detached frames that record nothing.
	pub(crate) context_stack: Vec<Option<Frame>>,
	pub(crate) settle_queue: VecDeque<CellId>,
	pub(crate) draining: bool,
}

impl Engine {
	pub(crate) const fn new() -> Self {
		Self {
			cells: BTreeMap::new(),
			subs: BTreeMap::new(),
			context_stack: Vec::new(),
			settle_queue: VecDeque::new(),
			draining: false,
		}
	}

	/// The canonical handle for `id`, minting a fresh one if none is live.
	pub(crate) fn mint_handle(&mut self, id: CellId) -> Option<CellHandle> {
		let record = self.cells.get_mut(&id)?;
		if let Some(core) = record.handle.upgrade() {
			return Some(CellHandle(core));
		}
		let core = Arc::new(HandleCore { id });
		record.handle = Arc::downgrade(&core);
		Some(CellHandle(core))
	}

	/// Appends `child` to `parent`'s child list and wires the back-links.
	pub(crate) fn attach_child(&mut self, parent: CellId, child: CellHandle) {
		let child_id = child.id();
		let Some(parent_record) = self.cells.get_mut(&parent) else {
			return;
		};
		let Some(children) = &mut parent_record.children else {
			return;
		};
		let index = children.len();
		children.push(child);
		let record = self
			.cells
			.get_mut(&child_id)
			.expect("child record was just created");
		record.parent = Some(parent);
		record.child_index = index;
	}

	/// Pop-and-swap removes `id` from its parent's child list, updating the
	/// swapped sibling's recorded index.
	pub(crate) fn detach_from_parent(&mut self, id: CellId) {
		let Some(record) = self.cells.get(&id) else {
			return;
		};
		let Some(parent) = record.parent else {
			return;
		};
		let index = record.child_index;
		let mut moved_child = None;
		if let Some(parent_record) = self.cells.get_mut(&parent) {
			if let Some(children) = &mut parent_record.children {
				if children.get(index).is_some_and(|child| child.id() == id) {
					children.swap_remove(index);
					moved_child = children.get(index).map(CellHandle::id);
				}
			}
		}
		if let Some(moved) = moved_child {
			self.cells
				.get_mut(&moved)
				.expect("children keep their records alive")
				.child_index = index;
		}
		if let Some(record) = self.cells.get_mut(&id) {
			record.parent = None;
		}
	}

	/// Pop-and-swap removes the subscription from its source's downstream
	/// list, updating the swapped neighbor's recorded index.
	pub(crate) fn unlink_from_source(&mut self, sub: SubId) {
		let Some(record) = self.subs.get_mut(&sub) else {
			return;
		};
		let Some(index) = record.source_index.take() else {
			return;
		};
		let source = record.source.id();
		let Some(source_record) = self.cells.get_mut(&source) else {
			return;
		};
		if source_record
			.downstream
			.get(index)
			.is_some_and(|&entry| entry == sub)
		{
			source_record.downstream.swap_remove(index);
			if let Some(&moved) = source_record.downstream.get(index) {
				self.subs
					.get_mut(&moved)
					.expect("listed subscriptions have records")
					.source_index = Some(index);
			}
		}
	}

	/// Pop-and-swap removes the subscription from its consumer's upstream
	/// list, updating the swapped neighbor's recorded index.
	pub(crate) fn unlink_from_consumer(&mut self, sub: SubId) {
		let Some(record) = self.subs.get_mut(&sub) else {
			return;
		};
		let Some(index) = record.consumer_index.take() else {
			return;
		};
		let Sink::Cell(consumer) = record.sink else {
			return;
		};
		let Some(consumer_record) = self.cells.get_mut(&consumer) else {
			return;
		};
		if consumer_record
			.upstream
			.get(index)
			.is_some_and(|&entry| entry == sub)
		{
			consumer_record.upstream.swap_remove(index);
			if let Some(&moved) = consumer_record.upstream.get(index) {
				self.subs
					.get_mut(&moved)
					.expect("listed subscriptions have records")
					.consumer_index = Some(index);
			}
		}
	}

	/// Fully removes a subscription from the store and both endpoint lists.
	pub(crate) fn drop_sub(&mut self, sub: SubId) {
		self.unlink_from_source(sub);
		self.unlink_from_consumer(sub);
		self.subs.remove(&sub);
	}

	/// Drops every upstream subscription of `id` from `from` onwards.
	///
	/// This is the tail truncation after a recompute whose dependency shape
	/// shrank, and with `from == 0` the full upstream teardown on disposal.
	pub(crate) fn truncate_upstream(&mut self, id: CellId, from: usize) {
		let Some(record) = self.cells.get_mut(&id) else {
			return;
		};
		if from >= record.upstream.len() {
			return;
		}
		let tail: Vec<SubId> = record.upstream.drain(from..).collect();
		tracing::trace!(?id, dropped = tail.len(), "truncating stale dependencies");
		for sub in tail {
			self.unlink_from_source(sub);
			self.subs.remove(&sub);
		}
	}

	/// Creates a dependency edge from the current frame onto `source` and
	/// appends it to both endpoint lists.
	pub(crate) fn link_dependency(&mut self, consumer: CellId, source: CellId, sub: SubId) {
		let Some(source_handle) = self.mint_handle(source) else {
			return;
		};
		let snapshot = self.cells.get(&source).and_then(|r| r.value.clone());
		let source_record = self
			.cells
			.get_mut(&source)
			.expect("handle was just minted");
		let source_index = source_record.downstream.len();
		source_record.downstream.push(sub);
		let consumer_record = self
			.cells
			.get_mut(&consumer)
			.expect("the frame cell is alive");
		let consumer_index = consumer_record.upstream.len();
		consumer_record.upstream.push(sub);
		self.subs.insert(
			sub,
			SubRecord {
				source: source_handle,
				sink: Sink::Cell(consumer),
				source_index: Some(source_index),
				consumer_index: Some(consumer_index),
				snapshot,
				enabled: true,
				disposed: false,
			},
		);
	}

	/// Records a read of `source` in the active frame, if any.
	///
	/// Plain scopes collect into their unordered observation set. Derived
	/// cells and effects run the cursor protocol: an upstream subscription
	/// already sitting at the cursor is reused (with a fresh snapshot), a
	/// mismatch truncates the tail and appends a fresh edge.
	pub(crate) fn observe_current(&mut self, source: CellId, next_sub: impl FnOnce() -> SubId) {
		let Some(Some(frame)) = self.context_stack.last().copied() else {
			return;
		};
		if frame.id == source {
			return;
		}
		let Some(consumer_record) = self.cells.get(&frame.id) else {
			return;
		};
		match consumer_record.kind {
			CellKind::Scope => {
				if let Some(handle) = self.mint_handle(source) {
					if let Some(record) = self.cells.get_mut(&frame.id) {
						record.observed.insert(source, handle);
					}
				}
			}
			CellKind::Derived { .. } | CellKind::Effect { .. } => {
				let reusable = consumer_record
					.upstream
					.get(frame.cursor)
					.copied()
					.filter(|sub| {
						self.subs
							.get(sub)
							.is_some_and(|record| record.source.id() == source)
					});
				if let Some(sub) = reusable {
					let snapshot = self.cells.get(&source).and_then(|r| r.value.clone());
					if let Some(record) = self.subs.get_mut(&sub) {
						record.snapshot = snapshot;
					}
				} else {
					self.truncate_upstream(frame.id, frame.cursor);
					self.link_dependency(frame.id, source, next_sub());
				}
				if let Some(Some(frame)) = self.context_stack.last_mut() {
					frame.cursor += 1;
				}
			}
			CellKind::Source { .. } => {}
		}
	}

	/// Whether `id` is currently executing somewhere on the frame stack.
	pub(crate) fn on_stack(&self, id: CellId) -> bool {
		self.context_stack
			.iter()
			.flatten()
			.any(|frame| frame.id == id)
	}
}
