//! The cell graph runtime: handles, construction options and every operation
//! that can run user code.
//!
//! # Logic
//!
//! All graph state lives in one process-global critical section. Public entry
//! points lock it reentrantly, so recipes and observers **may** call back into
//! the runtime from the same thread. The state borrow is **never** held while
//! user code runs; every such call site releases it first and restores the
//! frame stack on unwind.
//!
//! Writes propagate dirtiness depth-first and synchronously. Recomputation of
//! queued cells is deferred until [`settle`] drains the queue in FIFO order;
//! reads are glitch-free at any point because they validate top-down first.

use std::{
	cell::RefCell,
	fmt::{self, Debug, Formatter},
	num::NonZeroU64,
	panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use unwind_safe::try_eval;

use crate::{
	cancel::CancellationToken,
	error::RecipeError,
	observer::Observer,
	reactive::auto_wrap,
	value::Value,
};

mod engine;

use engine::{
	CellFlags, CellKind, CellRecord, Engine, Frame, Recipe, SharedObserver, Sink, SubRecord,
};

pub(crate) use engine::{Cleanup, Writer};

/// Process-unique id of a cell. Monotonic, never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(NonZeroU64);

impl Debug for CellId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("CellId").field(&self.0).finish()
	}
}

/// Process-unique id of a subscription. Monotonic, never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SubId(NonZeroU64);

impl Debug for SubId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("SubId").field(&self.0).finish()
	}
}

pub(crate) struct HandleCore {
	pub(crate) id: CellId,
}

impl Drop for HandleCore {
	fn drop(&mut self) {
		// Only the small release list is touched here: this drop may run
		// while the engine state is borrowed.
		RUNTIME.released.lock().push(self.id);
	}
}

/// A reference-counted handle to a cell record.
///
/// Clones share identity. The record outlives the last handle for as long as
/// the graph itself references it (as a dependency, a forwarded upstream or a
/// scope child); once fully unreferenced it is disposed and purged during the
/// next [`settle`].
#[derive(Clone)]
pub struct CellHandle(pub(crate) Arc<HandleCore>);

impl PartialEq for CellHandle {
	fn eq(&self, other: &Self) -> bool {
		self.id() == other.id()
	}
}

impl Eq for CellHandle {}

impl Debug for CellHandle {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("CellHandle").field(&self.id()).finish()
	}
}

struct Runtime {
	counter: AtomicU64,
	critical: ReentrantMutex<RefCell<Engine>>,
	/// Ids whose last handle dropped, awaiting purge.
	released: Mutex<Vec<CellId>>,
}

static RUNTIME: Runtime = Runtime {
	counter: AtomicU64::new(0),
	critical: ReentrantMutex::new(RefCell::new(Engine::new())),
	released: Mutex::new(Vec::new()),
};

type Guard<'a> = ReentrantMutexGuard<'a, RefCell<Engine>>;

fn next_id() -> NonZeroU64 {
	(RUNTIME.counter.fetch_add(1, Ordering::SeqCst) + 1)
		.try_into()
		.expect("infallible within reasonable time")
}

fn next_sub_id() -> SubId {
	SubId(next_id())
}

/// Runs `f` with a detached frame on the stack, so reads inside it record no
/// dependencies. Restores the stack on unwind.
fn detached<T>(lock: &Guard<'_>, f: impl FnOnce() -> T) -> T {
	(*lock).borrow_mut().context_stack.push(None);
	try_eval(f).finally(|()| {
		assert_eq!((*lock).borrow_mut().context_stack.pop(), Some(None));
	})
}

/// Runs `f` exempted from any outer dependency recording.
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
	let lock = RUNTIME.critical.lock();
	detached(&lock, f)
}

/// Whether a recording frame is currently active on this thread.
pub(crate) fn frame_active() -> bool {
	let lock = RUNTIME.critical.lock();
	let engine = (*lock).borrow();
	matches!(engine.context_stack.last(), Some(Some(_)))
}

/// Where a freshly constructed primitive attaches in the ownership tree.
#[derive(Clone, Debug, Default)]
pub enum Parent {
	/// Attach to the cell whose recipe is currently running, if any.
	#[default]
	Ambient,
	/// Attach nowhere; the caller owns the primitive outright.
	Detached,
	/// Attach to this scope (or derived cell, or effect).
	Explicit(CellHandle),
}

/// Construction options shared by every primitive.
#[derive(Clone, Debug, Default)]
pub struct CellOptions {
	/// Skip the reactive-record wrap of plain record values.
	pub shallow: bool,
	/// Dispose the primitive when this token aborts. An already-aborted
	/// token yields a born-disposed primitive.
	pub cancellation: Option<CancellationToken>,
	/// Ownership attachment.
	pub parent: Parent,
}

fn resolve_parent(engine: &mut Engine, parent: &Parent) -> Option<CellHandle> {
	match parent {
		Parent::Detached => None,
		Parent::Ambient => {
			let frame = engine.context_stack.last().copied().flatten()?;
			engine.mint_handle(frame.id)
		}
		Parent::Explicit(scope) => {
			let record = engine
				.cells
				.get(&scope.id())
				.filter(|record| !record.disposed() && record.children.is_some());
			assert!(
				record.is_some(),
				"Tried to attach to a disposed scope."
			);
			assert!(
				!matches!(record.expect("just checked").kind, CellKind::Source { .. }),
				"Tried to use a source cell as a parent scope."
			);
			Some(scope.clone())
		}
	}
}

fn construct(kind: CellKind, value: Option<Value>, mut flags: CellFlags, options: &CellOptions) -> CellHandle {
	let lock = RUNTIME.critical.lock();
	process_releases(&lock);
	if options.shallow {
		flags.insert(CellFlags::SHALLOW);
	}
	let id = CellId(next_id());
	let handle = {
		let mut engine = (*lock).borrow_mut();
		let parent = resolve_parent(&mut engine, &options.parent);
		engine.cells.insert(id, CellRecord::new(kind, value, flags));
		let handle = engine
			.mint_handle(id)
			.expect("the record was just inserted");
		if let Some(parent) = parent {
			engine.attach_child(parent.id(), handle.clone());
		}
		handle
	};
	if let Some(token) = &options.cancellation {
		if token.aborted() {
			dispose_id(&lock, id);
		} else {
			let weak = Arc::downgrade(&handle.0);
			token.on_abort(move || {
				if let Some(core) = Weak::upgrade(&weak) {
					CellHandle(core).dispose();
				}
			});
		}
	}
	handle
}

/// Creates a source cell holding `initial`.
///
/// A plain record initial value is wrapped into a reactive record unless
/// `options.shallow` is set; a cell initial value starts the new cell in
/// forwarding mode.
pub fn source(initial: Value, options: &CellOptions) -> CellHandle {
	let forward_to = initial.as_cell().cloned();
	let stored = match &forward_to {
		Some(_) => Value::Null,
		None => auto_wrap(initial, options.shallow),
	};
	let handle = construct(
		CellKind::Source { forward: None },
		Some(stored),
		{
			let mut flags = CellFlags::default();
			flags.insert(CellFlags::ENABLED);
			flags
		},
		options,
	);
	if let Some(upstream) = forward_to {
		let lock = RUNTIME.critical.lock();
		if !handle.is_disposed() {
			set_forward(&lock, handle.id(), upstream);
		}
	}
	handle
}

/// Creates a derived cell over `recipe`, lazily computed on first read.
pub fn derived(
	recipe: impl FnMut() -> Value + Send + 'static,
	options: &CellOptions,
) -> CellHandle {
	derived_raw(Arc::new(Mutex::new(recipe)), None, options)
}

/// Creates a writable derived cell: `recipe` computes, `writer` accepts
/// incoming writes.
pub fn derived_with_writer(
	recipe: impl FnMut() -> Value + Send + 'static,
	writer: impl FnMut(Value) + Send + 'static,
	options: &CellOptions,
) -> CellHandle {
	derived_raw(
		Arc::new(Mutex::new(recipe)),
		Some(Arc::new(Mutex::new(writer))),
		options,
	)
}

pub(crate) fn derived_raw(
	recipe: Recipe,
	writer: Option<Writer>,
	options: &CellOptions,
) -> CellHandle {
	construct(
		CellKind::Derived { recipe, writer },
		None,
		{
			let mut flags = CellFlags::default();
			flags.insert(CellFlags::ENABLED);
			flags.insert(CellFlags::DIRTY);
			flags
		},
		options,
	)
}

/// Creates an effect and runs it once, synchronously.
pub fn effect(recipe: impl FnMut() -> Value + Send + 'static, options: &CellOptions) -> CellHandle {
	effect_raw(Arc::new(Mutex::new(recipe)), None, options)
}

/// Creates an effect whose `cleanup` consumes the previous run's output
/// before every re-run and on disposal.
pub fn effect_with_cleanup(
	recipe: impl FnMut() -> Value + Send + 'static,
	cleanup: impl FnMut(Value) + Send + 'static,
	options: &CellOptions,
) -> CellHandle {
	effect_raw(
		Arc::new(Mutex::new(recipe)),
		Some(Arc::new(Mutex::new(cleanup))),
		options,
	)
}

fn effect_raw(recipe: Recipe, cleanup: Option<Cleanup>, options: &CellOptions) -> CellHandle {
	let handle = construct(
		CellKind::Effect { recipe, cleanup },
		None,
		{
			let mut flags = CellFlags::default();
			flags.insert(CellFlags::ENABLED);
			flags
		},
		options,
	);
	if !handle.is_disposed() {
		let lock = RUNTIME.critical.lock();
		recompute(&lock, handle.id());
	}
	handle
}

/// Creates a plain lifetime scope.
pub fn scope(options: &CellOptions) -> CellHandle {
	construct(
		CellKind::Scope,
		None,
		{
			let mut flags = CellFlags::default();
			flags.insert(CellFlags::ENABLED);
			flags
		},
		options,
	)
}

impl CellHandle {
	/// The id of the underlying record.
	#[must_use]
	pub fn id(&self) -> CellId {
		self.0.id
	}

	/// Whether two handles refer to the same cell.
	#[must_use]
	pub fn same(&self, other: &Self) -> bool {
		self.id() == other.id()
	}

	/// Whether the cell has been disposed.
	#[must_use]
	pub fn is_disposed(&self) -> bool {
		let lock = RUNTIME.critical.lock();
		let engine = (*lock).borrow();
		engine
			.cells
			.get(&self.id())
			.is_none_or_disposed()
	}

	/// Reads the cell's current value, registering it as a dependency of the
	/// active frame.
	///
	/// A dirty derived cell validates (and possibly recomputes) first, so the
	/// returned value is always consistent with the current source values.
	/// Reading a disposed cell returns the last cached value and registers
	/// nothing.
	///
	/// # Panics
	///
	/// Panics when called on an effect or plain scope, when the cell's own
	/// recipe is currently running, or (forwarded) when the recipe fails.
	#[must_use]
	pub fn get(&self) -> Value {
		let lock = RUNTIME.critical.lock();
		self.read(&lock, true)
	}

	/// Registers this cell as a dependency of the active frame without
	/// cloning the value out.
	///
	/// # Panics
	///
	/// As for [`get`](`Self::get`).
	pub fn touch(&self) {
		let lock = RUNTIME.critical.lock();
		let _ = self.read(&lock, false);
	}

	fn read(&self, lock: &Guard<'_>, clone_out: bool) -> Value {
		let id = self.id();
		let kind = {
			let engine = (*lock).borrow();
			let Some(record) = engine.cells.get(&id) else {
				return Value::Null;
			};
			match record.kind {
				CellKind::Source { .. } => ReadKind::Source,
				CellKind::Derived { .. } => ReadKind::Derived,
				CellKind::Effect { .. } | CellKind::Scope => {
					panic!("Tried to read a cell that holds no observable value.")
				}
			}
		};
		if matches!(kind, ReadKind::Derived) {
			let disposed = {
				let engine = (*lock).borrow();
				engine.cells.get(&id).is_none_or_disposed()
			};
			if !disposed {
				validate(lock, id);
			}
		}
		let mut engine = (*lock).borrow_mut();
		let Some(record) = engine.cells.get(&id) else {
			return Value::Null;
		};
		let value = if clone_out {
			record.value.clone().unwrap_or(Value::Null)
		} else {
			Value::Null
		};
		if !record.disposed() {
			engine.observe_current(id, next_sub_id);
		}
		value
	}

	/// Writes `value` to a source cell, or routes it through a derived
	/// cell's writer.
	///
	/// Writing a cell value switches a source cell into forwarding mode;
	/// writing anything else severs an active forward. A write that is
	/// [identical](`Value::identical`) to the stored value notifies nobody.
	/// Writes to disposed cells are silently ignored.
	///
	/// Always returns `true`, so that disposed targets stay indistinguishable
	/// from accepted writes.
	///
	/// # Panics
	///
	/// Panics when the cell is a derived cell without a writer, an effect or
	/// a plain scope.
	pub fn set(&self, value: Value) -> bool {
		let lock = RUNTIME.critical.lock();
		let id = self.id();
		enum Route {
			Source,
			Writer(Writer),
			Ignore,
		}
		let route = {
			let engine = (*lock).borrow();
			let Some(record) = engine.cells.get(&id) else {
				return true;
			};
			if record.disposed() {
				Route::Ignore
			} else {
				match &record.kind {
					CellKind::Source { .. } => Route::Source,
					CellKind::Derived {
						writer: Some(writer),
						..
					} => Route::Writer(writer.clone()),
					CellKind::Derived { writer: None, .. } => {
						panic!("Tried to set a derived cell that has no writer.")
					}
					CellKind::Effect { .. } | CellKind::Scope => {
						panic!("Tried to write a cell that holds no observable value.")
					}
				}
			}
		};
		match route {
			Route::Ignore => true,
			Route::Source => set_source(&lock, id, value),
			Route::Writer(writer) => {
				detached(&lock, || (&mut *writer.lock())(value));
				true
			}
		}
	}

	/// Functionally updates a source cell: `f` maps the current value to the
	/// next one, with the usual same-value-zero dedup.
	pub fn update(&self, f: impl FnOnce(Value) -> Value) -> bool {
		let lock = RUNTIME.critical.lock();
		let id = self.id();
		let current = {
			let engine = (*lock).borrow();
			let Some(record) = engine.cells.get(&id) else {
				return true;
			};
			assert!(
				matches!(record.kind, CellKind::Source { .. }),
				"Tried to update a cell that is not a source cell."
			);
			if record.disposed() {
				return true;
			}
			record.value.clone().unwrap_or(Value::Null)
		};
		let next = detached(&lock, || f(current));
		self.set(next)
	}

	/// Subscribes `observer` to this cell.
	///
	/// Subscribing to a disposed cell immediately invokes `complete` and
	/// returns the closed subscription. Subscribing to a derived cell that
	/// never computed runs a protected first evaluation whose failure is
	/// swallowed: the subscriber asked for future values, not current ones.
	///
	/// # Panics
	///
	/// Panics when called on an effect or plain scope.
	pub fn subscribe(&self, observer: impl Observer + 'static) -> SubscriptionHandle {
		let lock = RUNTIME.critical.lock();
		let id = self.id();
		let shared: SharedObserver = Arc::new(Mutex::new(observer));
		let state = {
			let engine = (*lock).borrow();
			match engine.cells.get(&id) {
				None => SubscribeState::Disposed,
				Some(record) if record.disposed() => SubscribeState::Disposed,
				Some(record) => match record.kind {
					CellKind::Source { .. } => SubscribeState::Ready,
					CellKind::Derived { .. } => {
						if record.value.is_none() {
							SubscribeState::NeverComputed
						} else {
							SubscribeState::Ready
						}
					}
					CellKind::Effect { .. } | CellKind::Scope => {
						panic!("Tried to subscribe to a cell that is not observable.")
					}
				},
			}
		};
		match state {
			SubscribeState::Disposed => {
				detached(&lock, || shared.lock().complete());
				return SubscriptionHandle::closed();
			}
			SubscribeState::NeverComputed => {
				let _ = catch_unwind(AssertUnwindSafe(|| validate(&lock, id)));
			}
			SubscribeState::Ready => {}
		}
		let sub = next_sub_id();
		{
			let mut engine = (*lock).borrow_mut();
			let Some(source) = engine.mint_handle(id) else {
				return SubscriptionHandle::closed();
			};
			let snapshot = engine.cells.get(&id).and_then(|r| r.value.clone());
			let record = engine
				.cells
				.get_mut(&id)
				.expect("the handle was just minted");
			let source_index = record.downstream.len();
			record.downstream.push(sub);
			engine.subs.insert(
				sub,
				SubRecord {
					source,
					sink: Sink::External(shared),
					source_index: Some(source_index),
					consumer_index: None,
					snapshot,
					enabled: true,
					disposed: false,
				},
			);
		}
		SubscriptionHandle { id: Some(sub) }
	}

	/// Disposes the cell: children first, then upstream edges, then the
	/// downstream completion broadcast. Idempotent.
	pub fn dispose(&self) {
		let lock = RUNTIME.critical.lock();
		dispose_id(&lock, self.id());
	}

	/// Re-enables a disabled effect. The next dependency change re-runs it.
	pub fn enable(&self) {
		let lock = RUNTIME.critical.lock();
		let mut engine = (*lock).borrow_mut();
		if let Some(record) = engine.cells.get_mut(&self.id()) {
			if !record.disposed() {
				record.flags.insert(CellFlags::ENABLED);
			}
		}
	}

	/// Disables an effect: dependency changes still mark it dirty, but it
	/// does not run until re-enabled.
	pub fn disable(&self) {
		let lock = RUNTIME.critical.lock();
		let mut engine = (*lock).borrow_mut();
		if let Some(record) = engine.cells.get_mut(&self.id()) {
			record.flags.remove(CellFlags::ENABLED);
		}
	}

	/// Whether the cell is currently enabled.
	#[must_use]
	pub fn is_enabled(&self) -> bool {
		let lock = RUNTIME.critical.lock();
		let engine = (*lock).borrow();
		engine
			.cells
			.get(&self.id())
			.is_some_and(|record| record.flags.has(CellFlags::ENABLED) && !record.disposed())
	}

	/// Runs an effect immediately, regardless of dirtiness.
	///
	/// # Panics
	///
	/// Panics when called on anything but an effect, or (forwarded) when the
	/// recipe fails.
	pub fn run(&self) {
		let lock = RUNTIME.critical.lock();
		let id = self.id();
		{
			let engine = (*lock).borrow();
			let Some(record) = engine.cells.get(&id) else {
				return;
			};
			assert!(
				record.kind.is_effect(),
				"Tried to run a cell that is not an effect."
			);
			if record.disposed() {
				return;
			}
		}
		recompute(&lock, id);
	}

	/// Records `source` in a plain scope's observation set.
	///
	/// # Panics
	///
	/// Panics when called on anything but a plain scope.
	pub fn observe(&self, source: &CellHandle) {
		let lock = RUNTIME.critical.lock();
		let mut engine = (*lock).borrow_mut();
		let Some(record) = engine.cells.get_mut(&self.id()) else {
			return;
		};
		assert!(
			matches!(record.kind, CellKind::Scope),
			"Tried to record an observation on a cell that is not a plain scope."
		);
		if !record.disposed() {
			record.observed.insert(source.id(), source.clone());
		}
	}

	/// The cells this scope, derived cell or effect currently observes.
	///
	/// The iteration order is unspecified for plain scopes and matches the
	/// recipe's read order for derived cells and effects. The returned
	/// handles are a snapshot: cells observed later are not included.
	#[must_use]
	pub fn observed(&self) -> Vec<CellHandle> {
		let lock = RUNTIME.critical.lock();
		let engine = (*lock).borrow();
		let Some(record) = engine.cells.get(&self.id()) else {
			return Vec::new();
		};
		match record.kind {
			CellKind::Scope => record.observed.values().cloned().collect(),
			CellKind::Derived { .. } | CellKind::Effect { .. } => record
				.upstream
				.iter()
				.filter_map(|sub| engine.subs.get(sub))
				.map(|sub| sub.source.clone())
				.collect(),
			CellKind::Source { .. } => Vec::new(),
		}
	}

	/// The scope's direct children, as a snapshot.
	#[must_use]
	pub fn children(&self) -> Vec<CellHandle> {
		let lock = RUNTIME.critical.lock();
		let engine = (*lock).borrow();
		engine
			.cells
			.get(&self.id())
			.and_then(|record| record.children.clone())
			.unwrap_or_default()
	}

	/// Runs `f` with this plain scope installed as the active frame, so cell
	/// reads inside it land in the observation set.
	///
	/// # Panics
	///
	/// Panics when called on anything but a live plain scope.
	pub fn capture<T>(&self, f: impl FnOnce() -> T) -> T {
		let lock = RUNTIME.critical.lock();
		let id = self.id();
		{
			let engine = (*lock).borrow();
			let record = engine.cells.get(&id);
			assert!(
				record.is_some_and(|record| matches!(record.kind, CellKind::Scope)
					&& !record.disposed()),
				"Tried to capture into a scope that is disposed or not a plain scope."
			);
		}
		(*lock)
			.borrow_mut()
			.context_stack
			.push(Some(Frame { id, cursor: 0 }));
		try_eval(f).finally(|()| {
			let popped = (*lock).borrow_mut().context_stack.pop();
			assert!(
				matches!(popped, Some(Some(frame)) if frame.id == id),
				"unbalanced frame stack"
			);
		})
	}
}

enum ReadKind {
	Source,
	Derived,
}

enum SubscribeState {
	Disposed,
	NeverComputed,
	Ready,
}

trait IsNoneOrDisposed {
	fn is_none_or_disposed(&self) -> bool;
}

impl IsNoneOrDisposed for Option<&CellRecord> {
	fn is_none_or_disposed(&self) -> bool {
		self.map_or(true, CellRecord::disposed)
	}
}

/// A handle to an external subscription.
///
/// Dropping the handle does not unsubscribe; the edge lives until either
/// endpoint disposes or [`unsubscribe`](`Self::unsubscribe`) is called.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
	id: Option<SubId>,
}

impl SubscriptionHandle {
	/// The shared closed subscription, returned when subscribing to disposed
	/// cells.
	#[must_use]
	pub(crate) fn closed() -> Self {
		Self { id: None }
	}

	/// Whether this is the closed subscription (or was unsubscribed).
	#[must_use]
	pub fn is_closed(&self) -> bool {
		let Some(id) = self.id else {
			return true;
		};
		let lock = RUNTIME.critical.lock();
		let engine = (*lock).borrow();
		!engine.subs.contains_key(&id)
	}

	/// Severs the subscription and releases its bookkeeping. Idempotent.
	pub fn unsubscribe(&self) {
		let Some(id) = self.id else {
			return;
		};
		let lock = RUNTIME.critical.lock();
		let mut engine = (*lock).borrow_mut();
		engine.drop_sub(id);
	}

	/// Pauses delivery in O(1). The subscription stays valid and keeps its
	/// observer.
	pub fn disable(&self) {
		let Some(id) = self.id else {
			return;
		};
		let lock = RUNTIME.critical.lock();
		let mut engine = (*lock).borrow_mut();
		let enabled = engine.subs.get(&id).is_some_and(|sub| sub.enabled);
		if enabled {
			engine.unlink_from_source(id);
			engine
				.subs
				.get_mut(&id)
				.expect("just observed")
				.enabled = false;
		}
	}

	/// Resumes delivery in O(1).
	pub fn enable(&self) {
		let Some(id) = self.id else {
			return;
		};
		let lock = RUNTIME.critical.lock();
		let mut engine = (*lock).borrow_mut();
		let source = match engine.subs.get(&id) {
			Some(sub) if !sub.enabled && !sub.disposed => sub.source.id(),
			_ => return,
		};
		let Some(source_record) = engine.cells.get_mut(&source) else {
			return;
		};
		let index = source_record.downstream.len();
		source_record.downstream.push(id);
		let sub = engine.subs.get_mut(&id).expect("just observed");
		sub.source_index = Some(index);
		sub.enabled = true;
	}
}

/// Drains the settle queue: every queued cell validates (and recomputes if
/// actually outdated) in enqueue order. Cells queued while the drain runs are
/// handled by the same drain, FIFO.
///
/// Recipe failures during the drain are reported through the failing cell's
/// error hooks and logged, and the drain continues.
pub fn settle() {
	let lock = RUNTIME.critical.lock();
	process_releases(&lock);
	{
		let mut engine = (*lock).borrow_mut();
		if engine.draining || !engine.context_stack.is_empty() {
			return;
		}
		engine.draining = true;
	}
	let _reset = scopeguard::guard((), |()| {
		(*lock).borrow_mut().draining = false;
	});
	loop {
		let next = (*lock).borrow_mut().settle_queue.pop_front();
		let Some(id) = next else {
			break;
		};
		let runnable = {
			let mut engine = (*lock).borrow_mut();
			match engine.cells.get_mut(&id) {
				None => false,
				Some(record) => {
					if record.disposed() || !record.flags.has(CellFlags::QUEUED) {
						false
					} else if record.kind.is_effect() && !record.flags.has(CellFlags::ENABLED) {
						// Suppressed while disabled: stays dirty, loses its slot.
						record.flags.remove(CellFlags::QUEUED);
						false
					} else if !record.kind.is_effect() && record.downstream.is_empty() {
						// Everyone left since enqueuing; back to lazy validation.
						record.flags.remove(CellFlags::QUEUED);
						false
					} else {
						true
					}
				}
			}
		};
		if !runnable {
			continue;
		}
		if let Err(payload) = catch_unwind(AssertUnwindSafe(|| validate(&lock, id))) {
			let error = RecipeError::from_panic(payload.as_ref());
			tracing::error!(?id, %error, "queued recomputation failed");
		}
	}
	process_releases(&lock);
}

/// Purges records whose last handle dropped, disposing them first if needed.
///
/// Skipped while any frame is active: disposal may run user cleanups, and
/// those must not land in a recording frame.
fn process_releases(lock: &Guard<'_>) {
	if !(*lock).borrow().context_stack.is_empty() {
		return;
	}
	loop {
		let batch: Vec<CellId> = std::mem::take(&mut *RUNTIME.released.lock());
		if batch.is_empty() {
			return;
		}
		for id in batch {
			let purgeable = {
				let engine = (*lock).borrow();
				engine
					.cells
					.get(&id)
					.is_some_and(|record| record.handle.strong_count() == 0)
			};
			if !purgeable {
				continue;
			}
			let disposed = {
				let engine = (*lock).borrow();
				engine.cells.get(&id).is_none_or_disposed()
			};
			if !disposed {
				dispose_id(lock, id);
			}
			let still_unreferenced = {
				let engine = (*lock).borrow();
				engine
					.cells
					.get(&id)
					.is_some_and(|record| record.handle.strong_count() == 0)
			};
			if still_unreferenced {
				(*lock).borrow_mut().cells.remove(&id);
				tracing::trace!(?id, "purged cell");
			}
		}
	}
}

/// Sets Dirty on `id` and propagates dirtiness depth-first to everything
/// downstream. Effects additionally enqueue themselves.
fn mark_dirty(lock: &Guard<'_>, id: CellId) {
	{
		let mut engine = (*lock).borrow_mut();
		let Some(record) = engine.cells.get_mut(&id) else {
			return;
		};
		match record.kind {
			CellKind::Source { .. } | CellKind::Scope => return,
			CellKind::Derived { .. } | CellKind::Effect { .. } => {}
		}
		if record.flags.has(CellFlags::DIRTY) || record.disposed() {
			return;
		}
		record.flags.insert(CellFlags::DIRTY);
		if record.kind.is_effect()
			&& record.flags.has(CellFlags::ENABLED)
			&& !record.flags.has(CellFlags::QUEUED)
		{
			record.flags.insert(CellFlags::QUEUED);
			engine.settle_queue.push_back(id);
			tracing::trace!(?id, "queued effect");
		}
	}
	broadcast(lock, id, &Broadcast::Dirty);
}

/// Marks `consumer` dirty (propagating), then enqueues it for recomputation
/// if it is watched: effects always, derived cells only while they have
/// downstream subscribers.
fn cell_on_next(lock: &Guard<'_>, consumer: CellId) {
	mark_dirty(lock, consumer);
	let mut engine = (*lock).borrow_mut();
	let Some(record) = engine.cells.get_mut(&consumer) else {
		return;
	};
	if record.disposed() || record.flags.has(CellFlags::QUEUED) {
		return;
	}
	let eligible = match record.kind {
		CellKind::Effect { .. } => record.flags.has(CellFlags::ENABLED),
		CellKind::Derived { .. } => !record.downstream.is_empty(),
		_ => false,
	};
	if eligible {
		record.flags.insert(CellFlags::QUEUED);
		engine.settle_queue.push_back(consumer);
		tracing::trace!(id = ?consumer, "queued recomputation");
	}
}

enum Broadcast<'a> {
	Next(&'a Value),
	Dirty,
	Error(&'a RecipeError),
	Complete,
}

/// Iterates `source`'s downstream list by index over a snapshot of its
/// length and dispatches one hook per live subscription.
///
/// Observers disposing themselves mid-broadcast only pop the tail; an
/// observer that swapped itself to a lower index is simply not revisited
/// this cycle. Late arrivals past the snapshot length are not visited.
fn broadcast(lock: &Guard<'_>, source: CellId, event: &Broadcast<'_>) {
	let initial_len = {
		let engine = (*lock).borrow();
		engine
			.cells
			.get(&source)
			.map_or(0, |record| record.downstream.len())
	};
	for index in 0..initial_len {
		enum Action {
			CellNext(CellId),
			CellDirty(CellId),
			DropFromConsumer(SubId),
			Adopt(CellId),
			SeverForward(CellId, SubId),
			External(SharedObserver),
			Skip,
		}
		let action = {
			let mut engine = (*lock).borrow_mut();
			let Some(record) = engine.cells.get(&source) else {
				break;
			};
			let Some(&sub) = record.downstream.get(index) else {
				break;
			};
			let Some(sub_record) = engine.subs.get_mut(&sub) else {
				continue;
			};
			if !sub_record.enabled || sub_record.disposed {
				Action::Skip
			} else {
				match (&sub_record.sink, event) {
					(Sink::Cell(consumer), Broadcast::Next(_)) => Action::CellNext(*consumer),
					(Sink::Cell(consumer), Broadcast::Dirty) => Action::CellDirty(*consumer),
					(Sink::Cell(_), Broadcast::Complete) => {
						sub_record.disposed = true;
						Action::DropFromConsumer(sub)
					}
					(Sink::Cell(_), Broadcast::Error(_)) => Action::Skip,
					(Sink::Forward(target), Broadcast::Next(_)) => Action::Adopt(*target),
					(Sink::Forward(target), Broadcast::Complete) => {
						sub_record.disposed = true;
						Action::SeverForward(*target, sub)
					}
					(Sink::Forward(_), _) => Action::Skip,
					(Sink::External(observer), _) => {
						if matches!(event, Broadcast::Complete) {
							sub_record.disposed = true;
						}
						Action::External(observer.clone())
					}
				}
			}
		};
		match action {
			Action::CellNext(consumer) => cell_on_next(lock, consumer),
			Action::CellDirty(consumer) => mark_dirty(lock, consumer),
			Action::DropFromConsumer(sub) => {
				let mut engine = (*lock).borrow_mut();
				engine.unlink_from_consumer(sub);
			}
			Action::Adopt(target) => {
				if let Broadcast::Next(value) = event {
					adopt(lock, target, (*value).clone());
				}
			}
			Action::SeverForward(target, sub) => {
				// The forward's upstream completed: the target keeps the
				// adopted value and exits forwarding mode.
				let mut engine = (*lock).borrow_mut();
				if let Some(record) = engine.cells.get_mut(&target) {
					if let CellKind::Source { forward } = &mut record.kind {
						if *forward == Some(sub) {
							*forward = None;
						}
					}
				}
			}
			Action::External(observer) => detached(lock, || {
				let mut observer = observer.lock();
				match event {
					Broadcast::Next(value) => observer.next(value),
					Broadcast::Dirty => observer.dirty(),
					Broadcast::Error(error) => observer.error(error),
					Broadcast::Complete => observer.complete(),
				}
			}),
			Action::Skip => {}
		}
	}
}

/// A source cell (possibly in forwarding mode) takes on `value`.
fn adopt(lock: &Guard<'_>, target: CellId, value: Value) {
	let changed = {
		let mut engine = (*lock).borrow_mut();
		let Some(record) = engine.cells.get_mut(&target) else {
			return;
		};
		if record.disposed() {
			return;
		}
		let wrapped = auto_wrap(value, record.flags.has(CellFlags::SHALLOW));
		let changed = record
			.value
			.as_ref()
			.map_or(true, |current| !current.identical(&wrapped));
		if changed {
			record.value = Some(wrapped.clone());
			Some(wrapped)
		} else {
			None
		}
	};
	if let Some(value) = changed {
		broadcast(lock, target, &Broadcast::Next(&value));
	}
}

/// Direct write to a source cell.
fn set_source(lock: &Guard<'_>, id: CellId, value: Value) -> bool {
	if let Value::Cell(upstream) = value {
		set_forward(lock, id, upstream);
		return true;
	}
	// A plain write severs an active forward.
	let severed = {
		let mut engine = (*lock).borrow_mut();
		let Some(record) = engine.cells.get_mut(&id) else {
			return true;
		};
		match &mut record.kind {
			CellKind::Source { forward } => forward.take(),
			_ => None,
		}
	};
	if let Some(sub) = severed {
		let mut engine = (*lock).borrow_mut();
		engine.drop_sub(sub);
	}
	adopt(lock, id, value);
	true
}

/// Switches `target` into forwarding mode onto `upstream`.
fn set_forward(lock: &Guard<'_>, target: CellId, upstream: CellHandle) {
	assert!(
		upstream.id() != target,
		"Tried to forward a source cell to itself."
	);
	let upstream_id = upstream.id();
	let upstream_state = {
		let engine = (*lock).borrow();
		match engine.cells.get(&upstream_id) {
			None => UpstreamState::Disposed,
			Some(record) if record.disposed() => UpstreamState::Disposed,
			Some(record) => match record.kind {
				CellKind::Derived { .. } => UpstreamState::Derived,
				_ => UpstreamState::Plain,
			},
		}
	};
	if matches!(upstream_state, UpstreamState::Derived) {
		validate(lock, upstream_id);
	}
	let adopted = {
		let engine = (*lock).borrow();
		engine
			.cells
			.get(&upstream_id)
			.and_then(|record| record.value.clone())
			.unwrap_or(Value::Null)
	};
	// Replace any previous forward.
	let severed = {
		let mut engine = (*lock).borrow_mut();
		let Some(record) = engine.cells.get_mut(&target) else {
			return;
		};
		match &mut record.kind {
			CellKind::Source { forward } => forward.take(),
			_ => panic!("Tried to forward a cell that is not a source cell."),
		}
	};
	if let Some(sub) = severed {
		let mut engine = (*lock).borrow_mut();
		engine.drop_sub(sub);
	}
	if matches!(upstream_state, UpstreamState::Disposed) {
		// Subscribing to a disposed cell completes immediately: adopt the
		// final value and stay unforwarded.
		adopt(lock, target, adopted);
		return;
	}
	let sub = next_sub_id();
	{
		let mut engine = (*lock).borrow_mut();
		let snapshot = Some(adopted.clone());
		let Some(upstream_record) = engine.cells.get_mut(&upstream_id) else {
			return;
		};
		let source_index = upstream_record.downstream.len();
		upstream_record.downstream.push(sub);
		engine.subs.insert(
			sub,
			SubRecord {
				source: upstream,
				sink: Sink::Forward(target),
				source_index: Some(source_index),
				consumer_index: None,
				snapshot,
				enabled: true,
				disposed: false,
			},
		);
		if let Some(record) = engine.cells.get_mut(&target) {
			if let CellKind::Source { forward } = &mut record.kind {
				*forward = Some(sub);
			}
		}
	}
	adopt(lock, target, adopted);
}

enum UpstreamState {
	Plain,
	Derived,
	Disposed,
}

/// Brings a dirty derived cell or effect up to date.
///
/// A cell that never computed recomputes unconditionally. Otherwise the
/// upstream subscription list is walked in order: dirty dependencies are
/// validated recursively, then each dependency's current value is compared
/// against the snapshot captured at link time. Only an actual difference
/// triggers the recipe; otherwise the dirty flag simply clears.
fn validate(lock: &Guard<'_>, id: CellId) {
	let never_computed = {
		let engine = (*lock).borrow();
		let Some(record) = engine.cells.get(&id) else {
			return;
		};
		match record.kind {
			CellKind::Derived { .. } | CellKind::Effect { .. } => {}
			_ => return,
		}
		if record.disposed() {
			return;
		}
		assert!(
			!engine.on_stack(id),
			"Tried to read a cell from within its own recipe."
		);
		if !record.flags.has(CellFlags::DIRTY) && record.value.is_some() {
			return;
		}
		record.value.is_none()
	};
	let mut outdated = never_computed;
	if !outdated {
		let upstream: Vec<SubId> = {
			let engine = (*lock).borrow();
			engine
				.cells
				.get(&id)
				.map(|record| record.upstream.to_vec())
				.unwrap_or_default()
		};
		for sub in upstream {
			let Some((source, snapshot)) = ({
				let engine = (*lock).borrow();
				engine
					.subs
					.get(&sub)
					.map(|record| (record.source.id(), record.snapshot.clone()))
			}) else {
				// The dependency edge died under us; the shape changed.
				outdated = true;
				break;
			};
			let source_dirty = {
				let engine = (*lock).borrow();
				engine.cells.get(&source).is_some_and(|record| {
					record.flags.has(CellFlags::DIRTY) && !record.disposed()
				})
			};
			if source_dirty {
				validate(lock, source);
			}
			let current = {
				let engine = (*lock).borrow();
				engine.cells.get(&source).and_then(|record| record.value.clone())
			};
			let unchanged = match (&current, &snapshot) {
				(Some(current), Some(snapshot)) => current.identical(snapshot),
				(None, None) => true,
				_ => false,
			};
			if !unchanged {
				outdated = true;
				break;
			}
		}
	}
	if !outdated {
		let mut engine = (*lock).borrow_mut();
		if let Some(record) = engine.cells.get_mut(&id) {
			record.flags.remove(CellFlags::DIRTY);
			record.flags.remove(CellFlags::QUEUED);
		}
		return;
	}
	recompute(lock, id);
}

/// Runs the recipe of `id` inside a fresh frame, then truncates stale
/// dependencies past the cursor, stores and notifies on an actual change,
/// and clears the flags.
fn recompute(lock: &Guard<'_>, id: CellId) {
	let Some((recipe, cleanup, is_effect, previous)) = ({
		let mut engine = (*lock).borrow_mut();
		engine.cells.get_mut(&id).and_then(|record| match &record.kind {
			CellKind::Derived { recipe, .. } => Some((recipe.clone(), None, false, None)),
			CellKind::Effect { recipe, cleanup } => Some((
				recipe.clone(),
				cleanup.clone(),
				true,
				record.value.take(),
			)),
			_ => None,
		})
	}) else {
		return;
	};
	if is_effect {
		// Children from the previous run die first, always removing the
		// head: disposal pop-and-swaps the next child down to index 0.
		loop {
			let first = {
				let engine = (*lock).borrow();
				engine
					.cells
					.get(&id)
					.and_then(|record| record.children.as_ref())
					.and_then(|children| children.first().cloned())
			};
			match first {
				Some(child) => dispose_id(lock, child.id()),
				None => break,
			}
		}
	}
	(*lock)
		.borrow_mut()
		.context_stack
		.push(Some(Frame { id, cursor: 0 }));
	let result = catch_unwind(AssertUnwindSafe(|| {
		if let (Some(cleanup), Some(previous)) = (&cleanup, previous) {
			(&mut *cleanup.lock())(previous);
		}
		(&mut *recipe.lock())()
	}));
	let cursor = {
		let mut engine = (*lock).borrow_mut();
		let popped = engine.context_stack.pop();
		let Some(Some(frame)) = popped else {
			unreachable!()
		};
		debug_assert_eq!(frame.id, id);
		frame.cursor
	};
	match result {
		Ok(new_value) => {
			let changed = {
				let mut engine = (*lock).borrow_mut();
				engine.truncate_upstream(id, cursor);
				let Some(record) = engine.cells.get_mut(&id) else {
					return;
				};
				record.flags.remove(CellFlags::DIRTY);
				record.flags.remove(CellFlags::QUEUED);
				if is_effect {
					record.value = Some(new_value);
					None
				} else {
					let changed = record
						.value
						.as_ref()
						.map_or(true, |old| !old.identical(&new_value));
					if changed {
						record.value = Some(new_value.clone());
						Some(new_value)
					} else {
						None
					}
				}
			};
			if let Some(value) = changed {
				broadcast(lock, id, &Broadcast::Next(&value));
			}
		}
		Err(payload) => {
			let error = RecipeError::from_panic(payload.as_ref());
			{
				// Queued clears, Dirty stays, the observed prefix stays wired
				// so the next upstream change can drive revalidation.
				let mut engine = (*lock).borrow_mut();
				if let Some(record) = engine.cells.get_mut(&id) {
					record.flags.remove(CellFlags::QUEUED);
				}
			}
			broadcast(lock, id, &Broadcast::Error(&error));
			resume_unwind(payload);
		}
	}
}

/// Disposes `id`: depth-first over children, then the upstream edges, then
/// the completion broadcast downstream, then the parent unlink. Idempotent;
/// re-entry during the teardown is a no-op.
fn dispose_id(lock: &Guard<'_>, id: CellId) {
	let cleanup = {
		let mut engine = (*lock).borrow_mut();
		let Some(record) = engine.cells.get_mut(&id) else {
			return;
		};
		if record.disposed() {
			return;
		}
		record.flags.insert(CellFlags::DISPOSED);
		record.flags.remove(CellFlags::QUEUED);
		match &record.kind {
			CellKind::Effect { cleanup, .. } => {
				cleanup.clone().zip(record.value.take())
			}
			_ => None,
		}
	};
	tracing::debug!(?id, "disposing cell");
	// Children die front to back, always removing the head.
	loop {
		let first = {
			let engine = (*lock).borrow();
			engine
				.cells
				.get(&id)
				.and_then(|record| record.children.as_ref())
				.and_then(|children| children.first().cloned())
		};
		match first {
			Some(child) => dispose_id(lock, child.id()),
			None => break,
		}
	}
	{
		let mut engine = (*lock).borrow_mut();
		if let Some(record) = engine.cells.get_mut(&id) {
			record.children = None;
			record.observed.clear();
		}
		// Upstream edges die with this endpoint.
		engine.truncate_upstream(id, 0);
		let forward = engine.cells.get_mut(&id).and_then(|record| match &mut record.kind {
			CellKind::Source { forward } => forward.take(),
			_ => None,
		});
		if let Some(sub) = forward {
			engine.drop_sub(sub);
		}
	}
	if let Some((cleanup, previous)) = cleanup {
		let result = catch_unwind(AssertUnwindSafe(|| {
			detached(lock, || (&mut *cleanup.lock())(previous));
		}));
		if let Err(payload) = result {
			let error = RecipeError::from_panic(payload.as_ref());
			tracing::error!(?id, %error, "effect cleanup failed during disposal");
		}
	}
	broadcast(lock, id, &Broadcast::Complete);
	{
		let mut engine = (*lock).borrow_mut();
		// Drop whatever the completion broadcast left in the list, plus any
		// disabled subscriptions parked off-list.
		let mut remaining: Vec<SubId> = engine
			.cells
			.get_mut(&id)
			.map(|record| record.downstream.drain(..).collect())
			.unwrap_or_default();
		remaining.extend(
			engine
				.subs
				.iter()
				.filter(|(_, sub)| sub.source.id() == id && sub.source_index.is_none())
				.map(|(&sub, _)| sub),
		);
		for sub in remaining {
			engine.unlink_from_consumer(sub);
			engine.subs.remove(&sub);
		}
		engine.detach_from_parent(id);
	}
}
