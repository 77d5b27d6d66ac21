use std::sync::Arc;

use tendril::{settle, AsCell, CellOptions, Effect, Parent, Scope, SourceCell};

mod _validator;
use _validator::Validator;

#[test]
fn dispose_unhooks_descendants() {
	let record = Arc::new(Validator::new());
	let v = SourceCell::new(0.0);
	let scope = Scope::detached();

	let effect = Effect::with_options(
		{
			let v = v.clone();
			let record = Arc::clone(&record);
			move || record.push(v.get().as_number().unwrap() as i64)
		},
		&CellOptions {
			parent: Parent::Explicit(scope.handle().clone()),
			..CellOptions::default()
		},
	);
	record.expect([0]);

	scope.dispose();
	assert!(scope.is_disposed());
	assert!(effect.is_disposed());

	v.set(1.0);
	settle();
	record.expect([]);
}

#[test]
fn double_dispose_is_a_noop() {
	let scope = Scope::detached();
	scope.dispose();
	scope.dispose();
	assert!(scope.is_disposed());
}

#[test]
fn capture_collects_reads() {
	let a = SourceCell::new(1.0);
	let b = SourceCell::new(2.0);
	let c = SourceCell::new(3.0);
	let scope = Scope::detached();

	let total = scope.capture(|| {
		a.get().as_number().unwrap() + b.get().as_number().unwrap()
	});
	assert_eq!(total, 3.0);

	let observed = scope.observed();
	assert_eq!(observed.len(), 2);
	let ids: Vec<_> = observed.iter().map(tendril::CellHandle::id).collect();
	assert!(ids.contains(&a.as_cell().id()));
	assert!(ids.contains(&b.as_cell().id()));
	assert!(!ids.contains(&c.as_cell().id()));

	// Observation is presence only: nothing recomputes, nothing re-fires.
	a.set(10.0);
	settle();
	assert_eq!(scope.observed().len(), 2);
}

#[test]
fn manual_observe_records_presence() {
	let a = SourceCell::new(1.0);
	let scope = Scope::detached();
	scope.observe(&a);
	scope.observe(&a);
	assert_eq!(scope.observed().len(), 1);
}

#[test]
fn scopes_nest_and_unwind_depth_first() {
	let outer = Scope::detached();
	let inner = Scope::with_options(&CellOptions {
		parent: Parent::Explicit(outer.handle().clone()),
		..CellOptions::default()
	});
	let innermost = Scope::with_options(&CellOptions {
		parent: Parent::Explicit(inner.handle().clone()),
		..CellOptions::default()
	});
	assert_eq!(outer.children().len(), 1);

	outer.dispose();
	assert!(inner.is_disposed());
	assert!(innermost.is_disposed());
	assert!(outer.children().is_empty());
}

#[test]
#[should_panic(expected = "disposed scope")]
fn attaching_to_a_disposed_parent_panics() {
	let scope = Scope::detached();
	scope.dispose();
	let _ = Scope::with_options(&CellOptions {
		parent: Parent::Explicit(scope.handle().clone()),
		..CellOptions::default()
	});
}

#[test]
fn effects_own_ambient_scopes() {
	let trigger = SourceCell::new(0.0);
	let record = Arc::new(Validator::new());
	let _effect = Effect::new({
		let trigger = trigger.clone();
		let record = Arc::clone(&record);
		move || {
			let _ = trigger.get();
			let scope = Scope::new();
			record.push(scope.is_disposed());
		}
	});
	record.expect([false]);

	// The scope from the first run died with the re-run.
	trigger.set(1.0);
	settle();
	record.expect([false]);
}
