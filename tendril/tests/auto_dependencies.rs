use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use tendril::{AsCell, DerivedCell, SourceCell, Value};

#[test]
fn conditional_dependencies_rewire() {
	let cond = SourceCell::new(true);
	let a = SourceCell::new(1.0);
	let b = SourceCell::new(2.0);
	let runs = Arc::new(AtomicUsize::new(0));

	let r = DerivedCell::computed({
		let (cond, a, b) = (cond.clone(), a.clone(), b.clone());
		let runs = Arc::clone(&runs);
		move || {
			runs.fetch_add(1, Ordering::SeqCst);
			if cond.get().as_bool().unwrap() {
				a.get()
			} else {
				b.get()
			}
		}
	});

	assert_eq!(r.get().as_number(), Some(1.0));
	assert_eq!(runs.load(Ordering::SeqCst), 1);

	cond.set(false);
	assert_eq!(r.get().as_number(), Some(2.0));
	assert_eq!(runs.load(Ordering::SeqCst), 2);

	// `a` was dropped from the dependency set, so writing it is invisible.
	a.set(99.0);
	assert_eq!(r.get().as_number(), Some(2.0));
	assert_eq!(runs.load(Ordering::SeqCst), 2);

	b.set(5.0);
	assert_eq!(r.get().as_number(), Some(5.0));
	assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn clean_reads_never_recompute() {
	let a = SourceCell::new(3.0);
	let runs = Arc::new(AtomicUsize::new(0));
	let doubled = DerivedCell::computed({
		let a = a.clone();
		let runs = Arc::clone(&runs);
		move || {
			runs.fetch_add(1, Ordering::SeqCst);
			Value::Number(a.get().as_number().unwrap() * 2.0)
		}
	});

	for _ in 0..10 {
		assert_eq!(doubled.get().as_number(), Some(6.0));
	}
	assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn unwatched_cells_stay_lazy() {
	let a = SourceCell::new(1.0);
	let runs = Arc::new(AtomicUsize::new(0));
	let d = DerivedCell::computed({
		let a = a.clone();
		let runs = Arc::clone(&runs);
		move || {
			runs.fetch_add(1, Ordering::SeqCst);
			a.get()
		}
	});
	assert_eq!(d.get().as_number(), Some(1.0));

	// No subscriber: upstream writes mark dirty but never run the recipe.
	a.set(2.0);
	a.set(3.0);
	tendril::settle();
	assert_eq!(runs.load(Ordering::SeqCst), 1);

	assert_eq!(d.get().as_number(), Some(3.0));
	assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn observed_lists_recipe_reads_in_order() {
	let a = SourceCell::new(1.0);
	let b = SourceCell::new(2.0);
	let d = DerivedCell::computed({
		let (a, b) = (a.clone(), b.clone());
		move || Value::Number(a.get().as_number().unwrap() + b.get().as_number().unwrap())
	});
	let _ = d.get();

	let observed = d.observed();
	assert_eq!(observed.len(), 2);
	assert_eq!(observed[0].id(), a.as_cell().id());
	assert_eq!(observed[1].id(), b.as_cell().id());
}
