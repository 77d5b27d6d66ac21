use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc, Mutex, MutexGuard, PoisonError,
};

use tendril::{settle, DerivedCell, Hooks, SourceCell, Value};

mod _validator;
use _validator::Validator;

// Event ordering across a write burst is only meaningful if no sibling test
// drains the queue mid-burst. One at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
	SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

#[test]
fn diamond_recomputes_once_per_drain() {
	let _serial = serial();
	let a = SourceCell::new(1.0);
	let b = DerivedCell::computed({
		let a = a.clone();
		move || Value::Number(a.get().as_number().unwrap() + 1.0)
	});
	let c = DerivedCell::computed({
		let a = a.clone();
		move || Value::Number(a.get().as_number().unwrap() + 1.0)
	});
	let runs = Arc::new(AtomicUsize::new(0));
	let d = DerivedCell::computed({
		let (b, c) = (b.clone(), c.clone());
		let runs = Arc::clone(&runs);
		move || {
			runs.fetch_add(1, Ordering::SeqCst);
			Value::Number(b.get().as_number().unwrap() + c.get().as_number().unwrap())
		}
	});

	// Subscribing runs the protected first evaluation and makes `d` eligible
	// for enqueuing.
	let _sub = d.subscribe(Hooks::new());
	assert_eq!(runs.load(Ordering::SeqCst), 1);

	a.set(2.0);
	settle();

	// One coalesced recomputation for the whole diamond, not one per path.
	assert_eq!(runs.load(Ordering::SeqCst), 2);
	assert_eq!(d.get().as_number(), Some(6.0));
	assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn dirty_arrives_before_next() {
	let _serial = serial();
	let events = Arc::new(Validator::new());
	let a = SourceCell::new(1.0);
	let b = DerivedCell::computed({
		let a = a.clone();
		move || Value::Number(a.get().as_number().unwrap() * 10.0)
	});
	let _sub = b.subscribe(
		Hooks::new()
			.on_dirty({
				let events = Arc::clone(&events);
				move || events.push("dirty")
			})
			.on_next({
				let events = Arc::clone(&events);
				move |_| events.push("next")
			}),
	);
	events.expect([]);

	a.set(2.0);
	events.expect(["dirty"]);

	settle();
	events.expect(["next"]);
}

#[test]
fn writes_from_a_recomputation_join_the_same_drain() {
	let _serial = serial();
	let events = Arc::new(Validator::new());
	let a = SourceCell::new(Value::Text("a".into()));
	let b = SourceCell::new(Value::Text("b".into()));

	let _copier = tendril::Effect::new({
		let (a, b) = (a.clone(), b.clone());
		move || {
			b.set(a.get());
		}
	});
	let _watcher = tendril::Effect::new({
		let b = b.clone();
		let events = Arc::clone(&events);
		move || events.push(b.get().as_text().unwrap().to_owned())
	});
	events.expect(["a".to_owned()]);

	a.set("aa");
	settle();
	// The copier's re-entrant write to `b` ran in the same drain, after it.
	events.expect(["aa".to_owned()]);

	assert_eq!(b.get().as_text(), Some("aa"));
}
