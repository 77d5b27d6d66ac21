use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tendril::{settle, Effect, SourceCell, Value};

mod _validator;
use _validator::Validator;

// These tests assert run counts across write bursts, so a drain started by a
// sibling test mid-burst would skew them. One at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
	SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

#[test]
fn runs_once_per_drain() {
	let _serial = serial();
	let record = Arc::new(Validator::new());
	let x = SourceCell::new(0.0);

	let _effect = Effect::new({
		let x = x.clone();
		let record = Arc::clone(&record);
		move || record.push(x.get().as_number().unwrap() as i64)
	});
	record.expect([0]);

	x.set(1.0);
	x.set(2.0);
	x.set(3.0);
	settle();

	// The three writes coalesced into one re-run.
	record.expect([3]);
}

#[test]
fn disable_suppresses_without_losing_dirtiness() {
	let _serial = serial();
	let record = Arc::new(Validator::new());
	let x = SourceCell::new(0.0);
	let effect = Effect::new({
		let x = x.clone();
		let record = Arc::clone(&record);
		move || record.push(x.get().as_number().unwrap() as i64)
	});
	record.expect([0]);

	effect.disable();
	x.set(1.0);
	settle();
	record.expect([]);

	// Enabling does not retroactively fire the swallowed change.
	effect.enable();
	settle();
	record.expect([]);

	// The next change re-runs normally.
	x.set(2.0);
	settle();
	record.expect([2]);

	// Disable twice, enable, disable: still just disabled.
	effect.disable();
	effect.disable();
	effect.enable();
	effect.disable();
	x.set(3.0);
	settle();
	record.expect([]);
	assert!(!effect.is_enabled());
}

#[test]
fn cleanup_consumes_the_previous_output() {
	let _serial = serial();
	let record = Arc::new(Validator::new());
	let x = SourceCell::new(1.0);
	let effect = Effect::with_cleanup(
		{
			let x = x.clone();
			let record = Arc::clone(&record);
			move || {
				let value = x.get().as_number().unwrap() as i64;
				record.push(format!("run {value}"));
				Value::Number(value as f64)
			}
		},
		{
			let record = Arc::clone(&record);
			move |previous| record.push(format!("drop {}", previous.as_number().unwrap() as i64))
		},
	);
	record.expect(["run 1".to_owned()]);

	x.set(2.0);
	settle();
	record.expect(["drop 1".to_owned(), "run 2".to_owned()]);

	effect.dispose();
	record.expect(["drop 2".to_owned()]);
}

#[test]
fn reruns_dispose_children() {
	let _serial = serial();
	let record = Arc::new(Validator::new());
	let keep = Arc::new(Mutex::new(Vec::new()));
	let outer_dep = SourceCell::new(0.0);
	let inner_dep = SourceCell::new(0.0);

	let _outer = Effect::new({
		let (outer_dep, inner_dep) = (outer_dep.clone(), inner_dep.clone());
		let record = Arc::clone(&record);
		let keep = Arc::clone(&keep);
		move || {
			let _ = outer_dep.get();
			let inner = Effect::new({
				let inner_dep = inner_dep.clone();
				let record = Arc::clone(&record);
				move || record.push(("inner", inner_dep.get().as_number().unwrap() as i64))
			});
			keep.lock().unwrap().push(inner);
		}
	});
	record.expect([("inner", 0)]);

	inner_dep.set(1.0);
	settle();
	record.expect([("inner", 1)]);

	// Re-running the outer effect disposes the first inner effect and makes
	// a fresh one; only the fresh one reacts from here on.
	outer_dep.set(1.0);
	settle();
	record.expect([("inner", 1)]);

	inner_dep.set(2.0);
	settle();
	record.expect([("inner", 2)]);
	assert!(keep.lock().unwrap()[0].is_disposed());
	assert!(!keep.lock().unwrap()[1].is_disposed());
}

#[test]
fn dropping_cancels() {
	let _serial = serial();
	let record = Arc::new(Validator::new());
	let x = SourceCell::new(0.0);
	let effect = Effect::new({
		let x = x.clone();
		let record = Arc::clone(&record);
		move || record.push(x.get().as_number().unwrap() as i64)
	});
	record.expect([0]);

	drop(effect);
	x.set(1.0);
	settle();
	record.expect([]);
}

#[test]
fn manual_run_is_immediate() {
	let _serial = serial();
	let record = Arc::new(Validator::new());
	let x = SourceCell::new(7.0);
	let effect = Effect::new({
		let x = x.clone();
		let record = Arc::clone(&record);
		move || record.push(x.get().as_number().unwrap() as i64)
	});
	record.expect([7]);

	effect.run();
	record.expect([7]);
}
