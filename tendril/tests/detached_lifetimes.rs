use std::sync::{Arc, Mutex};

use tendril::{
	settle, CellOptions, Effect, Key, Parent, ReactiveRecord, Record, SourceCell, Value,
};

#[test]
fn ambient_cells_die_with_the_rerun() {
	let trigger = SourceCell::new(0.0);
	let stash: Arc<Mutex<Vec<SourceCell>>> = Arc::new(Mutex::new(Vec::new()));

	let _effect = Effect::new({
		let trigger = trigger.clone();
		let stash = Arc::clone(&stash);
		move || {
			let _ = trigger.get();
			stash.lock().unwrap().push(SourceCell::new(1.0));
		}
	});

	trigger.set(1.0);
	settle();

	let stash = stash.lock().unwrap();
	assert_eq!(stash.len(), 2);
	assert!(stash[0].is_disposed());
	assert!(!stash[1].is_disposed());
}

#[test]
fn detached_cells_survive_effect_reruns() {
	let trigger = SourceCell::new(0.0);
	let stash: Arc<Mutex<Vec<SourceCell>>> = Arc::new(Mutex::new(Vec::new()));

	let _effect = Effect::new({
		let trigger = trigger.clone();
		let stash = Arc::clone(&stash);
		move || {
			let _ = trigger.get();
			stash.lock().unwrap().push(SourceCell::with_options(
				1.0,
				&CellOptions {
					parent: Parent::Detached,
					..CellOptions::default()
				},
			));
		}
	});

	trigger.set(1.0);
	settle();

	let stash = stash.lock().unwrap();
	assert_eq!(stash.len(), 2);
	assert!(!stash[0].is_disposed());
	assert!(!stash[1].is_disposed());
}

#[test]
fn facade_property_cells_survive_effect_reruns() {
	let user = ReactiveRecord::over(Record::from_iter([("name", Value::from("Ada"))]));
	let trigger = SourceCell::new(0.0);
	let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

	let _effect = Effect::new({
		let (user, trigger) = (user.clone(), trigger.clone());
		let seen = Arc::clone(&seen);
		move || {
			let _ = trigger.get();
			let name = user.get(&Key::from("name"));
			seen.lock().unwrap().push(name.as_text().unwrap().to_owned());
		}
	});

	// The cell backing "name" was synthesized inside the effect's run, but it
	// belongs to the facade, not to the run.
	let name_cell = user.property_cell(&Key::from("name")).unwrap();
	assert!(!name_cell.is_disposed());

	trigger.set(1.0);
	settle();
	assert!(!name_cell.is_disposed());
	assert!(user
		.property_cell(&Key::from("name"))
		.unwrap()
		.same(&name_cell));

	// And it still drives the effect.
	user.set(&Key::from("name"), Value::from("Grace"));
	settle();
	assert_eq!(
		*seen.lock().unwrap(),
		["Ada".to_owned(), "Ada".to_owned(), "Grace".to_owned()]
	);
}
