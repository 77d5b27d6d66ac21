use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use tendril::{settle, CancellationToken, CellOptions, Effect, Hooks, SourceCell};

fn with_token(token: &CancellationToken) -> CellOptions {
	CellOptions {
		cancellation: Some(token.clone()),
		..CellOptions::default()
	}
}

#[test]
fn aborted_tokens_yield_born_disposed_cells() {
	let token = CancellationToken::new();
	token.abort();

	let cell = SourceCell::with_options(1.0, &with_token(&token));
	assert!(cell.is_disposed());

	let completed = Arc::new(AtomicUsize::new(0));
	let sub = cell.subscribe(Hooks::new().on_complete({
		let completed = Arc::clone(&completed);
		move || {
			completed.fetch_add(1, Ordering::SeqCst);
		}
	}));
	assert_eq!(completed.load(Ordering::SeqCst), 1);
	assert!(sub.is_closed());
}

#[test]
fn aborting_disposes_cells() {
	let token = CancellationToken::new();
	let cell = SourceCell::with_options(1.0, &with_token(&token));
	assert!(!cell.is_disposed());

	token.abort();
	assert!(cell.is_disposed());
	assert_eq!(cell.get().as_number(), Some(1.0));
}

#[test]
fn aborting_cancels_effects() {
	let token = CancellationToken::new();
	let runs = Arc::new(AtomicUsize::new(0));
	let x = SourceCell::new(0.0);
	let effect = Effect::with_options(
		{
			let x = x.clone();
			let runs = Arc::clone(&runs);
			move || {
				let _ = x.get();
				runs.fetch_add(1, Ordering::SeqCst);
			}
		},
		&with_token(&token),
	);
	assert_eq!(runs.load(Ordering::SeqCst), 1);

	token.abort();
	assert!(effect.is_disposed());

	x.set(1.0);
	settle();
	assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn born_disposed_effects_never_run() {
	let token = CancellationToken::new();
	token.abort();

	let runs = Arc::new(AtomicUsize::new(0));
	let effect = Effect::with_options(
		{
			let runs = Arc::clone(&runs);
			move || {
				runs.fetch_add(1, Ordering::SeqCst);
			}
		},
		&with_token(&token),
	);
	assert!(effect.is_disposed());
	assert_eq!(runs.load(Ordering::SeqCst), 0);
}
