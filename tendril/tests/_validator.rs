use std::{collections::VecDeque, fmt::Debug, sync::Mutex};

/// Records what actually happened, in order, for comparison against what
/// should have.
pub struct Validator<T>(Mutex<VecDeque<T>>);

impl<T> Validator<T> {
	pub const fn new() -> Self {
		Self(Mutex::new(VecDeque::new()))
	}

	pub fn push(&self, value: T) {
		self.0.lock().unwrap().push_back(value);
	}

	#[track_caller]
	pub fn expect(&self, expected: impl IntoIterator<Item = T>)
	where
		T: Debug + Eq,
	{
		let mut recorded = self.0.lock().unwrap();
		let actual: Vec<_> = recorded.drain(..).collect();
		let expected: Vec<_> = expected.into_iter().collect();
		assert_eq!(actual, expected);
	}
}
