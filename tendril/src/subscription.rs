use meristem::runtime::SubscriptionHandle;

/// A handle to an active subscription.
///
/// Dropping the handle does not unsubscribe: the edge lives until either
/// endpoint disposes or [`unsubscribe`](`Self::unsubscribe`) severs it.
#[derive(Clone, Debug)]
pub struct Subscription(SubscriptionHandle);

impl Subscription {
	pub(crate) fn new(handle: SubscriptionHandle) -> Self {
		Self(handle)
	}

	/// Severs the subscription. Idempotent.
	pub fn unsubscribe(&self) {
		self.0.unsubscribe();
	}

	/// Pauses delivery in O(1); the observer is retained.
	pub fn disable(&self) {
		self.0.disable();
	}

	/// Resumes delivery in O(1).
	pub fn enable(&self) {
		self.0.enable();
	}

	/// Whether this subscription is closed: either it was unsubscribed, its
	/// cell disposed, or it was born closed by subscribing to a disposed
	/// cell.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.0.is_closed()
	}
}
