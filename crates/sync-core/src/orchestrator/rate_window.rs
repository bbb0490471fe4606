use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Sliding window of attempt start times for a single platform.
#[derive(Debug)]
pub(super) struct RateWindow {
	span: Duration,
	attempts: VecDeque<Instant>,
}

impl RateWindow {
	pub(super) const fn new(span: Duration) -> Self {
		Self {
			span,
			attempts: VecDeque::new(),
		}
	}

	/// Attempts started within the last `span` before `now`, dropping older ones.
	pub(super) fn count(&mut self, now: Instant) -> usize {
		while self
			.attempts
			.front()
			.is_some_and(|started_at| now.saturating_duration_since(*started_at) >= self.span)
		{
			self.attempts.pop_front();
		}

		self.attempts.len()
	}

	pub(super) fn record(&mut self, now: Instant) {
		self.attempts.push_back(now);
	}
}
