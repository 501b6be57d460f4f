//! Progress reporting: the contract any UI or log
//! summary reads instead of re-deriving counters from raw DIMSE responses.

use crate::types::US;
use std::time::Instant;

/// Accumulated progress for one outbound association or one inbound batch.
#[derive(Debug, Clone)]
pub struct DicomState {
	pub status: Option<US>,
	pub completed: u32,
	pub failed: u32,
	pub warning: u32,
	pub remaining: u32,
	pub error_message: Option<String>,
	pub bytes_transferred: u64,
	pub start: Option<Instant>,
	pub connected: Option<Instant>,
	pub end: Option<Instant>,
}

impl Default for DicomState {
	fn default() -> Self {
		Self {
			status: None,
			completed: 0,
			failed: 0,
			warning: 0,
			remaining: 0,
			error_message: None,
			bytes_transferred: 0,
			start: None,
			connected: None,
			end: None,
		}
	}
}

impl DicomState {
	pub fn start(&mut self) {
		self.start = Some(Instant::now());
	}

	pub fn connected(&mut self) {
		self.connected = Some(Instant::now());
	}

	pub fn end(&mut self) {
		self.end = Some(Instant::now());
	}

	pub fn record_completed(&mut self, status: US, bytes: u64) {
		self.status = Some(status);
		self.completed += 1;
		self.bytes_transferred += bytes;
	}

	pub fn record_warning(&mut self, status: US, bytes: u64) {
		self.status = Some(status);
		self.warning += 1;
		self.bytes_transferred += bytes;
	}

	pub fn record_failed(&mut self, status: US, message: impl Into<String>) {
		self.status = Some(status);
		self.failed += 1;
		self.error_message = Some(message.into());
	}

	/// A human-readable summary, e.g. "3/10 operations have failed. DICOM
	/// error: ...".
	pub fn summary(&self) -> String {
		let total = self.completed + self.failed + self.warning + self.remaining;
		match &self.error_message {
			Some(message) if self.failed > 0 => {
				format!("{}/{total} operations have failed. DICOM error: {message}", self.failed)
			}
			_ => format!(
				"{}/{total} completed, {} warning, {} failed, {} remaining",
				self.completed, self.warning, self.failed, self.remaining
			),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counter_conservation_holds_after_a_batch() {
		let mut state = DicomState {
			remaining: 3,
			..Default::default()
		};
		state.record_completed(0x0000, 100);
		state.remaining -= 1;
		state.record_warning(0xB000, 100);
		state.remaining -= 1;
		state.record_failed(0x0110, "processing failure");
		state.remaining -= 1;

		let total = state.completed + state.failed + state.warning + state.remaining;
		assert_eq!(total, 3);
	}
}
