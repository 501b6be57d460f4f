//! The Streaming Store SCU: a long-lived,
//! reusable C-STORE SCU. One instance is exclusively owned by one
//! [`crate::destination::ForwardDestination`] and is shared across every
//! inbound association that forwards to it, so every state
//! transition is serialized under a single async mutex.

use crate::dimse::association::client::{ClientAssociation, ClientAssociationOptions, ProposedContext};
use crate::dimse::association::{Association, AssociationError};
use crate::dimse::message::{CStoreRequest, CStoreResponse};
use crate::dimse::{next_message_id, DicomMessageReader, DicomMessageWriter};
use crate::node::DicomNode;
use crate::state::DicomState;
use crate::types::{Priority, Status, StatusClass, UI, US};
use dicom::object::InMemDicomObject;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Implicit/Explicit VR Little Endian, always proposed as fallbacks for a
/// newly introduced SOP class.
const IVR_LE: &str = "1.2.840.10008.1.2";
const EVR_LE: &str = "1.2.840.10008.1.2.1";

/// Bounded wait while a close is in progress.
const PAUSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle-close countdown.
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);
/// Bound on A-RELEASE-RQ/RP round trip.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on a single outbound C-STORE-RQ/RSP round trip.
const DIMSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Distinct non-success codes logged per association before floods are
/// suppressed.
const MAX_STATUS_LOG: usize = 3;

#[derive(Debug, Error)]
pub enum ScuError {
	#[error("outbound association is not ready for data transfer")]
	NotReady,
	#[error("failed to connect to destination: {0}")]
	ConnectFailed(#[source] AssociationError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error("failed to read C-STORE-RSP: {0}")]
	Read(#[from] crate::dimse::ReadError),
	#[error("failed to write C-STORE-RQ: {0}")]
	Write(#[from] crate::dimse::WriteError),
	#[error("no accepted presentation context for {cuid}/{tsuid}")]
	PresentationContextUnsupported { cuid: UI, tsuid: UI },
}

/// One proposed (and, once negotiated, accepted) SOP class / transfer
/// syntax pairing, tracked in association-request order.
#[derive(Debug, Clone)]
struct ProposedGroup {
	cuid: UI,
	tsuids: Vec<UI>,
}

struct Inner {
	groups: Vec<ProposedGroup>,
	/// Snapshot of `groups` as of the last successful `open()`, used to
	/// decide whether a new `(cuid, tsuid)` pair requires closing and
	/// reopening.
	negotiated_at_open: Vec<ProposedGroup>,
	/// Transfer syntax the peer actually accepted for each negotiated cuid,
	/// by presentation context index into `negotiated_at_open`.
	accepted_tsuid: HashMap<UI, UI>,
	association: Option<ClientAssociation>,
	idle_handle: Option<JoinHandle<()>>,
	progress: DicomState,
	status_log: Vec<US>,
	relationship_negotiation: bool,
}

/// The long-lived outbound C-STORE SCU: accumulates presentation context
/// groups as destinations prepare transfers, opens one reusable association
/// per destination, and closes it on an idle timer or explicit stop.
pub struct StreamingStoreScu {
	calling_node: DicomNode,
	called_node: DicomNode,
	inner: Mutex<Inner>,
	pausing: AtomicBool,
	pause_notify: Notify,
}

impl StreamingStoreScu {
	pub fn new(calling_node: DicomNode, called_node: DicomNode) -> Self {
		Self {
			calling_node,
			called_node,
			inner: Mutex::new(Inner {
				groups: Vec::new(),
				negotiated_at_open: Vec::new(),
				accepted_tsuid: HashMap::new(),
				association: None,
				idle_handle: None,
				progress: DicomState::default(),
				status_log: Vec::new(),
				relationship_negotiation: false,
			}),
			pausing: AtomicBool::new(false),
			pause_notify: Notify::new(),
		}
	}

	pub async fn set_relationship_negotiation(&self, enabled: bool) {
		self.inner.lock().await.relationship_negotiation = enabled;
	}

	/// Idempotently records that `cuid`/`tsuid` must be negotiated. Disarms
	/// the idle countdown. Returns `true` if this added a transfer syntax
	/// that wasn't already tracked.
	pub async fn add_presentation_context(&self, cuid: &str, tsuid: &str) -> bool {
		let mut inner = self.inner.lock().await;
		Self::disarm_idle(&mut inner);
		Self::add_context_locked(&mut inner, cuid, tsuid)
	}

	fn add_context_locked(inner: &mut Inner, cuid: &str, tsuid: &str) -> bool {
		if let Some(group) = inner.groups.iter_mut().find(|g| g.cuid == cuid) {
			if group.tsuids.iter().any(|t| t == tsuid) {
				return false;
			}
			group.tsuids.push(tsuid.to_owned());
			true
		} else {
			let mut tsuids = vec![tsuid.to_owned()];
			for fallback in [IVR_LE, EVR_LE] {
				if !tsuids.iter().any(|t| t == fallback) {
					tsuids.push(fallback.to_owned());
				}
			}
			inner.groups.push(ProposedGroup {
				cuid: cuid.to_owned(),
				tsuids,
			});
			true
		}
	}

	fn disarm_idle(inner: &mut Inner) {
		if let Some(handle) = inner.idle_handle.take() {
			handle.abort();
		}
	}

	/// Arms a single-shot 15s timer that calls `close(false)`. A no-op if
	/// already armed; disarmed by `add_presentation_context` or `open`.
	pub async fn trigger_idle_close(self: &Arc<Self>) {
		let mut inner = self.inner.lock().await;
		if inner.idle_handle.is_some() {
			return;
		}
		let this = Arc::clone(self);
		inner.idle_handle = Some(tokio::spawn(async move {
			tokio::time::sleep(IDLE_TIMEOUT).await;
			this.close(false).await;
		}));
	}

	/// Whether `cuid`/`tsuid` was already covered by the presentation
	/// contexts negotiated the last time the association was opened.
	fn already_negotiated(inner: &Inner, cuid: &str, tsuid: &str) -> bool {
		inner
			.negotiated_at_open
			.iter()
			.any(|group| group.cuid == cuid && group.tsuids.iter().any(|t| t == tsuid))
	}

	/// Ensures the association covers `cuid`/`tsuid`, closing and reopening
	/// if a genuinely new SOP class or transfer syntax was just added.
	#[instrument(skip(self), fields(called_aet = %self.called_node.aet))]
	pub async fn prepare(&self, cuid: &str, tsuid: &str) -> Result<(), ScuError> {
		let added = self.add_presentation_context(cuid, tsuid).await;
		let mut inner = self.inner.lock().await;

		let needs_reopen = inner.association.is_some()
			&& (added || !Self::already_negotiated(&inner, cuid, tsuid));

		if needs_reopen {
			debug!(cuid, tsuid, "new presentation context, closing before reopen");
			drop(inner);
			self.close(false).await;
			inner = self.inner.lock().await;
		}

		if inner.association.is_none() {
			drop(inner);
			self.open().await?;
		}
		Ok(())
	}

	/// Opens a new association using the accumulated presentation context
	/// groups. Must be serialized with other open/close calls on this SCU.
	#[instrument(skip(self), fields(called_aet = %self.called_node.aet))]
	pub async fn open(&self) -> Result<(), ScuError> {
		let mut inner = self.inner.lock().await;
		Self::disarm_idle(&mut inner);

		let contexts: Vec<ProposedContext> = inner
			.groups
			.iter()
			.map(|group| ProposedContext {
				abstract_syntax: group.cuid.clone(),
				transfer_syntaxes: group.tsuids.clone(),
			})
			.collect();

		let address = self.resolve_address()?;
		let options = ClientAssociationOptions {
			calling_aet: self.calling_node.aet.clone(),
			called_aet: self.called_node.aet.clone(),
			address,
			contexts,
		};

		let association = ClientAssociation::new(options)
			.await
			.map_err(ScuError::ConnectFailed)?;

		inner.negotiated_at_open = inner.groups.clone();
		inner.accepted_tsuid.clear();
		for (group, pctx) in inner.groups.iter().zip(association.presentation_contexts()) {
			inner
				.accepted_tsuid
				.insert(group.cuid.clone(), pctx.transfer_syntax.clone());
		}
		inner.association = Some(association);
		inner.progress.connected();
		self.pausing.store(false, Ordering::SeqCst);
		self.pause_notify.notify_waiters();

		info!("opened outbound association");
		Ok(())
	}

	fn resolve_address(&self) -> Result<SocketAddr, ScuError> {
		let host = self.called_node.hostname.as_deref().unwrap_or("127.0.0.1");
		let port = self.called_node.port.unwrap_or(104);
		format!("{host}:{port}")
			.parse()
			.or_else(|_| {
				use std::net::ToSocketAddrs;
				format!("{host}:{port}")
					.to_socket_addrs()
					.ok()
					.and_then(|mut addrs| addrs.next())
					.ok_or(())
			})
			.map_err(|()| ScuError::ConnectFailed(AssociationError::OsThread(std::io::Error::other("unresolvable destination address"))))
	}

	/// Issues an outbound C-STORE. Blocks up to 5 s if a close is in
	/// progress.
	#[instrument(skip(self, dataset), fields(cuid, iuid))]
	pub async fn cstore(
		&self,
		cuid: &str,
		iuid: &str,
		dataset: InMemDicomObject,
		priority: Priority,
		tsuid: &str,
	) -> Result<US, ScuError> {
		if self.pausing.load(Ordering::SeqCst) {
			let _ = tokio::time::timeout(PAUSE_TIMEOUT, self.pause_notify.notified()).await;
		}

		let mut inner = self.inner.lock().await;
		let Some(association) = inner.association.as_ref() else {
			return Err(ScuError::NotReady);
		};

		let accepted_tsuid = inner
			.accepted_tsuid
			.get(cuid)
			.ok_or_else(|| ScuError::PresentationContextUnsupported {
				cuid: cuid.to_owned(),
				tsuid: tsuid.to_owned(),
			})?
			.clone();

		let request = CStoreRequest {
			affected_sop_class_uid: cuid.to_owned(),
			affected_sop_instance_uid: iuid.to_owned(),
			message_id: next_message_id(),
			priority,
			move_originator_aet: None,
			move_originator_message_id: None,
			data_set: dataset,
		};

		association.write_message(request, None, DIMSE_TIMEOUT).await?;
		let response = association.read_message(DIMSE_TIMEOUT).await?;
		let parsed = CStoreResponse::from_command(&response.command).ok_or(ScuError::NotReady)?;
		self.record_status(&mut inner, parsed.status);

		Ok(parsed.status)
	}

	fn record_status(&self, inner: &mut Inner, status: US) {
		match Status::classify(status) {
			StatusClass::Success => inner.progress.record_completed(status, 0),
			StatusClass::Warning => inner.progress.record_warning(status, 0),
			StatusClass::Failure => {
				inner
					.progress
					.record_failed(status, format!("C-STORE-RSP status {status:#06X}"));
			}
		}

		if !matches!(Status::classify(status), StatusClass::Success)
			&& !inner.status_log.contains(&status)
		{
			if inner.status_log.len() < MAX_STATUS_LOG {
				warn!(status = format!("{status:#06X}"), "non-success C-STORE-RSP status");
				inner.status_log.push(status);
			}
		}
	}

	/// Releases the outbound association if `force` or the idle countdown
	/// had armed. Safe to call repeatedly.
	#[instrument(skip(self), fields(called_aet = %self.called_node.aet))]
	pub async fn close(&self, force: bool) {
		let mut inner = self.inner.lock().await;
		let was_armed = inner.idle_handle.is_some();
		Self::disarm_idle(&mut inner);

		if !force && !was_armed && inner.association.is_none() {
			return;
		}

		self.pausing.store(true, Ordering::SeqCst);
		if let Some(association) = inner.association.take() {
			match tokio::time::timeout(RELEASE_TIMEOUT, association.release(RELEASE_TIMEOUT)).await {
				Ok(Ok(())) => debug!("released outbound association"),
				Ok(Err(err)) => warn!("A-RELEASE failed, association dropped: {err}"),
				Err(_) => warn!("A-RELEASE timed out, association dropped"),
			}
		}
		self.pausing.store(false, Ordering::SeqCst);
		self.pause_notify.notify_waiters();
	}

	pub async fn progress(&self) -> DicomState {
		self.inner.lock().await.progress.clone()
	}

	/// The transfer syntax the peer accepted for `cuid`, if any.
	pub async fn accepted_transfer_syntax(&self, cuid: &str) -> Option<UI> {
		self.inner.lock().await.accepted_tsuid.get(cuid).cloned()
	}
}

impl Drop for StreamingStoreScu {
	fn drop(&mut self) {
		if let Ok(mut inner) = self.inner.try_lock() {
			Self::disarm_idle(&mut inner);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn scu() -> StreamingStoreScu {
		StreamingStoreScu::new(DicomNode::new("US"), DicomNode::new("THEM").with_hostname("10.0.0.1").with_port(104))
	}

	#[tokio::test]
	async fn add_presentation_context_is_idempotent_and_adds_fallbacks() {
		let scu = scu();
		assert!(scu.add_presentation_context("1.2.840.10008.5.1.4.1.1.2", "1.2.840.10008.1.2.1").await);
		assert!(!scu.add_presentation_context("1.2.840.10008.5.1.4.1.1.2", "1.2.840.10008.1.2.1").await);

		let inner = scu.inner.lock().await;
		let group = inner.groups.iter().find(|g| g.cuid == "1.2.840.10008.5.1.4.1.1.2").unwrap();
		assert!(group.tsuids.contains(&UI::from(IVR_LE)));
		assert!(group.tsuids.contains(&UI::from(EVR_LE)));
		assert_eq!(group.tsuids.len(), 3);
	}

	#[tokio::test]
	async fn distinct_cuids_each_get_their_own_fallbacks() {
		let scu = scu();
		scu.add_presentation_context("A", "X").await;
		scu.add_presentation_context("B", "Y").await;
		let inner = scu.inner.lock().await;
		assert_eq!(inner.groups.len(), 2);
	}

	#[tokio::test]
	async fn cstore_before_open_fails_not_ready() {
		let scu = scu();
		let dataset = InMemDicomObject::new_empty();
		let err = scu
			.cstore("1.2", "1.2.3", dataset, Priority::Medium, "1.2.840.10008.1.2.1")
			.await
			.unwrap_err();
		assert!(matches!(err, ScuError::NotReady));
	}

	#[tokio::test]
	async fn close_without_open_or_arming_is_a_harmless_no_op() {
		let scu = scu();
		scu.close(false).await;
	}

	use crate::dimse::association::server::{ServerAssociation, ServerAssociationOptions};

	/// Binds a loopback listener and spawns a task that accepts `accepts`
	/// inbound associations in sequence, handing each established
	/// [`ServerAssociation`] to `on_accept` before looping for the next one.
	/// Mirrors the manual accept/establish pattern the inbound SCP itself
	/// uses in `process()`.
	fn spawn_loopback_acceptor(
		accepts: usize,
	) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<ServerAssociation>, JoinHandle<()>) {
		let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		std_listener.set_nonblocking(true).unwrap();
		let addr = std_listener.local_addr().unwrap();
		let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
		let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

		let handle = tokio::spawn(async move {
			for _ in 0..accepts {
				let (stream, peer) = listener.accept().await.unwrap();
				let tcp_stream = stream.into_std().unwrap();
				tcp_stream.set_nonblocking(false).unwrap();
				let association = ServerAssociation::new(ServerAssociationOptions {
					aet: String::from("THEM"),
					tcp_stream,
					peer_address: peer,
					transfer_syntaxes: Vec::new(),
				})
				.await
				.expect("server association establishment failed");
				if tx.send(association).is_err() {
					return;
				}
			}
		});

		(addr, rx, handle)
	}

	/// Answers one A-RELEASE-RQ/RP round trip on the acceptor side. `dicom-ul`'s
	/// server association has no one-call `release()`; the acceptor must
	/// explicitly wait for the peer's ReleaseRQ and reply ReleaseRP.
	async fn answer_release(association: &ServerAssociation) {
		let pdu = association.receive(RELEASE_TIMEOUT).await.expect("expected ReleaseRQ");
		assert!(matches!(pdu, dicom::ul::Pdu::ReleaseRQ));
		association.send(dicom::ul::Pdu::ReleaseRP, RELEASE_TIMEOUT).await.expect("failed to send ReleaseRP");
	}

	#[tokio::test]
	async fn prepare_reopens_the_association_when_a_new_transfer_syntax_is_added() {
		let cuid = "1.2.840.10008.5.1.4.1.1.2";
		let (addr, mut accepted, server_handle) = spawn_loopback_acceptor(2);

		let scu = StreamingStoreScu::new(
			DicomNode::new("US"),
			DicomNode::new("THEM").with_hostname(addr.ip().to_string()).with_port(addr.port()),
		);

		scu.prepare(cuid, EVR_LE).await.unwrap();
		let first = accepted.recv().await.expect("first association not accepted");
		assert!(first.presentation_contexts().iter().any(|pctx| pctx.transfer_syntax == EVR_LE));

		// A transfer syntax outside the EVR_LE/IVR_LE fallback set forces
		// `prepare` to close the first association before reopening.
		let jpeg_baseline = "1.2.840.10008.1.2.4.50";
		let (close_result, ()) = tokio::join!(scu.prepare(cuid, jpeg_baseline), answer_release(&first));
		close_result.unwrap();

		let second = accepted.recv().await.expect("second association not accepted");
		assert!(second.presentation_contexts().iter().any(|pctx| pctx.transfer_syntax == jpeg_baseline));

		scu.close(true).await;
		answer_release(&second).await;
		server_handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn idle_close_releases_the_association_after_fifteen_seconds() {
		let cuid = "1.2.840.10008.5.1.4.1.1.2";
		let (addr, mut accepted, server_handle) = spawn_loopback_acceptor(1);

		let scu = Arc::new(StreamingStoreScu::new(
			DicomNode::new("US"),
			DicomNode::new("THEM").with_hostname(addr.ip().to_string()).with_port(addr.port()),
		));

		scu.prepare(cuid, EVR_LE).await.unwrap();
		let association = accepted.recv().await.expect("association not accepted");
		assert!(scu.inner.lock().await.association.is_some());

		scu.trigger_idle_close().await;

		tokio::time::advance(IDLE_TIMEOUT / 2).await;
		assert!(scu.inner.lock().await.association.is_some(), "must not close before the idle timeout elapses");

		let release_handle = tokio::spawn(async move { answer_release(&association).await });
		tokio::time::advance(IDLE_TIMEOUT).await;
		release_handle.await.unwrap();
		server_handle.await.unwrap();

		assert!(scu.inner.lock().await.association.is_none(), "idle timer must close the association");
	}

	#[tokio::test]
	async fn cstore_unblocks_promptly_once_a_concurrent_pause_clears() {
		let scu = Arc::new(scu());
		scu.pausing.store(true, Ordering::SeqCst);

		// Simulate a concurrent `close()`/`open()` clearing the pause partway
		// through the `PAUSE_TIMEOUT` busy-wait.
		let notify_after = Duration::from_millis(50);
		tokio::spawn({
			let scu = Arc::clone(&scu);
			async move {
				tokio::time::sleep(notify_after).await;
				scu.pausing.store(false, Ordering::SeqCst);
				scu.pause_notify.notify_waiters();
			}
		});

		let started = tokio::time::Instant::now();
		let dataset = InMemDicomObject::new_empty();
		let err = scu
			.cstore("1.2", "1.2.3", dataset, Priority::Medium, "1.2.840.10008.1.2.1")
			.await
			.unwrap_err();
		assert!(matches!(err, ScuError::NotReady));
		assert!(started.elapsed() < PAUSE_TIMEOUT, "cstore must wake on notify, not wait out the full pause timeout");
	}
}
