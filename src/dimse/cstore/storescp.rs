use crate::cache::{CacheError, CacheLayout};
use crate::dimse::association;
use crate::dimse::cstore::{
	CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST, STORE_CANNOT_UNDERSTAND,
	STORE_OUT_OF_RESOURCES, STORE_SUCCESS,
};
use crate::dimse::{DicomMessageReader, DicomMessageWriter};
use crate::types::{trim_padding, AE, UI, US};
use anyhow::Context;
use association::server::{ServerAssociation, ServerAssociationOptions};
use association::Association;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject, Tag};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};

/// Everything the store service class provider needs to know at start time.
#[derive(Debug, Clone)]
pub struct StoreReceiverOptions {
	/// The AE title the archive uses as move destination.
	pub aet: AE,
	/// Port `0` binds an ephemeral port, see [`ReceiverHandle::local_addr`].
	pub address: SocketAddr,
	/// Only accept transfer syntaxes that can be read without a codec.
	pub uncompressed: bool,
	pub cache: CacheLayout,
	/// Upper bound for writing a C-STORE-RSP.
	pub timeout: Duration,
}

/// Snapshot of the store traffic seen by the receiver.
#[derive(Debug, Clone, Copy)]
struct Activity {
	in_flight: usize,
	stored: usize,
	failed: usize,
	last_change: Instant,
}

pub struct StoreServiceClassProvider;

struct InnerStoreServiceClassProvider {
	options: StoreReceiverOptions,
	activity: watch::Sender<Activity>,
}

impl StoreServiceClassProvider {
	/// Binds the listener and starts accepting associations in the background.
	/// Fails without spawning anything if the address cannot be bound.
	pub async fn spawn(options: StoreReceiverOptions) -> Result<ReceiverHandle, std::io::Error> {
		let listener = TcpListener::bind(options.address).await?;
		let local_addr = listener.local_addr()?;
		info!(aet = %options.aet, "Started Store Service Class Provider on {local_addr}");

		let (activity_tx, activity_rx) = watch::channel(Activity {
			in_flight: 0,
			stored: 0,
			failed: 0,
			last_change: Instant::now(),
		});
		let inner = Arc::new(InnerStoreServiceClassProvider {
			options,
			activity: activity_tx,
		});

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let task = tokio::spawn(Self::serve(listener, shutdown_rx, inner));

		Ok(ReceiverHandle {
			local_addr,
			shutdown: Some(shutdown_tx),
			task: Some(task),
			activity: activity_rx,
		})
	}

	async fn serve(
		listener: TcpListener,
		mut shutdown: oneshot::Receiver<()>,
		inner: Arc<InnerStoreServiceClassProvider>,
	) {
		let mut connections = JoinSet::new();
		loop {
			tokio::select! {
				_ = &mut shutdown => break,
				accepted = listener.accept() => match accepted {
					Ok((stream, peer)) => {
						let span = info_span!(
							"STORE-SCP",
							aet = &inner.options.aet,
							peer = peer.to_string()
						);
						info!("Accepted incoming connection from {peer}");
						let inner = Arc::clone(&inner);
						connections.spawn(
							async move {
								if let Err(err) = Self::process(stream, inner).await {
									warn!("{err:#}");
								}
							}
							.instrument(span),
						);
					}
					Err(err) => error!("Failed to accept incoming connection: {err}"),
				},
				Some(joined) = connections.join_next(), if !connections.is_empty() => {
					if let Err(err) = joined {
						if err.is_panic() {
							error!("Connection task panicked: {err}");
						}
					}
				}
			}
		}

		drop(listener);
		if !connections.is_empty() {
			debug!(
				remaining = connections.len(),
				"Aborting remaining connections"
			);
		}
		connections.shutdown().await;
		info!("Stopped Store Service Class Provider");
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// This is required because the `dicom-rs` crate does not use non-blocking reads/writes.
		// The actual reading/writing happens in ServerAssociation, which moves IO operation
		// to another thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.options.aet.clone(),
			tcp_stream,
			uncompressed: inner.options.uncompressed,
		};
		let association = ServerAssociation::new(options).await?;
		debug!(
			calling_aet = association.calling_aet(),
			"Association accepted"
		);

		loop {
			// Duration::MAX to indefinitely wait for incoming messages
			let message = match association.read_message(Duration::MAX).await {
				Ok(message) => message,
				Err(err) if err.is_release_request() => {
					association.release(inner.options.timeout).await?;
					debug!("Association released by peer");
					return Ok(());
				}
				Err(err) => return Err(err).context("Failed to read message"),
			};

			let command_field = message.command_field()?;
			if command_field != COMMAND_FIELD_COMPOSITE_STORE_REQUEST {
				anyhow::bail!(
					"Unexpected command field {command_field:#06x}. Only C-STORE-RQ is supported."
				);
			}

			let message_id = message.command_int(tags::MESSAGE_ID).unwrap_or(0);
			let sop_class_uid = message
				.command_str(tags::AFFECTED_SOP_CLASS_UID)
				.unwrap_or_default();
			let affected_sop_instance_uid = message.command_str(tags::AFFECTED_SOP_INSTANCE_UID);
			let presentation_context_id = message.presentation_context_id;
			let transfer_syntax = association
				.presentation_contexts()
				.iter()
				.find(|pctx| Some(pctx.id) == presentation_context_id)
				.or_else(|| association.presentation_contexts().first())
				.map(|pctx| UI::from(trim_padding(&pctx.transfer_syntax)))
				.context("No presentation context available")?;
			trace!(%transfer_syntax, "Received C-STORE-RQ");

			let mut store = InFlightStore::begin(&inner.activity);
			let instance = IncomingInstance {
				data: message.data,
				sop_class_uid: sop_class_uid.clone(),
				affected_sop_instance_uid: affected_sop_instance_uid.clone(),
				transfer_syntax,
			};
			let cache = inner.options.cache.clone();
			let result = tokio::task::spawn_blocking(move || instance.write(&cache))
				.await
				.context("Store task failed")?;

			let status = match result {
				Ok(path) => {
					info!(path = %path.display(), "Stored instance");
					store.succeeded();
					STORE_SUCCESS
				}
				Err(err) => {
					warn!(sop_instance_uid = ?affected_sop_instance_uid, "{err}");
					err.status()
				}
			};

			let response = CompositeStoreResponse {
				message_id,
				sop_class_uid,
				sop_instance_uid: affected_sop_instance_uid.unwrap_or_default(),
				status,
			};
			association
				.write_message(response, presentation_context_id, inner.options.timeout)
				.await?;
		}
	}
}

/// Marks a store as in flight until dropped.
struct InFlightStore<'a> {
	activity: &'a watch::Sender<Activity>,
	stored: bool,
}

impl<'a> InFlightStore<'a> {
	fn begin(activity: &'a watch::Sender<Activity>) -> Self {
		activity.send_modify(|activity| {
			activity.in_flight += 1;
			activity.last_change = Instant::now();
		});
		Self {
			activity,
			stored: false,
		}
	}

	fn succeeded(&mut self) {
		self.stored = true;
	}
}

impl Drop for InFlightStore<'_> {
	fn drop(&mut self) {
		let stored = self.stored;
		self.activity.send_modify(|activity| {
			activity.in_flight = activity.in_flight.saturating_sub(1);
			if stored {
				activity.stored += 1;
			} else {
				activity.failed += 1;
			}
			activity.last_change = Instant::now();
		});
	}
}

/// A received data set together with what the command set and the presentation context say about it.
struct IncomingInstance {
	data: Option<InMemDicomObject>,
	sop_class_uid: UI,
	affected_sop_instance_uid: Option<UI>,
	transfer_syntax: UI,
}

impl IncomingInstance {
	/// Writes the instance to `<cache_root>/<study>/<instance>.dcm`, replacing an earlier copy.
	fn write(self, cache: &CacheLayout) -> Result<PathBuf, StoreError> {
		let data = self.data.ok_or(StoreError::MissingDataSet)?;

		let study_instance_uid = element_str(&data, tags::STUDY_INSTANCE_UID)
			.ok_or(StoreError::MissingIdentifier("StudyInstanceUID"))?;
		let sop_instance_uid = element_str(&data, tags::SOP_INSTANCE_UID)
			.or(self.affected_sop_instance_uid.filter(|value| !value.is_empty()))
			.ok_or(StoreError::MissingIdentifier("SOPInstanceUID"))?;
		let sop_class_uid = element_str(&data, tags::SOP_CLASS_UID).unwrap_or(self.sop_class_uid);

		let path = cache.prepare_instance_path(&study_instance_uid, &sop_instance_uid)?;

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(sop_class_uid)
			.media_storage_sop_instance_uid(sop_instance_uid)
			.transfer_syntax(self.transfer_syntax)
			.implementation_class_uid(crate::IMPLEMENTATION_CLASS_UID)
			.implementation_version_name(crate::IMPLEMENTATION_VERSION_NAME)
			.build()?;

		data.with_exact_meta(meta)
			.write_to_file(&path)
			.map_err(|source| StoreError::Write {
				path: path.clone(),
				source,
			})?;

		Ok(path)
	}
}

fn element_str(data: &InMemDicomObject, tag: Tag) -> Option<String> {
	data.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| trim_padding(&value).to_owned())
		.filter(|value| !value.is_empty())
}

#[derive(Debug, Error)]
enum StoreError {
	#[error("C-STORE-RQ carries no data set")]
	MissingDataSet,
	#[error("Data set has no {0}")]
	MissingIdentifier(&'static str),
	#[error(transparent)]
	Cache(#[from] CacheError),
	#[error("Failed to build file meta information: {0}")]
	Meta(#[from] dicom::object::meta::Error),
	#[error("Failed to write {path}: {source}")]
	Write {
		path: PathBuf,
		source: dicom::object::WriteError,
	},
}

impl StoreError {
	/// The C-STORE-RSP status reported to the archive.
	fn status(&self) -> US {
		match self {
			Self::MissingDataSet
			| Self::MissingIdentifier(_)
			| Self::Meta(_)
			| Self::Cache(CacheError::InvalidIdentifier { .. }) => STORE_CANNOT_UNDERSTAND,
			Self::Cache(CacheError::Io { .. }) | Self::Write { .. } => STORE_OUT_OF_RESOURCES,
		}
	}
}

/// Controls a running store service class provider.
/// Dropping the handle without [`ReceiverHandle::stop`] aborts the listener in the background.
pub struct ReceiverHandle {
	local_addr: SocketAddr,
	shutdown: Option<oneshot::Sender<()>>,
	task: Option<JoinHandle<()>>,
	activity: watch::Receiver<Activity>,
}

impl ReceiverHandle {
	/// The address the listener is bound to.
	pub const fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Number of instances written to the cache so far.
	pub fn stored(&self) -> usize {
		self.activity.borrow().stored
	}

	/// Number of C-STORE-RQs that were answered with a failure status.
	pub fn failed(&self) -> usize {
		self.activity.borrow().failed
	}

	/// Waits until no store is in flight and nothing happened for `quiet`, but at most `max`.
	/// The quiet period starts no earlier than the call, so stores that are opened shortly
	/// after the final C-MOVE-RSP are still awaited.
	/// Returns whether the receiver settled in time.
	pub async fn settle(&self, quiet: Duration, max: Duration) -> bool {
		let start = Instant::now();
		let deadline = start + max;
		let mut activity = self.activity.clone();
		loop {
			let (in_flight, quiet_until) = {
				let current = activity.borrow_and_update();
				(current.in_flight, current.last_change.max(start) + quiet)
			};

			let now = Instant::now();
			if in_flight == 0 && quiet_until <= now {
				return true;
			}
			if now >= deadline {
				debug!(in_flight, "Receiver did not settle in time");
				return false;
			}

			let wake_up = if in_flight == 0 {
				quiet_until.min(deadline)
			} else {
				deadline
			};
			tokio::select! {
				changed = activity.changed() => {
					if changed.is_err() {
						// The listener is gone, nothing can change anymore.
						return activity.borrow().in_flight == 0;
					}
				}
				() = tokio::time::sleep_until(wake_up) => {}
			}
		}
	}

	/// Closes the listener, aborts open connections and waits until the port is released.
	pub async fn stop(mut self) {
		if let Some(shutdown) = self.shutdown.take() {
			let _ = shutdown.send(());
		}
		if let Some(task) = self.task.take() {
			if let Err(err) = task.await {
				error!("Store Service Class Provider failed: {err}");
			}
		}
	}
}

impl Drop for ReceiverHandle {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::VR;
	use dicom::dictionary_std::uids;

	fn options(cache: CacheLayout) -> StoreReceiverOptions {
		StoreReceiverOptions {
			aet: AE::from("DICOM-QR"),
			address: SocketAddr::from(([127, 0, 0, 1], 0)),
			uncompressed: true,
			cache,
			timeout: Duration::from_secs(5),
		}
	}

	fn instance(data: Option<InMemDicomObject>) -> IncomingInstance {
		IncomingInstance {
			data,
			sop_class_uid: UI::from(uids::CT_IMAGE_STORAGE),
			affected_sop_instance_uid: Some(UI::from("1.2.3.4.1")),
			transfer_syntax: UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
		}
	}

	#[test]
	fn writes_instance_below_study_directory() {
		let temp = tempfile::tempdir().unwrap();
		let cache = CacheLayout::new(temp.path());

		let mut data = InMemDicomObject::new_empty();
		data.put_str(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3\0");
		data.put_str(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4.2");
		data.put_str(tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);

		let path = instance(Some(data)).write(&cache).unwrap();
		assert_eq!(path, temp.path().join("1.2.3").join("1.2.3.4.2.dcm"));

		let file = dicom::object::open_file(&path).unwrap();
		assert_eq!(
			trim_padding(file.meta().media_storage_sop_instance_uid()),
			"1.2.3.4.2"
		);
	}

	#[test]
	fn falls_back_to_affected_sop_instance_uid() {
		let temp = tempfile::tempdir().unwrap();
		let cache = CacheLayout::new(temp.path());

		let mut data = InMemDicomObject::new_empty();
		data.put_str(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3");

		let path = instance(Some(data)).write(&cache).unwrap();
		assert_eq!(path, temp.path().join("1.2.3").join("1.2.3.4.1.dcm"));
	}

	#[test]
	fn missing_identifiers_cannot_be_understood() {
		let temp = tempfile::tempdir().unwrap();
		let cache = CacheLayout::new(temp.path());

		let err = instance(None).write(&cache).unwrap_err();
		assert_eq!(err.status(), STORE_CANNOT_UNDERSTAND);

		let err = instance(Some(InMemDicomObject::new_empty()))
			.write(&cache)
			.unwrap_err();
		assert!(matches!(err, StoreError::MissingIdentifier("StudyInstanceUID")));
		assert_eq!(err.status(), STORE_CANNOT_UNDERSTAND);
	}

	#[test]
	fn write_failures_are_reported_as_out_of_resources() {
		let temp = tempfile::tempdir().unwrap();
		// A regular file where the cache root should be
		let root = temp.path().join("not-a-directory");
		std::fs::write(&root, b"").unwrap();
		let cache = CacheLayout::new(&root);

		let mut data = InMemDicomObject::new_empty();
		data.put_str(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3");

		let err = instance(Some(data)).write(&cache).unwrap_err();
		assert_eq!(err.status(), STORE_OUT_OF_RESOURCES);
	}

	#[tokio::test]
	async fn reports_ephemeral_port() {
		let temp = tempfile::tempdir().unwrap();
		let handle = StoreServiceClassProvider::spawn(options(CacheLayout::new(temp.path())))
			.await
			.unwrap();

		assert_ne!(handle.local_addr().port(), 0);
		assert_eq!(handle.stored(), 0);
		assert_eq!(handle.failed(), 0);
		handle.stop().await;
	}

	#[tokio::test]
	async fn releases_port_on_stop() {
		let temp = tempfile::tempdir().unwrap();
		let handle = StoreServiceClassProvider::spawn(options(CacheLayout::new(temp.path())))
			.await
			.unwrap();
		let address = handle.local_addr();

		assert!(TcpListener::bind(address).await.is_err());
		handle.stop().await;
		assert!(TcpListener::bind(address).await.is_ok());
	}

	#[tokio::test]
	async fn settles_without_traffic() {
		let temp = tempfile::tempdir().unwrap();
		let handle = StoreServiceClassProvider::spawn(options(CacheLayout::new(temp.path())))
			.await
			.unwrap();

		let quiet = Duration::from_millis(20);
		assert!(handle.settle(quiet, Duration::from_secs(5)).await);
		handle.stop().await;
	}

	#[tokio::test]
	async fn settle_waits_a_full_quiet_period_after_the_call() {
		let (_activity, receiver) = watch::channel(Activity {
			in_flight: 0,
			stored: 0,
			failed: 0,
			last_change: Instant::now(),
		});
		let handle = ReceiverHandle {
			local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
			shutdown: None,
			task: None,
			activity: receiver,
		};
		tokio::time::sleep(Duration::from_millis(100)).await;

		let quiet = Duration::from_millis(80);
		let start = Instant::now();
		assert!(handle.settle(quiet, Duration::from_secs(5)).await);
		assert!(start.elapsed() >= quiet);
	}

	#[tokio::test]
	async fn settle_is_bounded_by_in_flight_stores() {
		let (activity, receiver) = watch::channel(Activity {
			in_flight: 0,
			stored: 0,
			failed: 0,
			last_change: Instant::now(),
		});
		let handle = ReceiverHandle {
			local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
			shutdown: None,
			task: None,
			activity: receiver,
		};

		let store = InFlightStore::begin(&activity);
		let settled = handle
			.settle(Duration::from_millis(10), Duration::from_millis(50))
			.await;
		assert!(!settled);

		drop(store);
		assert_eq!(handle.failed(), 1);
		assert!(handle
			.settle(Duration::from_millis(10), Duration::from_secs(5))
			.await);
	}
}
