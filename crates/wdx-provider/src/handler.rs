//! Per-parameter handler mediating between a parameter ID and its providers.

use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};
use wdx_core::{Future, Promise, ServiceError, ServiceResult, StatusCode, promise};

use crate::provider::FileProvider;

/// Identifier of a parameter in the device model.
pub type ParameterId = u32;
/// Opaque identifier a registered provider is addressed by in the file API.
pub type FileId = String;
/// Builds a provider; `readonly` selects the published or the writable kind.
pub type ProviderFactory = Box<dyn Fn(bool) -> Arc<FileProvider> + Send + Sync>;

/// The backend's registration surface for file providers.
///
/// The handler stays the unique owner of its providers; the registry only
/// borrows one for the duration of the registration call and afterwards
/// addresses it by the file-ID it assigned.
pub trait ProviderRegistry: Send + Sync {
    /// Registers a provider under a parameter and eventually yields its
    /// file-ID.
    fn register_file_provider(
        &self,
        provider: Arc<FileProvider>,
        parameter_id: ParameterId,
    ) -> Future<FileId>;

    /// Removes a previously registered provider.
    fn unregister_file_provider(&self, file_id: &str);
}

struct ReadSlot {
    provider: Option<Arc<FileProvider>>,
    file_id: Option<FileId>,
    registration_failed: bool,
    pending: Vec<Promise<FileId>>,
}

struct WriteSlot {
    provider: Option<Arc<FileProvider>>,
    file_id: Option<FileId>,
}

struct HandlerState {
    parameter_id: ParameterId,
    registry: Arc<dyn ProviderRegistry>,
    factory: ProviderFactory,
    // lock order: write slot before read slot
    write_slot: Mutex<WriteSlot>,
    read_slot: Mutex<ReadSlot>,
}

impl HandlerState {
    fn lock_write(&self) -> MutexGuard<'_, WriteSlot> {
        self.write_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_read(&self) -> MutexGuard<'_, ReadSlot> {
        self.read_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registers one readonly and at most one writable provider for a parameter
/// and swaps them atomically on a successful finish.
pub struct FileParameterHandler {
    state: Arc<HandlerState>,
}

impl FileParameterHandler {
    /// Creates the handler and immediately registers a readonly provider.
    ///
    /// A registration failure is latched: later [`FileParameterHandler::get_file_id`]
    /// calls report it instead of hanging.
    pub fn new(
        parameter_id: ParameterId,
        registry: Arc<dyn ProviderRegistry>,
        factory: ProviderFactory,
    ) -> Self {
        let state = Arc::new(HandlerState {
            parameter_id,
            registry,
            factory,
            write_slot: Mutex::new(WriteSlot {
                provider: None,
                file_id: None,
            }),
            read_slot: Mutex::new(ReadSlot {
                provider: None,
                file_id: None,
                registration_failed: false,
                pending: Vec::new(),
            }),
        });

        let provider = (state.factory)(true);
        state.lock_read().provider = Some(Arc::clone(&provider));
        let registration = state
            .registry
            .register_file_provider(provider, parameter_id);
        let notified = Arc::clone(&state);
        registration.set_notifier(move |result| {
            let mut slot = notified.lock_read();
            match result {
                Ok(file_id) => {
                    slot.file_id = Some(file_id.clone());
                    for pending in slot.pending.drain(..) {
                        pending.resolve(file_id.clone());
                    }
                }
                Err(inner) => {
                    slot.provider = None;
                    slot.registration_failed = true;
                    error!(
                        parameter_id,
                        error = %inner,
                        "failed to register file provider for read purposes"
                    );
                    for pending in slot.pending.drain(..) {
                        pending.fail(read_registration_error());
                    }
                }
            }
        });

        Self { state }
    }

    /// The parameter this handler serves.
    #[must_use]
    pub fn parameter_id(&self) -> ParameterId {
        self.state.parameter_id
    }

    /// Current read file-ID.
    ///
    /// Resolves once the initial registration completed; carries the latched
    /// error when that registration failed.
    pub fn get_file_id(&self) -> Future<FileId> {
        let mut slot = self.state.lock_read();
        if let Some(file_id) = &slot.file_id {
            return Future::resolved(file_id.clone());
        }
        if slot.registration_failed {
            return Future::failed(read_registration_error());
        }
        let (pending, future) = promise();
        slot.pending.push(pending);
        future
    }

    /// Creates and registers a fresh writable provider, replacing any prior
    /// one, and yields its file-ID.
    pub fn create_file_id_for_write(&self, context: ParameterId) -> Future<FileId> {
        let (result, future) = promise();
        let mut slot = self.state.lock_write();
        if let Some(previous) = slot.file_id.take() {
            self.state.registry.unregister_file_provider(&previous);
        }
        let provider = (self.state.factory)(false);
        slot.provider = Some(Arc::clone(&provider));
        // release the slot before wiring the notifier: it may fire inline
        drop(slot);

        let registration = self
            .state
            .registry
            .register_file_provider(provider, context);
        let notified = Arc::clone(&self.state);
        registration.set_notifier(move |outcome| match outcome {
            Ok(file_id) => {
                notified.lock_write().file_id = Some(file_id.clone());
                result.resolve(file_id);
            }
            Err(inner) => {
                error!(
                    error = %inner,
                    "error while creating file ID: failed to register file provider for write purposes"
                );
                result.fail(ServiceError::internal(format!(
                    "failed to register file provider for write purposes: {inner}"
                )));
            }
        });
        future
    }

    /// Unregisters the active write provider; `file_id` must match it.
    pub fn remove_file_id_for_write(&self, file_id: &str) -> ServiceResult<()> {
        let mut slot = self.state.lock_write();
        match &slot.file_id {
            None => Err(ServiceError::logic("no write operation was initiated before")),
            Some(active) if active != file_id => Err(ServiceError::new(
                StatusCode::FileIdMismatch,
                "given file ID for write is not the currently active write file ID",
            )),
            Some(_) => {
                if let Some(active) = slot.file_id.take() {
                    self.state.registry.unregister_file_provider(&active);
                }
                slot.provider = None;
                Ok(())
            }
        }
    }

    /// Finishes the upload addressed by `file_id` and swaps it into the read
    /// slot.
    ///
    /// Runs completeness check, validation and finish in order; any failure
    /// leaves both slots unchanged.
    pub fn set_file_id<F>(&self, file_id: &str, validator: F) -> ServiceResult<()>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<bool>,
    {
        let mut write_slot = self.state.lock_write();
        let active = write_slot
            .file_id
            .as_deref()
            .ok_or_else(|| ServiceError::logic("no write operation was initiated before"))?;
        if active != file_id {
            return Err(ServiceError::new(
                StatusCode::FileIdMismatch,
                "given file ID for write is not the currently active write file ID",
            ));
        }
        let provider = write_slot
            .provider
            .clone()
            .ok_or_else(|| ServiceError::logic("no write operation was initiated before"))?;

        if !provider.is_complete()? {
            return Err(ServiceError::invalid_value(format!(
                "written data for file ID {file_id} is not complete"
            )));
        }
        provider.validate(validator).map_err(|inner| {
            warn!(file_id, error = %inner, "failed to validate written data");
            ServiceError::invalid_value(format!(
                "failed to validate written data for file ID {file_id}: {inner}"
            ))
        })?;
        provider.finish().map_err(|inner| {
            warn!(file_id, error = %inner, "failed to finish write");
            ServiceError::internal(format!(
                "failed to finally finish write for file ID {file_id}: {inner}"
            ))
        })?;

        let mut read_slot = self.state.lock_read();
        if let Some(previous) = read_slot.file_id.take() {
            self.state.registry.unregister_file_provider(&previous);
        }
        read_slot.provider = write_slot.provider.take();
        read_slot.file_id = write_slot.file_id.take();
        read_slot.registration_failed = false;
        debug!(parameter_id = self.state.parameter_id, "write provider promoted to read slot");
        Ok(())
    }

    /// The provider currently serving reads, if registration has completed.
    #[must_use]
    pub fn read_provider(&self) -> Option<Arc<FileProvider>> {
        self.state.lock_read().provider.clone()
    }
}

impl Drop for FileParameterHandler {
    fn drop(&mut self) {
        let mut write_slot = self.state.lock_write();
        let mut read_slot = self.state.lock_read();
        if let Some(file_id) = read_slot.file_id.take() {
            self.state.registry.unregister_file_provider(&file_id);
        }
        read_slot.provider = None;
        if let Some(file_id) = write_slot.file_id.take() {
            self.state.registry.unregister_file_provider(&file_id);
        }
        write_slot.provider = None;
    }
}

fn read_registration_error() -> ServiceError {
    ServiceError::internal("failed to register file provider for read purposes")
}
