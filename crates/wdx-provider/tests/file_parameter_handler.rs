//! Handler behavior: registration futures, the write slot, and the
//! swap-on-success rule.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use wdx_core::{Future, Promise, ServiceError, StatusCode, promise};
use wdx_provider::{FileId, FileParameterHandler, FileProvider, ProviderRegistry};

#[derive(Default)]
struct MockRegistry {
    next_id: AtomicU32,
    fail_registration: AtomicBool,
    registered: Mutex<Vec<(String, Arc<FileProvider>)>>,
    unregistered: Mutex<Vec<String>>,
}

impl MockRegistry {
    fn unregistered(&self) -> Vec<String> {
        self.unregistered.lock().unwrap().clone()
    }

    fn provider(&self, file_id: &str) -> Arc<FileProvider> {
        self.registered
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == file_id)
            .map(|(_, provider)| Arc::clone(provider))
            .expect("file id not registered")
    }
}

impl ProviderRegistry for MockRegistry {
    fn register_file_provider(
        &self,
        provider: Arc<FileProvider>,
        _parameter_id: u32,
    ) -> Future<FileId> {
        if self.fail_registration.swap(false, Ordering::SeqCst) {
            return Future::failed(ServiceError::internal("backend rejected registration"));
        }
        let id = format!("file-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.registered.lock().unwrap().push((id.clone(), provider));
        Future::resolved(id)
    }

    fn unregister_file_provider(&self, file_id: &str) {
        self.unregistered.lock().unwrap().push(file_id.to_owned());
    }
}

#[derive(Default)]
struct DeferredRegistry {
    pending: Mutex<Vec<Promise<FileId>>>,
}

impl DeferredRegistry {
    fn resolve_next(&self, file_id: &str) {
        let pending = self.pending.lock().unwrap().remove(0);
        pending.resolve(file_id.to_owned());
    }
}

impl ProviderRegistry for DeferredRegistry {
    fn register_file_provider(
        &self,
        _provider: Arc<FileProvider>,
        _parameter_id: u32,
    ) -> Future<FileId> {
        let (pending, future) = promise();
        self.pending.lock().unwrap().push(pending);
        future
    }

    fn unregister_file_provider(&self, _file_id: &str) {}
}

fn file_factory(dir: &Path) -> wdx_provider::ProviderFactory {
    let path = dir.join("parameter.bin");
    Box::new(move |readonly| {
        if readonly {
            Arc::new(FileProvider::for_read(&path, false, false))
        } else {
            Arc::new(FileProvider::for_new_file(&path, 1 << 20, false, 0, ""))
        }
    })
}

#[test]
fn get_file_id_reports_the_registered_read_id() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    let handler = FileParameterHandler::new(7, registry, file_factory(dir.path()));
    assert_eq!(handler.get_file_id().wait().unwrap(), "file-0");
    assert_eq!(handler.parameter_id(), 7);
}

#[test]
fn get_file_id_resolves_once_registration_completes() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(DeferredRegistry::default());
    let handler = FileParameterHandler::new(1, Arc::clone(&registry) as _, file_factory(dir.path()));

    let pending = handler.get_file_id();
    registry.resolve_next("deferred-id");
    assert_eq!(pending.wait().unwrap(), "deferred-id");
    assert_eq!(handler.get_file_id().wait().unwrap(), "deferred-id");
}

#[test]
fn read_registration_failure_is_latched() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    registry.fail_registration.store(true, Ordering::SeqCst);
    let handler = FileParameterHandler::new(1, registry, file_factory(dir.path()));

    let error = handler.get_file_id().wait().unwrap_err();
    assert_eq!(error.status, StatusCode::InternalError);
    // still latched on the second ask
    let error = handler.get_file_id().wait().unwrap_err();
    assert_eq!(error.status, StatusCode::InternalError);
}

#[test]
fn remove_file_id_requires_the_active_write_id() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    let handler =
        FileParameterHandler::new(1, Arc::clone(&registry) as _, file_factory(dir.path()));

    let error = handler.remove_file_id_for_write("file-1").unwrap_err();
    assert_eq!(error.status, StatusCode::LogicError);

    let write_id = handler.create_file_id_for_write(1).wait().unwrap();
    let error = handler.remove_file_id_for_write("bogus").unwrap_err();
    assert_eq!(error.status, StatusCode::FileIdMismatch);

    handler.remove_file_id_for_write(&write_id).unwrap();
    assert!(registry.unregistered().contains(&write_id));
}

#[test]
fn second_create_for_write_replaces_the_first() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    let handler =
        FileParameterHandler::new(1, Arc::clone(&registry) as _, file_factory(dir.path()));

    let first = handler.create_file_id_for_write(1).wait().unwrap();
    let second = handler.create_file_id_for_write(1).wait().unwrap();
    assert_ne!(first, second);
    assert!(registry.unregistered().contains(&first));
    handler.remove_file_id_for_write(&second).unwrap();
}

#[test]
fn set_file_id_swaps_the_write_provider_into_the_read_slot() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    let handler =
        FileParameterHandler::new(1, Arc::clone(&registry) as _, file_factory(dir.path()));
    let read_id = handler.get_file_id().wait().unwrap();

    let write_id = handler.create_file_id_for_write(1).wait().unwrap();
    let provider = registry.provider(&write_id);
    provider.create(4).unwrap();
    provider.write(0, b"data").unwrap();

    handler.set_file_id(&write_id, |_| Ok(true)).unwrap();

    assert!(registry.unregistered().contains(&read_id));
    assert_eq!(handler.get_file_id().wait().unwrap(), write_id);
    let error = handler.remove_file_id_for_write(&write_id).unwrap_err();
    assert_eq!(error.status, StatusCode::LogicError);
}

#[test]
fn set_file_id_rejects_a_mismatched_id() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    let handler = FileParameterHandler::new(1, registry, file_factory(dir.path()));
    handler.create_file_id_for_write(1).wait().unwrap();

    let error = handler.set_file_id("not-it", |_| Ok(true)).unwrap_err();
    assert_eq!(error.status, StatusCode::FileIdMismatch);
}

#[test]
fn set_file_id_rejects_an_incomplete_upload() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    let handler =
        FileParameterHandler::new(1, Arc::clone(&registry) as _, file_factory(dir.path()));
    let read_id = handler.get_file_id().wait().unwrap();

    let write_id = handler.create_file_id_for_write(1).wait().unwrap();
    let provider = registry.provider(&write_id);
    provider.create(100).unwrap();
    provider.write(0, &[0_u8; 50]).unwrap();

    let error = handler.set_file_id(&write_id, |_| Ok(true)).unwrap_err();
    assert_eq!(error.status, StatusCode::InvalidValue);
    // both slots unchanged
    assert_eq!(handler.get_file_id().wait().unwrap(), read_id);
    handler.remove_file_id_for_write(&write_id).unwrap();
}

#[test]
fn set_file_id_surfaces_validator_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    let handler =
        FileParameterHandler::new(1, Arc::clone(&registry) as _, file_factory(dir.path()));
    let write_id = handler.create_file_id_for_write(1).wait().unwrap();
    let provider = registry.provider(&write_id);
    provider.create(2).unwrap();
    provider.write(0, b"xy").unwrap();

    let error = handler.set_file_id(&write_id, |_| Ok(false)).unwrap_err();
    assert_eq!(error.status, StatusCode::InvalidValue);
}

#[test]
fn drop_unregisters_both_slots() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(MockRegistry::default());
    {
        let handler =
            FileParameterHandler::new(1, Arc::clone(&registry) as _, file_factory(dir.path()));
        handler.get_file_id().wait().unwrap();
        handler.create_file_id_for_write(1).wait().unwrap();
    }
    let unregistered = registry.unregistered();
    assert!(unregistered.contains(&"file-0".to_owned()));
    assert!(unregistered.contains(&"file-1".to_owned()));
}
