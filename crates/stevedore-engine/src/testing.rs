//! Test support: a call-recording backend and a pre-wired controller.
//!
//! Used by the engine's own tests and by downstream crates exercising the
//! deploy pipeline without a container runtime.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use stevedore_core::{
    Backend, Context, Discovery, InstanceHandle, InstanceStatus, Result, RunConfig,
    StaticDiscovery, Store,
};

use crate::interface::ControllerInterface;
use crate::plugin::{Plugin, PluginList};
use crate::settings::EngineSettings;

/// One recorded backend invocation.
#[derive(Debug, Clone)]
pub enum BackendCall {
    Prepare(RunConfig),
    Start(RunConfig),
    Terminate(InstanceHandle),
    Once(RunConfig),
}

/// A [`Backend`] that records every call and never touches a container
/// runtime.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    once_exit: AtomicI64,
    counter: AtomicUsize,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Exit code returned by subsequent [`Backend::once`] calls.
    pub fn set_once_exit(&self, code: i64) {
        self.once_exit.store(code, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn starts(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, BackendCall::Start(_)))
            .count()
    }

    pub fn terminations(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, BackendCall::Terminate(_)))
            .count()
    }

    pub fn once_runs(&self) -> Vec<RunConfig> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                BackendCall::Once(runcfg) => Some(runcfg.clone()),
                _ => None,
            })
            .collect()
    }

    /// The runcfg of the most recent `start` or `once` call.
    pub fn last_runcfg(&self) -> Option<RunConfig> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            BackendCall::Start(runcfg) | BackendCall::Once(runcfg) => Some(runcfg.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn prepare(&self, runcfg: &RunConfig, _service: &str) -> Result<InstanceHandle> {
        self.calls.lock().push(BackendCall::Prepare(runcfg.clone()));
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(InstanceHandle {
            id: format!("container-{n}"),
            name: runcfg.name.clone(),
        })
    }

    async fn start(
        &self,
        runcfg: &RunConfig,
        _service: &str,
        handle: InstanceHandle,
    ) -> Result<InstanceHandle> {
        self.calls.lock().push(BackendCall::Start(runcfg.clone()));
        Ok(handle)
    }

    async fn terminate(&self, handle: &InstanceHandle) -> Result<()> {
        self.calls.lock().push(BackendCall::Terminate(handle.clone()));
        Ok(())
    }

    async fn once(&self, runcfg: &RunConfig) -> Result<i64> {
        self.calls.lock().push(BackendCall::Once(runcfg.clone()));
        Ok(self.once_exit.load(Ordering::SeqCst))
    }

    async fn status(&self, _handle: &InstanceHandle) -> Result<InstanceStatus> {
        Ok(InstanceStatus::Running)
    }
}

/// A controller wired against a temp store, a [`RecordingBackend`] and a
/// [`StaticDiscovery`] that resolves `shelf` and `strowger-api`.
pub struct TestController {
    pub store: Store,
    pub backend: Arc<RecordingBackend>,
    pub discovery: Arc<StaticDiscovery>,
    pub plugins: PluginList,
    pub settings: Arc<EngineSettings>,
}

impl TestController {
    /// Sets up a controller under `dir` (typically a tempdir owned by the
    /// test) with the given plugin list.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>, dir: &Path) -> Result<Self> {
        let store = Store::open(dir.join("state"))?;
        let discovery = Arc::new(
            StaticDiscovery::new()
                .with_entry("shelf", "127.0.0.1:8000")
                .with_entry("strowger-api", "127.0.0.1:9000"),
        );
        Ok(TestController {
            store,
            backend: RecordingBackend::new(),
            discovery,
            plugins: Arc::new(plugins),
            settings: Arc::new(EngineSettings {
                volume_base: dir.join("volumes"),
                host_ip: "127.0.0.1".to_string(),
                slugbuilder_image: "flynn/slugbuilder".to_string(),
            }),
        })
    }

    /// Opens a fresh interface with a throwaway progress context.
    pub fn interface(&self) -> Result<ControllerInterface> {
        self.interface_with(Context::null())
    }

    pub fn interface_with(&self, ctx: Context) -> Result<ControllerInterface> {
        Ok(ControllerInterface::new(
            self.store.connection()?,
            ctx,
            self.backend.clone(),
            self.discovery.clone(),
            Arc::clone(&self.plugins),
            Arc::clone(&self.settings),
        ))
    }
}
