use axum::Router;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::{CroquetError, LifecycleError};
use crate::inject::{AppContext, Bindings, Module};
use crate::lifecycle::{ManagedModule, ModuleSet, Status, StatusCell};
use crate::persistence::PersistService;
use crate::pid::PidFile;
use crate::server;
use crate::settings::{DatabaseMode, Settings};
use crate::ui::{VisitorStore, WebParts};

/// Builds a managed module once the application context exists.
pub type ManagedModuleFactory =
    Box<dyn Fn(&AppContext) -> anyhow::Result<Box<dyn ManagedModule>> + Send + Sync>;

/// A configured application that has not been started.
pub struct Croquet<E = crate::settings::NoExtension> {
    settings: Settings<E>,
    parts: WebParts,
    modules: Vec<Box<dyn Module>>,
    managed: Vec<ManagedModuleFactory>,
    status: Arc<StatusCell>,
}

/// Everything started before the listener binds.
pub(crate) struct Prepared {
    pub(crate) context: AppContext,
    pub(crate) router: Router,
    pub(crate) states: VisitorStore,
    pub(crate) modules: ModuleSet,
    pub(crate) persist: Option<Arc<PersistService>>,
}

impl Prepared {
    /// Stops modules then persistence. Errors are logged.
    pub(crate) async fn teardown(&mut self) {
        self.modules.stop_all().await;
        if let Some(persist) = self.persist.take() {
            if persist.is_running() {
                if let Err(e) = persist.stop().await {
                    error!("Error stopping persistence: {}", e);
                }
            }
        }
    }
}

impl<E> Croquet<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        settings: Settings<E>,
        parts: WebParts,
        modules: Vec<Box<dyn Module>>,
        managed: Vec<ManagedModuleFactory>,
    ) -> Self {
        Self {
            settings,
            parts,
            modules,
            managed,
            status: Arc::new(StatusCell::new()),
        }
    }

    pub fn settings(&self) -> &Settings<E> {
        &self.settings
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Wires the context, starts persistence and managed modules and builds the router.
    /// Whatever started is stopped again on failure.
    pub(crate) async fn prepare(self) -> Result<(Prepared, Settings<E>, Arc<StatusCell>), CroquetError> {
        let Croquet {
            settings,
            parts,
            modules,
            managed,
            status,
        } = self;

        let mut bindings = Bindings::new();
        bindings.bind(settings.app.clone());
        for module in &modules {
            module.configure(&mut bindings);
        }

        let persist = match (settings.database_mode(), &settings.db) {
            (DatabaseMode::None, _) | (_, None) => None,
            (_, Some(db)) => Some(Arc::new(PersistService::new(settings.unit_name(), db.clone()))),
        };
        let context = AppContext::new(bindings, persist.clone(), settings.ui.clone());

        let mut prepared = Prepared {
            context: context.clone(),
            router: Router::new(),
            states: VisitorStore::default(),
            modules: ModuleSet::new(),
            persist: None,
        };

        if let Some(persist) = persist {
            persist.start().await?;
            prepared.persist = Some(persist);
        }

        for factory in &managed {
            let started = match factory(&context) {
                Ok(module) => prepared.modules.start(module).await,
                Err(source) => Err(LifecycleError::Module {
                    name: "factory".to_string(),
                    source,
                }),
            };
            if let Err(e) = started {
                prepared.teardown().await;
                return Err(e.into());
            }
        }

        match server::router(context, parts, prepared.states.clone()) {
            Ok(router) => prepared.router = router,
            Err(e) => {
                prepared.teardown().await;
                return Err(e.into());
            }
        }

        Ok((prepared, settings, status))
    }

    /// Starts everything and binds the listener.
    pub async fn start(self) -> Result<RunningCroquet, CroquetError> {
        let status = self.status.clone();
        status.transition(Status::Stopped, Status::Starting)?;

        match self.start_inner().await {
            Ok(running) => {
                status.transition(Status::Starting, Status::Running)?;
                info!("Croquet running on {}", running.local_addr());
                Ok(running)
            }
            Err(e) => {
                status.abort_start();
                Err(e)
            }
        }
    }

    async fn start_inner(self) -> Result<RunningCroquet, CroquetError> {
        let (mut prepared, settings, status) = self.prepare().await?;

        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                prepared.teardown().await;
                return Err(LifecycleError::Bind { addr, source }.into());
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local) => local,
            Err(source) => {
                prepared.teardown().await;
                return Err(LifecycleError::Bind { addr, source }.into());
            }
        };

        let pid = match &settings.pid_file {
            Some(path) => match PidFile::create(path) {
                Ok(pid) => Some(pid),
                Err(e) => {
                    prepared.teardown().await;
                    return Err(e.into());
                }
            },
            None => {
                warn!("No pid file configured");
                None
            }
        };

        let app = prepared.router.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP server failed: {}", e);
            }
        });
        let reaper = server::spawn_state_reaper(prepared.states.clone());

        Ok(RunningCroquet {
            local_addr,
            status,
            prepared,
            server,
            reaper,
            pid,
        })
    }

    /// Starts and waits for a shutdown signal. Exits the process if startup fails.
    pub async fn run(self) {
        let running = match self.start().await {
            Ok(running) => running,
            Err(e) => {
                error!("Unable to start: {}", e);
                eprintln!("Unable to start: {}", e);
                std::process::exit(-1);
            }
        };
        match running.wait_for_shutdown().await {
            Ok(status) => info!("Shut down, status {:?}", status),
            Err(e) => error!("Unclean shutdown: {}", e),
        }
    }
}

/// A started application.
pub struct RunningCroquet {
    local_addr: SocketAddr,
    status: Arc<StatusCell>,
    prepared: Prepared,
    server: JoinHandle<()>,
    reaper: JoinHandle<()>,
    pid: Option<PidFile>,
}

impl RunningCroquet {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &AppContext {
        &self.prepared.context
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn pid_file(&self) -> Option<&PidFile> {
        self.pid.as_ref()
    }

    /// Stops the listener without draining, then managed modules, persistence and
    /// the pid file. Returns the status reached.
    pub async fn shutdown(mut self) -> Result<Status, CroquetError> {
        self.status.transition(Status::Running, Status::Stopping)?;
        info!("Stopping croquet");

        self.server.abort();
        self.reaper.abort();
        self.prepared.teardown().await;

        if let Some(pid) = self.pid.take() {
            if let Err(e) = pid.remove() {
                warn!("{}", e);
            }
        }

        self.status.transition(Status::Stopping, Status::Stopped)?;
        info!("Croquet stopped");
        Ok(self.status.get())
    }

    /// Blocks until ctrl-c or SIGTERM, then shuts down.
    pub async fn wait_for_shutdown(self) -> Result<Status, CroquetError> {
        shutdown_signal().await;
        self.shutdown().await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::NoExtension;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl ManagedModule for Counting {
        async fn start(&mut self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            self.0.fetch_add(10, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings(dir: &TempDir) -> Settings<NoExtension> {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            pid_file: Some(dir.path().join("croquet.pid")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory: ManagedModuleFactory =
            Box::new(move |_| Ok(Box::new(Counting(counter.clone())) as Box<dyn ManagedModule>));

        let croquet = Croquet::new(settings(&dir), WebParts::default(), Vec::new(), vec![factory]);
        assert_eq!(croquet.status(), Status::Stopped);

        let running = croquet.start().await.unwrap();
        assert_eq!(running.status(), Status::Running);
        assert_ne!(running.local_addr().port(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let pid = dir.path().join("croquet.pid");
        let written = std::fs::read_to_string(&pid).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        assert_eq!(running.shutdown().await.unwrap(), Status::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert!(!pid.exists());
    }

    #[tokio::test]
    async fn test_existing_pid_file_aborts_startup() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("croquet.pid"), "1\n").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory: ManagedModuleFactory =
            Box::new(move |_| Ok(Box::new(Counting(counter.clone())) as Box<dyn ManagedModule>));

        let croquet = Croquet::new(settings(&dir), WebParts::default(), Vec::new(), vec![factory]);
        let status = croquet.status.clone();
        let result = croquet.start().await;

        assert!(matches!(result, Err(CroquetError::Pid(_))));
        assert_eq!(status.get(), Status::Stopped);
        // started then stopped again during the unwind
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("croquet.pid")).unwrap(),
            "1\n"
        );
    }
}
