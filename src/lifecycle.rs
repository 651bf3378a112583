use async_trait::async_trait;
use log::{error, info};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::LifecycleError;

/// Where the application is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Status {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Status::Starting,
            2 => Status::Running,
            3 => Status::Stopping,
            _ => Status::Stopped,
        }
    }

    /// The only state each state may be entered from.
    fn predecessor(self) -> Self {
        match self {
            Status::Starting => Status::Stopped,
            Status::Running => Status::Starting,
            Status::Stopping => Status::Running,
            Status::Stopped => Status::Stopping,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Stopped => "STOPPED",
            Status::Starting => "STARTING",
            Status::Running => "RUNNING",
            Status::Stopping => "STOPPING",
        };
        f.write_str(name)
    }
}

/// Atomically held [`Status`]; moves only along Stopped, Starting, Running, Stopping.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Status::Stopped as u8))
    }

    pub fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`. Fails if that is not the next step or the current
    /// status is not `from`.
    pub fn transition(&self, from: Status, to: Status) -> Result<(), LifecycleError> {
        if to.predecessor() != from {
            return Err(LifecycleError::IllegalTransition { from, to });
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| LifecycleError::IllegalTransition {
                from: Status::from_u8(actual),
                to,
            })
    }

    /// Back to Stopped after a start that did not complete.
    pub(crate) fn abort_start(&self) {
        let _ = self.0.compare_exchange(
            Status::Starting as u8,
            Status::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A component with start and stop hooks run by the application.
#[async_trait]
pub trait ManagedModule: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn start(&mut self) -> anyhow::Result<()>;

    async fn stop(&mut self) -> anyhow::Result<()>;
}

/// Started modules, kept in registration order.
#[derive(Default)]
pub struct ModuleSet {
    modules: Vec<Box<dyn ManagedModule>>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Starts `module` and keeps it if that worked.
    pub async fn start(&mut self, mut module: Box<dyn ManagedModule>) -> Result<(), LifecycleError> {
        let name = module.name().to_string();
        info!("Starting module {}", name);
        module
            .start()
            .await
            .map_err(|source| LifecycleError::Module { name, source })?;
        self.modules.push(module);
        Ok(())
    }

    /// Stops every module in registration order. Failures are logged, not returned.
    pub async fn stop_all(&mut self) {
        for mut module in self.modules.drain(..) {
            info!("Stopping module {}", module.name());
            if let Err(e) = module.stop().await {
                error!("Error stopping module {}: {:#}", module.name(), e);
            }
        }
    }
}
