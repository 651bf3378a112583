//! A small web application framework driven by one YAML file.
//!
//! An application loads its [`Settings`] with a [`CroquetBuilder`], registers pages,
//! resources, entities and modules on it, then [`Croquet::start`]s. The [`crm`] module is
//! a complete example application built this way.

pub mod builder;
pub mod croquet;
pub mod crm;
pub mod datasource;
pub mod durable;
pub mod error;
pub mod inject;
pub mod lifecycle;
pub mod logging;
pub mod persistence;
pub mod pid;
pub mod server;
pub mod settings;
pub mod tester;
pub mod ui;

pub use builder::{load_settings, CroquetBuilder};
pub use croquet::{Croquet, RunningCroquet};
pub use error::{
    ConfigError, CroquetError, LifecycleError, LoggingError, PersistError, PidError,
};
pub use inject::{AppContext, Bindings, InjectError, Module};
pub use lifecycle::{ManagedModule, Status};
pub use settings::{NoExtension, Settings};
pub use tester::CroquetTester;
