use axum::Router;
use config::{Config, Environment, File, FileFormat};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

use crate::croquet::{Croquet, ManagedModuleFactory};
use crate::error::{ConfigError, CroquetError};
use crate::inject::{AppContext, Module};
use crate::lifecycle::ManagedModule;
use crate::logging;
use crate::persistence::{Entity, EntityDef};
use crate::settings::{FileSettings, LoggingSettings, NoExtension, Settings};
use crate::tester::CroquetTester;
use crate::ui::{HealthCheck, Page, Resource, WebParts, HEALTH_CHECK_ID};

pub const ENV_PREFIX: &str = "CROQUET";

/// Reads the YAML file and applies `CROQUET__*` environment overrides.
pub fn load_settings<E: DeserializeOwned>(path: &Path) -> Result<Settings<E>, ConfigError> {
    let load_error = |reason: String| ConfigError::Load {
        file: path.display().to_string(),
        reason,
    };

    let config = Config::builder()
        .add_source(File::from(path).format(FileFormat::Yaml))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| load_error(e.to_string()))?;

    let mut settings: Settings<E> = config
        .try_deserialize()
        .map_err(|e| load_error(e.to_string()))?;
    settings.normalize();
    Ok(settings)
}

/// Collects settings, pages, resources and modules, then builds a [`Croquet`].
pub struct CroquetBuilder<E = NoExtension> {
    settings: Settings<E>,
    parts: WebParts,
    entities: Vec<EntityDef>,
    dialect: Option<String>,
    modules: Vec<Box<dyn Module>>,
    managed: Vec<ManagedModuleFactory>,
}

impl<E> CroquetBuilder<E>
where
    E: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Loads the YAML file named by the first program argument. Exits the process if
    /// it is missing or cannot be loaded.
    pub fn create(args: &[String]) -> Self {
        let Some(path) = args.get(1) else {
            eprintln!("{}", ConfigError::MissingArgument);
            std::process::exit(-1);
        };

        match Self::from_path(path) {
            Ok(builder) => builder,
            Err(e) => {
                error!("Unable to load '{}': {}", path, e);
                eprintln!("Unable to load '{}' because: {}", path, e);
                std::process::exit(-1);
            }
        }
    }

    /// Loads settings and configures logging from them.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CroquetError> {
        let path = path.as_ref();
        let settings = load_settings::<E>(path)?;
        logging::configure(&settings.logging)?;
        info!("Loaded settings from {}", path.display());
        Ok(Self::from_settings(settings))
    }

    /// Uses already loaded settings. Logging is left as it is.
    pub fn from_settings(mut settings: Settings<E>) -> Self {
        settings.normalize();
        Self {
            settings,
            parts: WebParts::default(),
            entities: Vec::new(),
            dialect: None,
            modules: Vec::new(),
            managed: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings<E> {
        &self.settings
    }

    /// The application's own keys from the YAML file.
    pub fn app_settings(&self) -> &E {
        &self.settings.app
    }

    /// Registers `page` and serves it at `/`.
    pub fn home_page(mut self, id: &str, page: impl Page) -> Self {
        self.parts.pages.register(id, page);
        self.settings.ui.home_page = Some(id.to_string());
        self
    }

    /// Registers `page` and serves it at `/login` unless it is mounted elsewhere.
    pub fn login_page(mut self, id: &str, page: impl Page) -> Self {
        self.parts.pages.register(id, page);
        self.settings.ui.login_page = Some(id.to_string());
        self
    }

    /// Registers `page` as the one rendering failed requests.
    pub fn exception_page(mut self, id: &str, page: impl Page) -> Self {
        self.parts.pages.register(id, page);
        self.settings.ui.exception_page = Some(id.to_string());
        self
    }

    pub fn add_page(mut self, id: &str, page: impl Page) -> Self {
        self.parts.pages.register(id, page);
        self
    }

    pub fn add_page_mount(mut self, path: &str, id: &str) -> Self {
        self.settings.ui.pages.insert(path.to_string(), id.to_string());
        self
    }

    pub fn add_resource(mut self, id: &str, resource: impl Resource) -> Self {
        self.parts.resources.register(id, resource);
        self
    }

    pub fn add_resource_mount(mut self, path: &str, id: &str) -> Self {
        self.settings
            .ui
            .resources
            .insert(path.to_string(), id.to_string());
        self
    }

    pub fn add_health_check(self, path: &str) -> Self {
        self.add_resource(HEALTH_CHECK_ID, HealthCheck)
            .add_resource_mount(path, HEALTH_CHECK_ID)
    }

    /// Merges a REST router into the application.
    pub fn add_router(mut self, router: Router<AppContext>) -> Self {
        self.parts.routers.push(router);
        self
    }

    pub fn add_entity<T: Entity>(mut self) -> Self {
        self.entities.push(EntityDef::of::<T>());
        self
    }

    pub fn add_db_property(mut self, key: &str, value: &str) -> Self {
        match self.settings.db.as_mut() {
            Some(db) => {
                db.properties.insert(key.to_string(), value.to_string());
            }
            None => warn!("Ignoring database property '{}', no database is configured", key),
        }
        self
    }

    /// Overrides the SQL dialect after the settings are checked.
    pub fn sql_dialect(mut self, dialect: &str) -> Self {
        self.dialect = Some(dialect.to_string());
        self
    }

    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings.pid_file = Some(path.into());
        self
    }

    pub fn add_css(mut self, name: &str) -> Self {
        self.settings.ui.css_resources.push(name.to_string());
        self
    }

    pub fn add_js(mut self, name: &str) -> Self {
        self.settings.ui.js_resources.push(name.to_string());
        self
    }

    pub fn add_module(mut self, module: impl Module + 'static) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    /// Adds a module started after persistence and stopped before it.
    pub fn add_managed_module<M, F>(mut self, factory: F) -> Self
    where
        M: ManagedModule + 'static,
        F: Fn(&AppContext) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        self.managed.push(Box::new(move |ctx| {
            factory(ctx).map(|module| Box::new(module) as Box<dyn ManagedModule>)
        }));
        self
    }

    pub fn build(mut self) -> Result<Croquet<E>, ConfigError> {
        check_db_settings(&self.settings)?;
        check_logging_settings(&self.settings.logging)?;

        if let Some(db) = self.settings.db.as_mut() {
            db.entities.append(&mut self.entities);
            if let Some(dialect) = self.dialect.take() {
                db.dialect = Some(dialect);
            }
        } else if !self.entities.is_empty() {
            warn!(
                "{} entities registered but no database is configured",
                self.entities.len()
            );
        }

        Ok(Croquet::new(
            self.settings,
            self.parts,
            self.modules,
            self.managed,
        ))
    }

    /// Like [`CroquetBuilder::build`] but exits the process on invalid settings.
    pub fn build_or_die(self) -> Croquet<E> {
        match self.build() {
            Ok(croquet) => croquet,
            Err(e) => {
                error!("{}", e);
                eprintln!("{}", e);
                std::process::exit(-1);
            }
        }
    }

    /// Starts everything except the listener.
    pub async fn build_tester(self) -> Result<CroquetTester, CroquetError> {
        CroquetTester::start(self.build()?).await
    }
}

pub fn check_db_settings<E>(settings: &Settings<E>) -> Result<(), ConfigError> {
    match &settings.db {
        Some(db) if db.persistence_unit.is_some() && db.has_connection_parameters() => {
            Err(ConfigError::ConflictingDatabaseSettings)
        }
        _ => Ok(()),
    }
}

pub fn check_logging_settings(logging: &LoggingSettings) -> Result<(), ConfigError> {
    let file = &logging.file;
    if file.enabled && file.current_log_filename.is_none() {
        return Err(ConfigError::MissingLogFilename);
    }
    for warning in logging_warnings(file) {
        warn!("{}", warning);
    }
    Ok(())
}

/// Settings that are legal but probably not what was meant.
fn logging_warnings(file: &FileSettings) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if !file.enabled && file.current_log_filename.is_some() {
        warnings.push("You specified a log file, but have it disabled");
    }
    if file.enabled && file.archive && file.archived_log_filename_pattern.is_none() {
        warnings.push(
            "Log archiving is enabled but no archived_log_filename_pattern is set, using the default",
        );
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::DatabaseSettings;
    use serde::Deserialize;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    struct Extra {
        #[serde(rename = "current-user", default)]
        current_user: Option<String>,
    }

    #[test]
    fn test_load_yaml_with_application_keys() {
        let file = yaml(
            "port: 9090\n\
             development: true\n\
             current-user: ada\n\
             db:\n  jdbc_url: \"sqlite::memory:\"\n  max_active: 4\n\
             ui:\n  pages:\n    /people: people\n",
        );
        let settings = load_settings::<Extra>(file.path()).unwrap();

        assert_eq!(settings.port, 9090);
        assert_eq!(settings.app.current_user.as_deref(), Some("ada"));
        let db = settings.db.as_ref().unwrap();
        assert_eq!(db.url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(db.max_active, 4);
        assert_eq!(db.min_idle, 2);
        assert_eq!(settings.ui.pages.get("/people").map(String::as_str), Some("people"));
        assert!(settings.ui.is_development());
        assert!(settings.ui.debug_toolbar());
    }

    #[test]
    fn test_missing_file_is_a_load_error() {
        let result = load_settings::<NoExtension>(Path::new("/nonexistent/croquet.yml"));
        assert!(matches!(result, Err(ConfigError::Load { .. })));
    }

    #[test]
    fn test_persistence_unit_conflicts_with_connection_settings() {
        let mut settings = Settings::<NoExtension>::default();
        settings.db = Some(DatabaseSettings {
            persistence_unit: Some("crm".to_string()),
            dialect: Some("postgres".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            check_db_settings(&settings),
            Err(ConfigError::ConflictingDatabaseSettings)
        ));

        settings.db = Some(DatabaseSettings {
            persistence_unit: Some("crm".to_string()),
            ..Default::default()
        });
        assert!(check_db_settings(&settings).is_ok());

        let built = CroquetBuilder::from_settings(settings)
            .sql_dialect("postgres")
            .build();
        assert!(built.is_ok());
    }

    #[test]
    fn test_file_logging_needs_a_filename() {
        let mut logging = LoggingSettings::default();
        assert!(check_logging_settings(&logging).is_ok());

        logging.file.enabled = true;
        assert!(matches!(
            check_logging_settings(&logging),
            Err(ConfigError::MissingLogFilename)
        ));

        logging.file.current_log_filename = Some(PathBuf::from("croquet.log"));
        assert!(check_logging_settings(&logging).is_ok());
    }

    #[test]
    fn test_disabled_log_file_with_a_name_is_warned_about() {
        let mut file = FileSettings::default();
        assert!(logging_warnings(&file).is_empty());

        file.current_log_filename = Some(PathBuf::from("croquet.log"));
        assert_eq!(
            logging_warnings(&file),
            vec!["You specified a log file, but have it disabled"]
        );

        let mut logging = LoggingSettings::default();
        logging.file = file;
        assert!(check_logging_settings(&logging).is_ok());

        logging.file.enabled = true;
        logging.file.archived_log_filename_pattern = Some("croquet-%d.log".to_string());
        assert!(logging_warnings(&logging.file).is_empty());
    }

    #[test]
    fn test_setters_shape_the_ui_settings() {
        let builder = CroquetBuilder::from_settings(Settings::<NoExtension>::default())
            .add_health_check("/health")
            .add_page_mount("/people", "people")
            .add_css("crm.css")
            .pid_file("croquet.pid");

        let settings = builder.settings();
        assert_eq!(
            settings.ui.resources.get("/health").map(String::as_str),
            Some(HEALTH_CHECK_ID)
        );
        assert_eq!(settings.ui.pages.len(), 1);
        assert_eq!(settings.ui.css_resources, vec!["crm.css"]);
        assert_eq!(settings.pid_file, Some(PathBuf::from("croquet.pid")));
    }
}
