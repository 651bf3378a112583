use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::persistence::EntityDef;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LOG_FORMAT: &str = "%-5level %date{ISO8601} %logger:  %msg%n";
pub const DEFAULT_UNIT_NAME: &str = "croquet";

/// Extension placeholder for applications that add no keys of their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoExtension {}

/// Settings loaded from the YAML file.
///
/// Application specific keys live at the top level next to the framework keys and are
/// captured by `app`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings<E = NoExtension> {
    #[serde(default)]
    pub development: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub db: Option<DatabaseSettings>,
    #[serde(default)]
    pub ui: UiSettings,
    #[serde(flatten)]
    pub app: E,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl<E: Default> Default for Settings<E> {
    fn default() -> Self {
        Self {
            development: false,
            host: default_host(),
            port: DEFAULT_PORT,
            pid_file: None,
            logging: LoggingSettings::default(),
            db: None,
            ui: UiSettings::default(),
            app: E::default(),
        }
    }
}

/// How the application reaches its database.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DatabaseMode<'a> {
    None,
    PersistenceUnit(&'a str),
    Connection(&'a DatabaseSettings),
}

impl<E> Settings<E> {
    pub fn database_mode(&self) -> DatabaseMode<'_> {
        match &self.db {
            None => DatabaseMode::None,
            Some(db) => match &db.persistence_unit {
                Some(unit) => DatabaseMode::PersistenceUnit(unit),
                None if db.has_connection_parameters() => DatabaseMode::Connection(db),
                None => DatabaseMode::None,
            },
        }
    }

    /// Applies the development mode overrides. Applying them again changes nothing.
    pub(crate) fn normalize(&mut self) {
        self.ui.development = self.development;

        if self.development {
            self.ui.minify_resources = Some(false);
            self.ui.strip_markup_ids = Some(false);
            self.ui.stateless_checker = Some(true);
            self.ui.debug_toolbar = Some(true);

            self.logging
                .loggers
                .insert("croquet".to_string(), LogLevel(LevelFilter::Debug));
            self.logging
                .loggers
                .insert("sqlx::query".to_string(), LogLevel(LevelFilter::Debug));
        }
    }

    /// Name of the persistence unit used for registration and lookups.
    pub fn unit_name(&self) -> &str {
        self.db
            .as_ref()
            .and_then(|db| db.persistence_unit.as_deref())
            .unwrap_or(DEFAULT_UNIT_NAME)
    }
}

/// A log level as written in the YAML file. Accepts the usual names in any case plus `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogLevel(pub LevelFilter);

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("all") {
            return Ok(LogLevel(LevelFilter::Trace));
        }
        if value.eq_ignore_ascii_case("warning") {
            return Ok(LogLevel(LevelFilter::Warn));
        }
        value
            .parse::<LevelFilter>()
            .map(LogLevel)
            .map_err(|_| format!("unknown log level '{}'", value))
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.0.to_string()
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        level.0
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_root_level")]
    pub level: LogLevel,
    #[serde(default)]
    pub loggers: BTreeMap<String, LogLevel>,
    #[serde(default)]
    pub console: ConsoleSettings,
    #[serde(default)]
    pub file: FileSettings,
}

fn default_root_level() -> LogLevel {
    LogLevel(LevelFilter::Warn)
}

fn default_threshold() -> LogLevel {
    LogLevel(LevelFilter::Trace)
}

fn default_format() -> String {
    DEFAULT_LOG_FORMAT.to_string()
}

fn yes() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_root_level(),
            loggers: BTreeMap::new(),
            console: ConsoleSettings::default(),
            file: FileSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleSettings {
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: LogLevel,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            format: default_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: LogLevel,
    #[serde(default)]
    pub current_log_filename: Option<PathBuf>,
    #[serde(default = "yes")]
    pub archive: bool,
    /// Rolled file name; `%d` is replaced with the day being archived.
    #[serde(default)]
    pub archived_log_filename_pattern: Option<String>,
    #[serde(default = "default_archived_file_count")]
    pub archived_file_count: usize,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_archived_file_count() -> usize {
    5
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_threshold(),
            current_log_filename: None,
            archive: true,
            archived_log_filename_pattern: None,
            archived_file_count: default_archived_file_count(),
            format: default_format(),
        }
    }
}

impl FileSettings {
    pub fn archive_pattern(&self) -> Option<String> {
        if !self.archive {
            return None;
        }
        match (&self.archived_log_filename_pattern, &self.current_log_filename) {
            (Some(pattern), _) => Some(pattern.clone()),
            (None, Some(current)) => Some(format!("{}.%d", current.display())),
            (None, None) => None,
        }
    }
}

/// Database section. Either `persistence-unit` alone or the connection keys, never both.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseSettings {
    #[serde(rename = "persistence-unit", default)]
    pub persistence_unit: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(rename = "jdbc_url", alias = "url", default)]
    pub url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default = "default_max_active")]
    pub max_active: u32,
    #[serde(default = "default_max_idle")]
    pub max_idle: u32,
    #[serde(default = "default_min_idle")]
    pub min_idle: u32,
    #[serde(default = "default_initial_size")]
    pub initial_size: u32,
    #[serde(default = "yes")]
    pub test_on_borrow: bool,
    #[serde(default)]
    pub test_on_return: bool,
    #[serde(default = "yes")]
    pub test_while_idle: bool,
    #[serde(default = "default_validation_query")]
    pub validation_query: String,
    #[serde(default = "yes")]
    pub log_validation_errors: bool,
    /// Creates the tables of registered entities when the persistence service starts.
    #[serde(default)]
    pub create_schema: bool,
    /// Extra connection options, appended to the connection URL.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(skip)]
    pub entities: Vec<EntityDef>,
}

fn default_max_active() -> u32 {
    100
}

fn default_max_idle() -> u32 {
    10
}

fn default_min_idle() -> u32 {
    2
}

fn default_initial_size() -> u32 {
    10
}

fn default_validation_query() -> String {
    "select 1".to_string()
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            persistence_unit: None,
            driver: None,
            url: None,
            user: None,
            pass: None,
            dialect: None,
            max_active: default_max_active(),
            max_idle: default_max_idle(),
            min_idle: default_min_idle(),
            initial_size: default_initial_size(),
            test_on_borrow: true,
            test_on_return: false,
            test_while_idle: true,
            validation_query: default_validation_query(),
            log_validation_errors: true,
            create_schema: false,
            properties: BTreeMap::new(),
            entities: Vec::new(),
        }
    }
}

impl DatabaseSettings {
    pub fn has_connection_parameters(&self) -> bool {
        self.driver.is_some()
            || self.url.is_some()
            || self.user.is_some()
            || self.pass.is_some()
            || self.dialect.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UiSettings {
    #[serde(default)]
    pub home_page: Option<String>,
    #[serde(default)]
    pub login_page: Option<String>,
    #[serde(default)]
    pub exception_page: Option<String>,
    /// Mount path to page id.
    #[serde(default)]
    pub pages: BTreeMap<String, String>,
    /// Mount path to resource id.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub css_resources: Vec<String>,
    #[serde(default)]
    pub js_resources: Vec<String>,
    #[serde(default = "default_resource_dir")]
    pub resource_dir: PathBuf,
    #[serde(default)]
    pub minify_resources: Option<bool>,
    #[serde(default)]
    pub strip_markup_ids: Option<bool>,
    #[serde(default)]
    pub stateless_checker: Option<bool>,
    #[serde(default)]
    pub debug_toolbar: Option<bool>,
    #[serde(skip)]
    pub(crate) development: bool,
}

fn default_resource_dir() -> PathBuf {
    PathBuf::from("resources")
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            home_page: None,
            login_page: None,
            exception_page: None,
            pages: BTreeMap::new(),
            resources: BTreeMap::new(),
            css_resources: Vec::new(),
            js_resources: Vec::new(),
            resource_dir: default_resource_dir(),
            minify_resources: None,
            strip_markup_ids: None,
            stateless_checker: None,
            debug_toolbar: None,
            development: false,
        }
    }
}

impl UiSettings {
    pub fn is_development(&self) -> bool {
        self.development
    }

    /// Falls back to the home page.
    pub fn login_page(&self) -> Option<&str> {
        self.login_page.as_deref().or(self.home_page.as_deref())
    }

    pub fn minify_resources(&self) -> bool {
        self.minify_resources.unwrap_or(!self.development)
    }

    pub fn strip_markup_ids(&self) -> bool {
        self.strip_markup_ids.unwrap_or(!self.development)
    }

    pub fn stateless_checker(&self) -> bool {
        self.stateless_checker.unwrap_or(self.development)
    }

    pub fn debug_toolbar(&self) -> bool {
        self.debug_toolbar.unwrap_or(self.development)
    }
}
