use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::durable::{DurableQueryRunner, DurableSession, QueryRunner};
use crate::error::PersistError;
use crate::persistence::PersistService;
use crate::settings::UiSettings;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("No binding for {0}")]
    Missing(&'static str),

    #[error("No database is configured")]
    NoDatabase,
}

/// Type-keyed singletons contributed by modules.
#[derive(Default)]
pub struct Bindings {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` as the singleton of its type, replacing any earlier binding.
    pub fn bind<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.bind_arc(Arc::new(value))
    }

    pub fn bind_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        self.map.insert(TypeId::of::<T>(), value);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings").field("count", &self.map.len()).finish()
    }
}

/// Application code contributing bindings before anything starts.
pub trait Module: Send + Sync {
    fn configure(&self, bindings: &mut Bindings);
}

/// Everything handlers and modules can ask for. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    bindings: Bindings,
    persist: Option<Arc<PersistService>>,
    ui: Arc<UiSettings>,
}

impl AppContext {
    pub fn new(bindings: Bindings, persist: Option<Arc<PersistService>>, ui: UiSettings) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                bindings,
                persist,
                ui: Arc::new(ui),
            }),
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.bindings.get::<T>()
    }

    pub fn require<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, InjectError> {
        self.get::<T>().ok_or(InjectError::Missing(type_name::<T>()))
    }

    pub fn ui(&self) -> &UiSettings {
        &self.inner.ui
    }

    pub fn is_development(&self) -> bool {
        self.inner.ui.is_development()
    }

    pub fn persistence(&self) -> Option<&Arc<PersistService>> {
        self.inner.persist.as_ref()
    }

    fn persist(&self) -> Result<&Arc<PersistService>, InjectError> {
        self.inner.persist.as_ref().ok_or(InjectError::NoDatabase)
    }

    pub fn query_runner(&self) -> Result<QueryRunner, PersistError> {
        match self.persist() {
            Ok(persist) => persist.query_runner(),
            Err(_) => Err(PersistError::NotRunning),
        }
    }

    pub fn durable_session(&self) -> Result<DurableSession, InjectError> {
        Ok(self.persist()?.durable_session())
    }

    pub fn durable_query_runner(&self) -> Result<DurableQueryRunner, InjectError> {
        Ok(self.persist()?.durable_query_runner())
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("bindings", &self.inner.bindings)
            .field("persist", &self.inner.persist)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Greeting(String);

    struct GreetingModule;

    impl Module for GreetingModule {
        fn configure(&self, bindings: &mut Bindings) {
            bindings.bind(Greeting("hello".to_string()));
        }
    }

    #[test]
    fn test_modules_contribute_bindings() {
        let mut bindings = Bindings::new();
        GreetingModule.configure(&mut bindings);
        bindings.bind(42_u32).bind(7_u32);

        let ctx = AppContext::new(bindings, None, UiSettings::default());
        assert_eq!(*ctx.require::<Greeting>().unwrap(), Greeting("hello".to_string()));
        assert_eq!(*ctx.require::<u32>().unwrap(), 7);
        assert!(matches!(
            ctx.require::<String>(),
            Err(InjectError::Missing(_))
        ));
    }

    #[test]
    fn test_no_database_means_no_sessions() {
        let ctx = AppContext::new(Bindings::new(), None, UiSettings::default());
        assert!(ctx.persistence().is_none());
        assert!(matches!(ctx.durable_session(), Err(InjectError::NoDatabase)));
        assert!(matches!(ctx.query_runner(), Err(PersistError::NotRunning)));
    }
}
