//! Serializable stand-ins for live resources.
//!
//! A [`Durable`] keeps only the recipe for a resource. Serializing it drops whatever live
//! handle it held; the first use after deserialization builds a fresh one.

mod query_runner;

use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::PersistError;
use crate::persistence::{lookup_unit, Session};

pub use query_runner::{QueryRunner, QueryRunnerSource};

/// Knows how to rebuild a live handle from serializable data.
pub trait Recreate: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Handle: Send + 'static;

    fn recreate(&self) -> Result<Self::Handle, PersistError>;

    /// Releases a handle that is being discarded.
    fn invalidate(&self, _handle: Self::Handle) {}
}

pub struct Durable<S: Recreate> {
    id: Uuid,
    source: S,
    live: Mutex<Option<S::Handle>>,
}

pub type DurableSession = Durable<SessionSource>;
pub type DurableQueryRunner = Durable<QueryRunnerSource>;

impl<S: Recreate> Durable<S> {
    pub fn new(source: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            live: Mutex::new(None),
        }
    }

    /// Wraps a handle that already exists.
    pub fn with_handle(source: S, handle: S::Handle) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            live: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Whether a live handle exists right now. Never creates one.
    pub fn is_live(&self) -> bool {
        match self.live.try_lock() {
            Ok(live) => live.is_some(),
            // locked means someone is using the handle
            Err(_) => true,
        }
    }

    /// The live handle, recreated if needed.
    pub async fn get(&self) -> Result<MappedMutexGuard<'_, S::Handle>, PersistError> {
        let mut live = self.live.lock().await;
        if live.is_none() {
            debug!("Recreating live handle for {}", self.id);
            *live = Some(self.source.recreate()?);
        }
        MutexGuard::try_map(live, Option::as_mut).map_err(|_| PersistError::SessionClosed)
    }

    /// Drops the live handle, if any.
    pub async fn invalidate(&self) {
        if let Some(handle) = self.live.lock().await.take() {
            self.source.invalidate(handle);
        }
    }
}

impl<S: Recreate> Serialize for Durable<S> {
    fn serialize<Z: Serializer>(&self, serializer: Z) -> Result<Z::Ok, Z::Error> {
        #[derive(Serialize)]
        struct Snapshot<'a, T> {
            source: &'a T,
        }

        match self.live.try_lock() {
            Ok(mut live) => {
                if let Some(handle) = live.take() {
                    trace!("Dropping live handle of {} for serialization", self.id);
                    self.source.invalidate(handle);
                }
            }
            Err(_) => return Err(serde::ser::Error::custom(PersistError::HandleInUse)),
        }

        Snapshot {
            source: &self.source,
        }
        .serialize(serializer)
    }
}

impl<'de, S: Recreate> Deserialize<'de> for Durable<S> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Snapshot<T> {
            source: T,
        }

        let snapshot = Snapshot::<S>::deserialize(deserializer)?;
        Ok(Self::new(snapshot.source))
    }
}

impl<S: Recreate> PartialEq for Durable<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<S: Recreate> Eq for Durable<S> {}

impl<S: Recreate> Hash for Durable<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<S: Recreate + fmt::Debug> fmt::Debug for Durable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Durable")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("live", &self.is_live())
            .finish()
    }
}

impl<S: Recreate + fmt::Display> fmt::Display for Durable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.id)
    }
}

/// Recipe for a session on a named persistence unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionSource {
    unit: String,
}

impl SessionSource {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }
}

impl Recreate for SessionSource {
    type Handle = Session;

    fn recreate(&self) -> Result<Session, PersistError> {
        lookup_unit(&self.unit)?.open_session()
    }

    fn invalidate(&self, mut handle: Session) {
        handle.close();
    }
}

impl fmt::Display for SessionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session({})", self.unit)
    }
}
