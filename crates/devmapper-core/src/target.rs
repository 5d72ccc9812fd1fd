//! Target plugin interface and the target type registry
//!
//! A target type is a named factory. Each table line constructs one target
//! instance from it; the instance owns a contiguous sector range and maps
//! requests that land in that range.
//!
//! The registry hands out counted handles. A type cannot be unregistered
//! while any table still holds a handle to it.

use crate::error::{MapperError, MapperResult};
use crate::io::IoRequest;
use crate::table::TableDevices;
use crate::targets;
use devmapper_common::Sector;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Result of mapping one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOutcome {
    /// Fully handled by the target; the dispatcher completes it successfully
    Consumed,
    /// Rewritten to address an underlying device; forwarded to the lower layer
    Remapped,
    /// Refused; the reason becomes the request's error status
    Rejected(String),
}

/// A mapping backend, registered by name
pub trait TargetType: Send + Sync {
    /// Name used in table lines
    fn name(&self) -> &str;

    /// Build a target instance covering `length` sectors from `start`.
    ///
    /// Underlying devices the instance will address must be registered in
    /// `devices` so the owning mapped device opens them on activation.
    fn construct(
        &self,
        devices: &mut TableDevices,
        start: Sector,
        length: Sector,
        args: &[String],
    ) -> Result<Box<dyn Target>, String>;
}

/// One constructed target instance
pub trait Target: Send + Sync {
    /// Map a request addressed to this target's range
    fn map(&self, request: &mut IoRequest) -> MapOutcome;

    /// Tear down the instance, returning its devices to the table
    fn destroy(self: Box<Self>, devices: &mut TableDevices) {
        let _ = devices;
    }

    /// Constructor arguments as they would appear in a table line
    fn describe(&self) -> String {
        String::new()
    }
}

/// Callback invoked on a lookup miss; may register the missing type.
///
/// Returns `true` if it believes the type is now available.
pub type Resolver = Box<dyn Fn(&TargetRegistry, &str) -> bool + Send + Sync>;

struct Registered {
    target_type: Arc<dyn TargetType>,
    refcount: usize,
}

type TypeMap = RwLock<HashMap<String, Registered>>;

/// Registry of target types by name
pub struct TargetRegistry {
    types: Arc<TypeMap>,
    resolver: Option<Resolver>,
}

impl TargetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            types: Arc::new(RwLock::new(HashMap::new())),
            resolver: None,
        }
    }

    /// Create a registry with the built-in `linear`, `error` and `striped` types
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for target_type in targets::builtins() {
            registry
                .register(target_type)
                .expect("built-in target names are distinct");
        }
        registry
    }

    /// Install a resolver consulted on lookup misses
    pub fn with_resolver(
        mut self,
        resolver: impl Fn(&TargetRegistry, &str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Register a target type under its name
    pub fn register(&self, target_type: Arc<dyn TargetType>) -> MapperResult<()> {
        let name = target_type.name().to_string();
        let mut types = self.types.write();

        if types.contains_key(&name) {
            return Err(MapperError::AlreadyExists(format!("target type {name}")));
        }

        types.insert(
            name.clone(),
            Registered {
                target_type,
                refcount: 0,
            },
        );
        debug!("Registered target type {}", name);
        Ok(())
    }

    /// Remove a target type that no table references
    pub fn unregister(&self, name: &str) -> MapperResult<Arc<dyn TargetType>> {
        let mut types = self.types.write();

        let entry = types
            .get(name)
            .ok_or_else(|| MapperError::UnknownTargetType(name.to_string()))?;
        if entry.refcount > 0 {
            return Err(MapperError::Busy(format!(
                "target type {name} has {} users",
                entry.refcount
            )));
        }

        let entry = types
            .remove(name)
            .ok_or_else(|| MapperError::UnknownTargetType(name.to_string()))?;
        debug!("Unregistered target type {}", name);
        Ok(entry.target_type)
    }

    /// Take a counted handle to a target type
    pub fn lookup(&self, name: &str) -> MapperResult<TargetTypeHandle> {
        if let Some(handle) = self.get(name) {
            return Ok(handle);
        }

        if let Some(resolver) = &self.resolver {
            debug!("Target type {} not registered, asking resolver", name);
            if resolver(self, name)
                && let Some(handle) = self.get(name)
            {
                return Ok(handle);
            }
        }

        Err(MapperError::UnknownTargetType(name.to_string()))
    }

    /// Give back a handle (equivalent to dropping it)
    pub fn release(&self, handle: TargetTypeHandle) {
        drop(handle);
    }

    /// Number of outstanding handles for a type
    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.types.read().get(name).map(|entry| entry.refcount)
    }

    /// Registered type names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<TargetTypeHandle> {
        let mut types = self.types.write();
        let entry = types.get_mut(name)?;
        entry.refcount += 1;
        Some(TargetTypeHandle {
            target_type: Arc::clone(&entry.target_type),
            types: Arc::clone(&self.types),
        })
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("types", &self.names())
            .finish_non_exhaustive()
    }
}

/// Drop one reference to a registered type.
///
/// Releasing more often than looked up is a caller bug.
fn put(types: &TypeMap, name: &str) {
    let mut types = types.write();
    let Some(entry) = types.get_mut(name) else {
        panic!("released target type {name} which is not registered");
    };
    assert!(
        entry.refcount > 0,
        "target type {name} released more times than it was looked up"
    );
    entry.refcount -= 1;
}

/// Counted reference to a registered target type
///
/// Released on drop.
pub struct TargetTypeHandle {
    target_type: Arc<dyn TargetType>,
    types: Arc<TypeMap>,
}

impl TargetTypeHandle {
    pub fn name(&self) -> &str {
        self.target_type.name()
    }

    pub fn construct(
        &self,
        devices: &mut TableDevices,
        start: Sector,
        length: Sector,
        args: &[String],
    ) -> Result<Box<dyn Target>, String> {
        self.target_type.construct(devices, start, length, args)
    }
}

impl Clone for TargetTypeHandle {
    fn clone(&self) -> Self {
        let mut types = self.types.write();
        if let Some(entry) = types.get_mut(self.target_type.name()) {
            entry.refcount += 1;
        }
        Self {
            target_type: Arc::clone(&self.target_type),
            types: Arc::clone(&self.types),
        }
    }
}

impl Drop for TargetTypeHandle {
    fn drop(&mut self) {
        put(&self.types, self.target_type.name());
    }
}

impl fmt::Debug for TargetTypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetTypeHandle({})", self.name())
    }
}
