use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Opaque reference to an object owned by the server.
///
/// Only the numeric id takes part in equality, ordering and hashing; the
/// optional name is carried for error messages. Id `0` is the null handle.
#[derive(Clone, Default)]
pub struct ObjectHandle {
    id: u64,
    name: Option<Arc<str>>,
}

impl ObjectHandle {
    pub const NULL: ObjectHandle = ObjectHandle { id: 0, name: None };

    pub fn new(id: u64) -> Self {
        Self { id, name: None }
    }

    /// Attach a debug name, typically the remote class name.
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ObjectHandle {}

impl PartialOrd for ObjectHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for ObjectHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl From<u64> for ObjectHandle {
    fn from(id: u64) -> Self {
        ObjectHandle::new(id)
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "<{name} #{}>", self.id),
            None if self.is_null() => f.write_str("<null>"),
            None => write!(f, "<object #{}>", self.id),
        }
    }
}
