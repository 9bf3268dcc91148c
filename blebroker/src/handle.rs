use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroU32;

use anyhow::anyhow;

use crate::{Error, Result};

/// An opaque integer that stands in for a native object across the API boundary.
///
/// Handles are allocated by a [`HandleTable`] and are only meaningful within the
/// scope (connection, GATT server, ...) that issued them. Zero is never a valid
/// handle.
pub trait Handle: Copy + Eq + Hash + fmt::Debug {
    /// Short name of the scope, used for `Error::NotFound` reporting
    const KIND: &'static str;

    fn from_raw(raw: NonZeroU32) -> Self;
    fn raw(self) -> u32;
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
                 serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(std::num::NonZeroU32);

        impl $name {
            /// Re-creates a handle from the integer previously handed out to a caller.
            ///
            /// Returns `None` for zero, which is never a valid handle.
            pub fn new(raw: u32) -> Option<Self> {
                std::num::NonZeroU32::new(raw).map(Self)
            }

            pub fn get(self) -> u32 {
                self.0.get()
            }
        }

        impl $crate::handle::Handle for $name {
            const KIND: &'static str = $kind;

            fn from_raw(raw: std::num::NonZeroU32) -> Self {
                Self(raw)
            }
            fn raw(self) -> u32 {
                self.0.get()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}
pub(crate) use define_handle;

/// Maps handles to native object references, optionally in both directions.
///
/// Allocation is append-only: the counter only ever moves forward, including
/// across `reset()`, so a handle that was once issued can never resolve to a
/// different object later in the same table.
#[derive(Debug)]
pub struct HandleTable<H: Handle, K> {
    // None once the handle space is exhausted
    next: Option<NonZeroU32>,
    forward: HashMap<H, K>,

    // Only present for tables that need to map a native object back to its
    // handle (e.g. to route an unsolicited event)
    reverse: Option<HashMap<K, H>>,
}

impl<H: Handle, K: Clone + Eq + Hash> HandleTable<H, K> {
    /// A forward-only table (handle -> object)
    pub fn new() -> Self {
        Self {
            next: Some(NonZeroU32::MIN),
            forward: HashMap::new(),
            reverse: None,
        }
    }

    /// A table that also supports [`reverse_lookup`](Self::reverse_lookup)
    pub fn bidirectional() -> Self {
        Self {
            reverse: Some(HashMap::new()),
            ..Self::new()
        }
    }

    /// Makes the first allocated handle `first` instead of 1 (0 is treated as 1)
    pub fn starting_at(mut self, first: u32) -> Self {
        self.next = Some(NonZeroU32::new(first).unwrap_or(NonZeroU32::MIN));
        self
    }

    fn next_handle(&mut self) -> Result<H> {
        let raw = self.next.ok_or_else(|| Error::Other(anyhow!("{} handle space exhausted", H::KIND)))?;
        self.next = raw.checked_add(1);
        Ok(H::from_raw(raw))
    }

    /// Records `object` under a fresh, never-before-issued handle.
    ///
    /// On a bidirectional table an object can only have one handle, so any
    /// handle previously issued for the same object is retired.
    pub fn allocate(&mut self, object: K) -> Result<H> {
        let handle = self.next_handle()?;
        if let Some(reverse) = &mut self.reverse {
            if let Some(stale) = reverse.insert(object.clone(), handle) {
                self.forward.remove(&stale);
            }
        }
        self.forward.insert(handle, object);
        Ok(handle)
    }

    /// Returns the existing handle for `object` or allocates one.
    ///
    /// Forward-only tables can't recognise objects so they always allocate.
    pub fn get_or_allocate(&mut self, object: K) -> Result<H> {
        if let Some(handle) = self.reverse.as_ref().and_then(|reverse| reverse.get(&object)) {
            return Ok(*handle);
        }
        self.allocate(object)
    }

    pub fn resolve(&self, handle: H) -> Result<&K> {
        self.forward.get(&handle).ok_or(Error::NotFound(H::KIND))
    }

    pub fn reverse_lookup(&self, object: &K) -> Result<H> {
        self.reverse
            .as_ref()
            .and_then(|reverse| reverse.get(object))
            .copied()
            .ok_or(Error::NotFound(H::KIND))
    }

    /// Invalidates every issued handle. The counter is not rewound.
    pub fn reset(&mut self) {
        self.forward.clear();
        if let Some(reverse) = &mut self.reverse {
            reverse.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl<H: Handle, K: Clone + Eq + Hash> Default for HandleTable<H, K> {
    fn default() -> Self {
        Self::new()
    }
}
