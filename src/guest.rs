//! Single-occupancy registration: a host accepts at most one guest at a time.
//!
//! A connection hosts one transaction; a connection also hosts at most one
//! open copy stream.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

static NEXT_GUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an object that occupies a [`GuestSlot`].
///
/// Identity is the process-unique `id`; two guests with the same kind and
/// name are still different guests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    id: u64,
    kind: &'static str,
    name: String,
}

impl Guest {
    /// Create a guest of the given kind (`"transaction"`, `"copy_out"`, ...)
    /// and optional name.
    pub fn new(kind: &'static str, name: impl Into<String>) -> Self {
        Self {
            id: NEXT_GUEST_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `kind 'name'`, or just `kind` for an unnamed guest.
    pub fn describe(&self) -> String {
        if self.name.is_empty() {
            self.kind.to_string()
        } else {
            format!("{} '{}'", self.kind, self.name)
        }
    }
}

/// Holds at most one [`Guest`].
#[derive(Debug, Default)]
pub struct GuestSlot {
    current: Option<Guest>,
}

impl GuestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Guest> {
        self.current.as_ref()
    }

    pub fn is_occupied(&self) -> bool {
        self.current.is_some()
    }

    /// Occupy the slot.
    ///
    /// Fails with [`Error::Usage`] if the slot already holds a guest,
    /// including `guest` itself.
    pub fn register(&mut self, guest: &Guest) -> Result<()> {
        match &self.current {
            Some(old) if old.id == guest.id => Err(Error::Usage(format!(
                "Started twice: {}",
                guest.describe()
            ))),
            Some(old) => Err(Error::Usage(format!(
                "Started new {} while {} is still active.",
                guest.describe(),
                old.describe()
            ))),
            None => {
                self.current = Some(guest.clone());
                Ok(())
            }
        }
    }

    /// Vacate the slot.
    ///
    /// Fails with [`Error::Usage`] if `guest` is not the current occupant;
    /// the slot is left untouched in that case.
    pub fn unregister(&mut self, guest: &Guest) -> Result<()> {
        match &self.current {
            Some(old) if old.id == guest.id => {
                self.current = None;
                Ok(())
            }
            Some(old) => Err(Error::Usage(format!(
                "Closed {}; expected to close {}",
                guest.describe(),
                old.describe()
            ))),
            None => Err(Error::Usage(format!(
                "Closed while not open: {}",
                guest.describe()
            ))),
        }
    }

    /// Empty the slot unconditionally, returning the previous occupant.
    pub fn clear(&mut self) -> Option<Guest> {
        self.current.take()
    }
}
