//! Scoped direct access to the shared client.

use std::{fmt, ops::Deref, sync::Arc};

use crate::gate::Permit;

/// Admitted handle to the shared client.
///
/// Dereferences to the client. The slot is released when the lease is dropped.
pub struct Lease<C> {
    /// Admission slot.
    permit: Permit,
    /// Shared client.
    client: Arc<C>,
}

impl<C> Lease<C> {
    /// Bundle admission slot with the client it guards.
    pub(crate) fn new(permit: Permit, client: Arc<C>) -> Self {
        Self { permit, client }
    }

    /// Admission slot backing this lease.
    #[must_use]
    pub fn permit(&self) -> &Permit {
        &self.permit
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl<C> AsRef<C> for Lease<C> {
    fn as_ref(&self) -> &C {
        &self.client
    }
}

impl<C> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("permit", &self.permit)
            .finish_non_exhaustive()
    }
}
