//! Lease and capability types.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Identity of a workload requesting scanout, unique per guest or
/// compositor client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadId(String);

impl WorkloadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkloadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkloadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque token a workload presents to the display stack to exercise its
/// claim on a slot. The broker stores and returns it verbatim; only the
/// issuer knows its layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDescriptor(Bytes);

impl CapabilityDescriptor {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Mints capability descriptors for granted leases.
#[cfg_attr(test, mockall::automock)]
pub trait CapabilityIssuer: Send + Sync + 'static {
    fn issue(&self, slot: u32, workload: &WorkloadId) -> Result<CapabilityDescriptor, Error>;
}

/// Issuer for single-host deployments.
///
/// Descriptors are slot, nonce, and workload name packed big-endian.
/// There is no cryptography here; the descriptor only has to be unique,
/// not unforgeable, because it never crosses a trust boundary.
#[derive(Debug, Default)]
pub struct LocalCapabilityIssuer {
    nonce: AtomicU64,
}

impl LocalCapabilityIssuer {
    pub fn new() -> Self {
        Self {
            nonce: AtomicU64::new(1),
        }
    }
}

impl CapabilityIssuer for LocalCapabilityIssuer {
    fn issue(&self, slot: u32, workload: &WorkloadId) -> Result<CapabilityDescriptor, Error> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let name = workload.as_str().as_bytes();
        let mut buf = BytesMut::with_capacity(4 + 8 + name.len());
        buf.put_u32(slot);
        buf.put_u64(nonce);
        buf.put_slice(name);
        Ok(CapabilityDescriptor(buf.freeze()))
    }
}

/// A granted scanout lease.
///
/// `issued_at` survives a grace-period reclaim: the workload gets its
/// original lease back, not a new one.
#[derive(Debug, Clone)]
pub struct Lease {
    pub slot_index: u32,
    pub workload_id: WorkloadId,
    pub capability: CapabilityDescriptor,
    pub issued_at: Instant,
}
