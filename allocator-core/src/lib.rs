// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

//! IP address allocation core for a LoadBalancer controller: pool catalog,
//! sharing protocol, and allocator façade. The reconcile loop that drives
//! this crate (watching services, programming the data plane) lives
//! outside it; see `allocator-cli` for a scripted stand-in driver used in
//! place of the real one for demonstration and integration testing.

pub mod allocator;
pub mod catalog;
pub mod events;
pub mod local_pool;
pub mod metrics;
pub mod netbox_pool;
pub mod pool;
pub mod service;

pub use allocator::{Allocator, AllocatorError};
pub use catalog::{AddressRangeSpec, Catalog, CatalogEvent, CatalogEventKind, NetboxClientFactory, NetboxSpec, ServiceGroup, ServiceGroupSpec};
pub use events::{EventRecorder, TracingEventRecorder};
pub use local_pool::{LocalPool, LocalPoolError};
pub use netbox_pool::{NetboxClient, NetboxError, NetboxPool};
pub use pool::{Pool, PoolError, RejectReason};
pub use service::{AllocationRequest, NetProto, Port, ServiceRef, SharingKey};
