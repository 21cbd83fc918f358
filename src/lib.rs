#![deny(warnings)]
#![allow(dead_code)]

//! Strided/derived datatype layouts with nonblocking pack, unpack and unpack-reduce across host
//! and device memory, modeled on the datatype layer of an MPI runtime's device-aware transport.
//!
//! A [`types::TypeNode`] describes a memory layout (contiguous run, strided vector, indexed
//! blocks, struct of heterogeneous members) as a tree built once at construction time with every
//! derived property — size, extent, true lower/upper bound, contiguity — precomputed. A
//! [`context::Context`] owns the handle tables that name these types and the requests issued
//! against them, plus the [`progress::ProgressEngine`] that chunks indirect (device-touching)
//! transfers through temporary staging slabs.
//!
//! [`api::ipack`]/[`api::iunpack`]/[`api::iacc`] are the entry points; every other call
//! classifies instantly and completes inline, everything else returns a request handle that
//! [`api::request_test`]/[`api::request_wait`] drive to completion.

#[macro_use]
extern crate log;

pub mod api;
pub mod backend;
pub mod config;
pub(crate) mod dispatch;
pub mod error;
mod handle;
pub mod info;
pub mod kernel;
pub mod progress;
pub mod ptr_attr;
pub mod request;
pub mod types;

mod context;

/// Things used in almost every caller of this crate.
pub mod prelude {
    pub use crate::{
        api::{iacc, ipack, iunpack, request_test, request_wait},
        config::{EngineConfig, SlabConfig},
        context::{Context, Library},
        error::{Error, Result},
        info::Info,
        kernel::ReduceOp,
        ptr_attr::PointerKind,
    };
}

pub use self::{
    api::{iacc, ipack, iunpack, request_test, request_wait},
    backend::GpuDriver,
    context::{Context, Library},
    error::{Error, Result},
    info::Info,
    kernel::ReduceOp,
    progress::ProgressEngine,
    ptr_attr::{PointerKind, PtrAttr},
    request::{Request, RequestKind},
};
