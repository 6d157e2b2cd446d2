#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The name model and reactive primitives underlying the `wily` client
//! core: paths, delegation tables, name trees, namers, and the
//! `Activity`/`Var` cells that make resolution observable.

pub mod activity;
pub mod dtab;
pub mod error;
pub mod name;
pub mod namer;
pub mod path;
pub mod svc;
pub mod tree;

pub use self::activity::{Activity, State, Subscription};
pub use self::dtab::{Dentry, Dtab};
pub use self::error::{Error, SharedError};
pub use self::name::{Addr, BoundId, NameBound, Var};
pub use self::namer::{DtabNamer, Namer, NegNamer, OrElse, MAX_DELEGATIONS};
pub use self::path::Path;
pub use self::svc::{
    BoxService, ClientConnection, Interrupt, Service, ServiceFactory, SharedFactory,
    DEFAULT_CLOSE_DEADLINE,
};
pub use self::tree::{NameTree, Weighted};
