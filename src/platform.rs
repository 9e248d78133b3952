//! Build-flavor plumbing: shared-ownership and bound aliases that differ
//! between the `send` build (Arc, `Send` everywhere) and the `local` build
//! (Rc, single-threaded). Nothing in this module touches stream semantics;
//! it only names what the rest of the crate shares and boxes.
//!
//! `CondSend` is the conditional thread-safety bound: it resolves to `Send`
//! on the `send` build and to an empty bound on the `local` build, so the
//! same trait definitions serve both flavors.

#[cfg(feature = "send")]
mod flavor {
    use std::{future::Future, pin::Pin};

    /// Shared-ownership handle for this build.
    pub use std::sync::Arc as Shared;

    /// Conditional thread-safety bound; `Send` on this build.
    pub trait CondSend: Send {}
    impl<T: Send> CondSend for T {}

    /// Boxed future carrying this build's thread-safety requirement.
    pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    /// Boxed queuing strategy carrying this build's thread-safety
    /// requirement.
    pub type DynStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + Send + 'static>;
}

#[cfg(feature = "local")]
mod flavor {
    use std::{future::Future, pin::Pin};

    /// Shared-ownership handle for this build.
    pub use std::rc::Rc as Shared;

    /// Conditional thread-safety bound; empty on this build.
    pub trait CondSend {}
    impl<T> CondSend for T {}

    /// Boxed future; no thread-safety requirement on this build.
    pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

    /// Boxed queuing strategy; no thread-safety requirement on this build.
    pub type DynStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + 'static>;
}

pub use flavor::*;
