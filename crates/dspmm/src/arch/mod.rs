//! Device MMU backends.
//!
//! `omap` drives the real MMU through its register window and is always built so
//! that rust-analyzer and tests can see it. `software` emulates the MMU in host
//! memory and is only built for tests or with the `software-emulation` feature.

pub mod omap;

#[cfg(any(test, feature = "software-emulation"))]
pub mod software;
