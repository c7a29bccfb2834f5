//! Browser-backed [`Portal`](crate::navigator::Portal) implementations.

pub mod chromium;

pub use chromium::ChromiumPortal;
