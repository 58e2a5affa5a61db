mod support;

mod broadcast_test;
mod lifecycle_test;

pub use support::*;
