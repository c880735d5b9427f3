//! Live tests, grouped by the story they tell
//!
//! - `bootstrap_lifecycle`: creating, reattaching to and destroying the
//!   bootstrap cluster and PXE pool (needs root for QEMU networking, ~10min)
//!
//! - `sidero_resources`: reading and creating Sidero resources on a bootstrap
//!   cluster left running with `sfyra test --skip-teardown`
//!
//! ```bash
//! sudo -E cargo test --test live bootstrap_lifecycle -- --ignored --nocapture
//! cargo test --test live sidero_resources -- --ignored --nocapture
//! ```

mod bootstrap_lifecycle;
mod helpers;
mod sidero_resources;
