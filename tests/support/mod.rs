//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod fake_host;
pub mod socket_guard;

use std::sync::Arc;

use downloader_compat::{Bootstrap, Category, CompatConfig, CompatContext};

use fake_host::FakeHost;

/// Config that leaves the descriptor diagnostic on.
pub fn test_config() -> CompatConfig {
    CompatConfig {
        disable_descriptor_diagnostic: false,
        ..CompatConfig::default()
    }
}

/// Context whose host reports every primitive as broken.
pub fn broken_host_context() -> (CompatContext, Arc<FakeHost>) {
    let host = Arc::new(FakeHost::broken());
    let context = Bootstrap::new(test_config())
        .with_host(host.clone())
        .run()
        .expect("bootstrap against a broken host");
    (context, host)
}

/// Context with every category emulated without probing.
pub fn emulated_context() -> CompatContext {
    Bootstrap::new(CompatConfig {
        force_emulate: Category::ALL.to_vec(),
        ..test_config()
    })
    .run()
    .expect("bootstrap with forced emulation")
}
