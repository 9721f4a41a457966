pub mod capi;
pub mod context;
pub mod disasm;
pub mod dlfcn;
pub mod elf;
mod entry;
pub mod hooks;
pub mod linker;
pub mod mods;
pub mod phase;
pub mod pipeline;
pub mod protect;
pub mod resolver;
pub mod sort;
pub mod trampoline;

use std::sync::Once;

pub const MOD_ID: &str = "sable";
pub const MOD_VERSION: &str = env!("CARGO_PKG_VERSION");

static LOGGER_ONCE: Once = Once::new();

#[cfg(target_os = "android")]
pub fn init_logger() {
    use log::LevelFilter;

    LOGGER_ONCE.call_once(|| {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(if cfg!(debug_assertions) {
                    LevelFilter::Trace
                } else {
                    LevelFilter::Info
                })
                .with_tag(concat!("sable|v", env!("CARGO_PKG_VERSION"))),
        );
    });
}

#[cfg(not(target_os = "android"))]
pub fn init_logger() {
    LOGGER_ONCE.call_once(|| {
        let _ = env_logger::builder().try_init();
    });
}
