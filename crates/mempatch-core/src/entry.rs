//! Library entry point for the injected core. The loader runs the
//! `.init_array` constructor when `LD_PRELOAD` pulls the cdylib into the
//! target; a failed startup leaves the target untouched.

use std::sync::{Arc, OnceLock};

use tracing_subscriber::EnvFilter;

use mempatch_common::channel::CONTROL_PORT;

use crate::core::Core;
use crate::logging::LogForwarder;

/// Keeps the core alive for the lifetime of the target process.
static CORE: OnceLock<Arc<Core>> = OnceLock::new();

/// Port override for test targets; the compiled-in default is used
/// otherwise.
const PORT_VARIABLE: &str = "MEMPATCH_PORT";

#[no_mangle]
pub extern "C" fn mempatch_core_start() {
    if CORE.get().is_some() {
        return;
    }
    let port = std::env::var(PORT_VARIABLE)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(CONTROL_PORT);

    match Core::connect(port) {
        Ok(core) => {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mempatch_core=info,mempatch_common=info"));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(LogForwarder::new(&core))
                .try_init();
            let _ = CORE.set(core);
        }
        Err(error) => {
            eprintln!("mempatch core: could not connect to manager: {}", error);
        }
    }
}

#[used]
#[link_section = ".init_array"]
static CORE_CONSTRUCTOR: extern "C" fn() = {
    extern "C" fn constructor() {
        // Auto-start only when we arrived through the preload list; test
        // binaries linking the rlib drive `Core::connect` themselves.
        let preloaded = std::env::var("LD_PRELOAD")
            .map(|preload| preload.contains("mempatch"))
            .unwrap_or(false);
        if preloaded {
            mempatch_core_start();
        }
    }
    constructor
};
