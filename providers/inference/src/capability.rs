//! Probe for a working WebAssembly sandbox.
//!
//! The probe compiles and instantiates the smallest valid module (magic number
//! plus version, no sections). Every failure mode, including a panicking
//! host, reads as "unavailable".

use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// `\0asm` followed by binary format version 1.
pub const MINIMAL_MODULE: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

/// Something able to compile and instantiate a WebAssembly module.
pub trait SandboxHost: Send + Sync {
    fn instantiate(&self, module: &[u8]) -> anyhow::Result<()>;
}

/// Sandbox backed by an embedded wasmtime engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct WasmtimeHost;

impl SandboxHost for WasmtimeHost {
    fn instantiate(&self, module: &[u8]) -> anyhow::Result<()> {
        let engine = wasmtime::Engine::default();
        let module = wasmtime::Module::new(&engine, module)?;
        let mut store = wasmtime::Store::new(&engine, ());
        wasmtime::Instance::new(&mut store, &module, &[])?;
        Ok(())
    }
}

/// Run the probe against `host`. Never panics, never errors.
pub fn check_availability(host: &dyn SandboxHost) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| host.instantiate(&MINIMAL_MODULE))) {
        Ok(Ok(())) => {
            debug!("sandbox probe instantiated the minimal module");
            true
        }
        Ok(Err(error)) => {
            warn!(%error, "sandbox probe failed");
            false
        }
        Err(_) => {
            warn!("sandbox probe panicked");
            false
        }
    }
}
