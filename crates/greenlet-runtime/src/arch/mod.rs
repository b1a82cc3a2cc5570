//! Architecture-specific stack switching
//!
//! The raw stack swap comes from the `generator` crate, which carries its
//! own context-switch code for each supported target.

cfg_if::cfg_if! {
    if #[cfg(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "arm",
        target_arch = "riscv64",
        target_arch = "loongarch64",
        target_arch = "powerpc64",
    ))] {
        mod fiber;
        pub use fiber::{Fiber, FiberContext, FiberStatus, Suspender};
    } else {
        compile_error!("Unsupported architecture");
    }
}
