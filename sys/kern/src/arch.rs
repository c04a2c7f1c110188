// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names. The `hosted` module is a stand-in port that lets the
//! kernel's logic build and run under `cargo test` on a development
//! machine; it switches no contexts and masks no interrupts.

cfg_if::cfg_if! {
    if #[cfg(armv7m)] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(any(armv6m, armv8m))] {
        compile_error!(
            "this M-profile variant is not supported yet; the port \
             currently covers ARMv7-M"
        );
    } else if #[cfg(target_arch = "arm")] {
        compile_error!("A-profile ARM is not supported");
    } else {
        #[macro_use]
        pub mod hosted;
        pub use hosted::*;
    }
}
