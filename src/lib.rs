/*
 * SPDX-FileCopyrightText: 2024 Tommaso Fontana
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
// No warnings
//#![deny(warnings)]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_pub)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]
#![deny(unused_doc_comments)]

pub mod block_map;
pub mod buf;
pub mod context;
pub mod dispatch;
pub mod mat;
pub mod params;
pub mod side;
pub mod trace;
pub mod trmul;
pub mod tune;

/// Prelude module to import everything from this crate
pub mod prelude {
    pub use crate::block_map::*;
    pub use crate::buf::*;
    pub use crate::context::*;
    pub use crate::dispatch::*;
    pub use crate::mat::*;
    pub use crate::params::*;
    pub use crate::side::*;
    pub use crate::trace::*;
    pub use crate::trmul::*;
    pub use crate::tune::*;
}
