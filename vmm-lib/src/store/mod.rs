// SPDX-License-Identifier: GPL-2.0-only
pub mod file;
pub mod traits;

pub use file::FileStore;
pub use traits::{StoreError, VmStore};
