// SPDX-License-Identifier: GPL-2.0-only
pub mod backend;
pub mod config;
pub mod download;
pub mod github;
pub mod hypervisor;
pub mod id;
pub mod image_lock;
pub mod image_service;
pub mod mount_service;
pub mod network_service;
pub mod storage_service;
pub mod store;
pub mod tool;
pub mod vm;
pub mod vm_service;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
