/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Multi-host network benchmark orchestration. An experiment is assembled into a manifest
//! on the server, the server's network stack is switched to the system under test, server
//! and client processes are launched across the cluster and every log is pulled back into
//! the experiment directory.

pub mod adapter;
pub mod allocator;
pub mod assembly;
pub mod clap_args;
pub mod cluster;
pub mod config;
pub mod environment;
pub mod error;
pub mod execution_modes;
pub mod experiment;
pub mod hooks;
pub mod lifecycle;
pub mod recipes;
pub mod shell;
pub mod system;
pub mod template;
pub mod testbed;
