// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod config;
pub mod forward;
pub mod node;
pub mod route;
pub mod transport;
pub mod util;
