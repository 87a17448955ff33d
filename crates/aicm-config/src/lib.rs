// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the AICM SDK.
//!
//! Two halves: [`store::ConfigStore`], a locked atomic INI file shared
//! across trackers and processes, and [`settings::Settings`], the immutable
//! resolved settings a tracker runs with.

pub mod settings;
pub mod store;

pub use settings::{DeliveryType, Settings, SettingsOverrides};
pub use store::ConfigStore;
