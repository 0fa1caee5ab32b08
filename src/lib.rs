#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod domain_xml;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod lifecycle;
pub mod logging;
pub mod menu;
pub mod overlay;
pub mod paths;
pub mod progress;
pub mod provision;
pub mod registry;
pub mod serial;
pub mod usb;
pub mod util;
