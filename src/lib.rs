#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # Crucible: an output pipeline for Wayland compositors
//!
//! This crate provides the rendering and output pipeline of a wayland compositor:
//! a DRM/KMS backend driving real display controllers, a backend-agnostic output
//! abstraction with staged state and test/commit semantics, and a retained-mode
//! scene graph that computes per-output damage, attempts direct scan-out and
//! falls back to composition through a renderer abstraction.
//!
//! ## Structure of the crate
//!
//! [`backend`] contains everything that talks to the system: session management,
//! buffer allocation, the DRM/KMS backend and the renderer contract. [`output`]
//! is the compositor-facing output object every backend implements. [`scene`]
//! is the retained composition tree feeding outputs. [`wayland`] holds the
//! `wl_output` global and [`xwayland`] the X11 window-manager glue consuming
//! scene stacking order.
//!
//! ## The event loop
//!
//! Everything is single-threaded and cooperative, built around [`calloop`]: the
//! DRM file descriptor, the session notifier and frame timers are all event
//! sources dispatched by one loop. No user-visible operation blocks; commits are
//! either synchronous ioctls or non-blocking with page-flip events delivered
//! through the loop later.

pub mod backend;
pub mod output;
pub mod scene;
pub mod utils;
pub mod wayland;
pub mod xwayland;
