//! Cross-cutting helpers shared by the kernel and the HTTP surface.

pub mod error;
pub mod id;
pub mod time;
