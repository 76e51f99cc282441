//! Bearer-token routes outside the Retell pipeline: the admin surface and
//! the in-process sidecar workers.

pub mod admin;
pub mod workers;
