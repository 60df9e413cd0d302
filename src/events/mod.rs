// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Catalog
//!
//! Subjects known to the system and the concrete events built on them.

mod subjects;
mod user_created;

pub use subjects::Subject;
pub use user_created::{UserCreated, UserCreatedData};
