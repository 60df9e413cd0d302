// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use super::Subject;
use crate::event::Event;
use serde::{Deserialize, Serialize};

/// Emitted by the users service once an account exists.
pub struct UserCreated;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedData {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub user_name: String,
}

impl Event for UserCreated {
    const EXCHANGE: &'static str = "users";
    const SUBJECT: Subject = Subject::UserCreated;
    type Data = UserCreatedData;
}
