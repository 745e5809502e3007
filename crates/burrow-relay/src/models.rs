//! Admin API response bodies

use serde::{Deserialize, Serialize};

use crate::table::SubscriberStatus;

#[derive(Debug, Serialize)]
pub struct SubscribersResponse {
    pub success: bool,
    pub subscribers: Vec<SubscriberStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
