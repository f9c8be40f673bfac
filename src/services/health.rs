//! Backend health check.

use crate::client::{decode, PocketBase, SendOptions};
use crate::error::ClientError;
use crate::models::HealthCheck;
use crate::services::RequestOptions;

pub const HEALTH_PATH: &str = "/api/health";

#[derive(Clone, Debug)]
pub struct HealthService {
    client: PocketBase,
}

impl HealthService {
    pub fn new(client: PocketBase) -> Self {
        Self { client }
    }

    pub async fn check(&self, options: &RequestOptions) -> Result<HealthCheck, ClientError> {
        let send = options.send_options(SendOptions::get());
        let value = self.client.send(HEALTH_PATH, send).await?;
        Ok(decode(value))
    }
}
