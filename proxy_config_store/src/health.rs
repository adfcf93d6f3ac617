//! Service registration and TTL health checks in the service catalog
use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use twox_hash::XxHash32;

use crate::Result;

/// The state reported for a TTL check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Passing,
    Critical,
}

/// A proxy instance as registered in the service catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Service id, unique per proxy instance
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    /// The check id, `address:port`
    pub check_id: String,
    /// How long the check stays passing without a heartbeat
    pub ttl: Duration,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, ttl: Duration) -> Self {
        let name = name.into();
        let address = address.into();
        let check_id = format!("{address}:{port}");
        let id = format!(
            "{name}-influxdb-proxy-{}",
            XxHash32::oneshot(0, check_id.as_bytes())
        );
        Self {
            id,
            name,
            address,
            port,
            check_id,
            ttl,
        }
    }
}

/// Registration of the proxy in a service catalog with a TTL check kept alive by heartbeats
#[async_trait]
pub trait HealthCheck: Debug + Send + Sync + 'static {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()>;

    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    async fn register_check(&self, registration: &ServiceRegistration) -> Result<()>;

    async fn update_check(&self, check_id: &str, status: CheckStatus) -> Result<()>;

    async fn check_pass(&self, check_id: &str) -> Result<()> {
        self.update_check(check_id, CheckStatus::Passing).await
    }

    async fn check_fail(&self, check_id: &str) -> Result<()> {
        self.update_check(check_id, CheckStatus::Critical).await
    }
}
