use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::lease::store::{LeaseRenewalOutcome, LeaseStore};

pub struct RedisLeaseStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisLeaseStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            key_prefix: "treeflow:lease".to_string(),
        }
    }

    pub fn with_prefix(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn lease_key(&self, instance_id: &str) -> String {
        format!("{}:{}", self.key_prefix, instance_id)
    }

    async fn try_renew(&self, instance_id: &str, owner_id: &str, extension: Duration) -> Result<bool> {
        // PEXPIRE only while the caller still owns the key
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("PEXPIRE", KEYS[1], ARGV[2])
            end
            return 0
        "#,
        );
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let renewed: i64 = script
            .key(self.lease_key(instance_id))
            .arg(owner_id)
            .arg(extension.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn acquire(&self, instance_id: &str, owner_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lease_key(instance_id))
            .arg(owner_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew(&self, instance_id: &str, owner_id: &str, extension: Duration) -> LeaseRenewalOutcome {
        match self.try_renew(instance_id, owner_id, extension).await {
            Ok(true) => LeaseRenewalOutcome::renewed(),
            Ok(false) => LeaseRenewalOutcome::failed(format!("lease for {} is no longer held by {}", instance_id, owner_id)),
            Err(e) => LeaseRenewalOutcome::failed(format!("{:#}", e)),
        }
    }

    async fn release(&self, instance_id: &str, owner_id: &str) -> Result<bool> {
        // compare-and-delete
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            end
            return 0
        "#,
        );
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: i64 = script
            .key(self.lease_key(instance_id))
            .arg(owner_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
