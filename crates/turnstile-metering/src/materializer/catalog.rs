//! Read-only catalog of meters, prices, features, subscriptions, and
//! customers. Administrative flows own these records; the pipeline only
//! snapshots them. Refreshes are atomic full replacements per scope, never
//! partial mutation.

use crate::domain::{
    Customer, CustomerId, Feature, Meter, MeterId, Price, PriceId, Subscription, SubscriptionId,
};
use crate::error::{MeteringError, Result};
use crate::store::EventScope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Everything attribution and billing need for one (tenant, environment).
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub meters: Vec<Meter>,
    pub features: Vec<Feature>,
    pub prices: Vec<Price>,
    pub subscriptions: Vec<Subscription>,
    pub customers: Vec<Customer>,
}

impl CatalogSnapshot {
    pub fn price(&self, id: &PriceId) -> Option<&Price> {
        self.prices.iter().find(|p| &p.id == id)
    }

    pub fn meter(&self, id: &MeterId) -> Option<&Meter> {
        self.meters.iter().find(|m| &m.id == id)
    }

    pub fn feature_for_meter(&self, meter_id: &MeterId) -> Option<&Feature> {
        self.features.iter().find(|f| &f.meter_id == meter_id)
    }

    pub fn customer(&self, id: &CustomerId) -> Option<&Customer> {
        self.customers.iter().find(|c| &c.id == id)
    }
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    /// Scopes with anything to materialize.
    async fn scopes(&self) -> Result<Vec<EventScope>>;

    async fn snapshot(&self, scope: &EventScope) -> Result<CatalogSnapshot>;

    async fn subscription(&self, id: &SubscriptionId) -> Result<Subscription>;
}

/// Catalog held in memory and replaced wholesale on refresh. Serves tests,
/// local development, and embedders that sync the catalog themselves.
#[derive(Default)]
pub struct StaticCatalogProvider {
    scopes: RwLock<HashMap<(String, String), Arc<CatalogSnapshot>>>,
}

impl StaticCatalogProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn key(scope: &EventScope) -> (String, String) {
        (
            scope.tenant_id.to_string(),
            scope.environment_id.to_string(),
        )
    }

    /// Replace a scope's snapshot atomically.
    pub async fn replace(&self, scope: &EventScope, snapshot: CatalogSnapshot) {
        let mut scopes = self.scopes.write().await;
        scopes.insert(Self::key(scope), Arc::new(snapshot));
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalogProvider {
    async fn scopes(&self) -> Result<Vec<EventScope>> {
        let scopes = self.scopes.read().await;
        Ok(scopes
            .keys()
            .map(|(tenant, environment)| EventScope {
                tenant_id: crate::domain::TenantId::new(tenant.clone()),
                environment_id: crate::domain::EnvironmentId::new(environment.clone()),
            })
            .collect())
    }

    async fn snapshot(&self, scope: &EventScope) -> Result<CatalogSnapshot> {
        let scopes = self.scopes.read().await;
        scopes
            .get(&Self::key(scope))
            .map(|snapshot| snapshot.as_ref().clone())
            .ok_or_else(|| MeteringError::NotFound {
                entity: "catalog scope".to_string(),
                id: format!("{}/{}", scope.tenant_id, scope.environment_id),
            })
    }

    async fn subscription(&self, id: &SubscriptionId) -> Result<Subscription> {
        let scopes = self.scopes.read().await;
        for snapshot in scopes.values() {
            if let Some(subscription) = snapshot.subscriptions.iter().find(|s| &s.id == id) {
                return Ok(subscription.clone());
            }
        }
        Err(MeteringError::NotFound {
            entity: "subscription".to_string(),
            id: id.to_string(),
        })
    }
}
