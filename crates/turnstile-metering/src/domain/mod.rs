pub mod events;
pub mod meters;
pub mod prices;
pub mod subscriptions;
pub mod types;

pub use events::{unique_hash, Event, ProcessedEvent, ProcessedStatus};

pub use meters::{Aggregation, BucketWindow, Feature, Meter, PropertyFilter};

pub use prices::{
    BillingModel, BillingPeriod, Commitment, EntityScope, PackageTransform, Price, PriceStatus,
    PriceTier, RoundingDirection, TierMode,
};

pub use subscriptions::{Customer, LineItem, Subscription, SubscriptionStatus};

pub use types::{
    CustomerId, EnvironmentId, FeatureId, MeterId, PeriodId, PriceId, SubscriptionId, TenantId,
};
