// Delivery module
// Guarded and forced delivery of the token to the collector

mod guard;
mod relay;

pub use guard::{Admission, InFlightPermit, SendGuard, SkipReason};
pub use relay::{
    authorization_header, normalize_endpoint, DeliveryPayload, DeliveryReceipt, RelayClient,
    ResolvedEndpoint, CURRENT_PATH, DEFAULT_ENDPOINT, LEGACY_PATH,
};
