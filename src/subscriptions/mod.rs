//! Subscription system for live collection updates.
//!
//! A subscription watches a collection for inserts and updates matching a
//! filter. Each subscription owns its own channel:
//! - records arrive in the order the server sent them
//! - nothing is yielded once the subscription is cancelled
//! - server-side errors and callback failures go to a separate error sink
//!
//! # Example
//!
//! ```ignore
//! let params = ParamsOfSubscribeCollection::new("transactions", "id now")
//!     .filter(CollectionFilter::eq("account_addr", addr));
//! let sub = client.subscribe_collection(&params)?;
//!
//! for record in sub.iter() {
//!     println!("Got transaction: {}", record["id"]);
//!     if done {
//!         client.unsubscribe(sub.handle());
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub(crate) use types::StateCell;
pub use types::{
    CallbackSubscription, DropReason, Subscription, SubscriptionHandle, SubscriptionState,
};
