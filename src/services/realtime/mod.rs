pub mod debounce;
pub mod feed;

pub use feed::{ChangeEvent, ChangeFeed, ChangeKind, RowFilter, Subscription, SubscriptionSpec, Table};
