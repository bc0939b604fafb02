pub mod clock;
pub mod error;
pub mod field_value;
pub mod ids;
pub mod parcel;
pub mod pool;
pub mod view;

pub use error::CoreError;
pub use field_value::FieldValue;
pub use ids::*;
pub use parcel::{Assignment, CustodyRow, Parcel};
pub use pool::{Pool, PoolDirectory, PoolStatus};
pub use view::{InsertPosition, Page, RemovedRow, RowLocation, View};
