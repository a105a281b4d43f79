//! Record schemas (the client-side static roster plus dynamically added
//! per-source order records), the per-connection registry negotiated via
//! `DESCRIBE_RECORDS`, and record-to-event transcoding.

mod registry;
mod schema;

pub(crate) use registry::RecordRegistry;
pub(crate) use schema::{transcode, FieldValue, RecordId};
