//! Classic link tracking: the device registry, event dispatch, status
//! aggregation and TWS peer recognition.

pub mod dispatcher;
pub mod registry;
pub mod role;
pub mod status;
