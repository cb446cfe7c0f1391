//! Real-time data path: ring buffer, dispatcher thread, and the async
//! chunk stream.

pub(crate) mod dispatcher;
pub(crate) mod ring;
pub(crate) mod stream;
