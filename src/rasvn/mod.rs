//! The `svn://` transport.
//!
//! [`RaSvnConnector`] is registered for the `svn` scheme by
//! [`crate::TransportRegistry::with_defaults`].

mod commit;
pub(crate) mod conn;
mod connection;
pub(crate) mod edit;
mod item;
pub(crate) mod parse;
mod wire;

pub use connection::RaSvnConnector;
pub use item::SvnItem;

