//! Case definition documents: the XML tree, the parameter binder and
//! contract discovery.

pub mod binder;
pub mod discovery;
pub mod tree;

pub use binder::ConfigDocumentBinder;
pub use tree::{ConfigDocument, Element};
