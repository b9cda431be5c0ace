pub mod lookup;
pub mod output;
pub mod timeline;
