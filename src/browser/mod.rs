//! Rendering-surface adapter: a thin CDP client over the headless browser's
//! DevTools endpoint.

pub mod cdp;
pub mod page;

pub use cdp::{CdpConnection, CdpEvent};
pub use page::{Page, PageOps};
