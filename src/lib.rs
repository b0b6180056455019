#![allow(async_fn_in_trait)]

pub use ccnet_adapter as adapter;
pub use ccnet_dhcp as dhcp;
pub use ccnet_link as link;
pub use ccnet_netd as netd;
pub use ccnet_proto as proto;
pub use ccnet_router as router;

pub mod std_mutex;
