pub mod proxy;

pub use proxy::{GatewayState, proxy_router};
