pub mod http;
pub mod logging;
pub mod markdown;
pub mod telegram;
pub mod timing;
