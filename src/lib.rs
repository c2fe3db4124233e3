pub mod coins;
pub mod config;
pub mod dleq;
pub mod eth;
pub mod logging;
pub mod net;
pub mod retry;
pub mod sim;
pub mod swap;
pub mod xmr;
