pub mod bybit;

pub use bybit::BybitClient;
