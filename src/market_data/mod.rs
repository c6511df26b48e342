pub mod candle_aggregator;
pub mod connection;
pub mod decoder;
pub mod movers;
pub mod normalizer;
pub mod price_cache;
pub mod token_map;
