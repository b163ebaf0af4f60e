pub mod aggregator;
pub mod candle_window;
pub mod pubsub;
pub mod registry;

pub use aggregator::{AggregatorSettings, ChangeEvent, SeriesAggregator, SeriesError};
pub use candle_window::WindowTable;
pub use pubsub::observer;
pub use registry::{normalize_symbol, SeriesRegistry};
