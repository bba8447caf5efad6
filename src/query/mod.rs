pub mod range_stream;

pub use range_stream::{range_for_term, LookupResults, RangeStream};
