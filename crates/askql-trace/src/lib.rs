pub mod aggregator;
pub mod formatter;

pub use aggregator::{reduce, replay, Terminal, TraceState};
pub use formatter::{
    confidence_for, format_response, FormatOptions, FormattedResponse, DEFAULT_MAX_TABLE_ROWS,
};
