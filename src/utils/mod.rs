//! The `utils` module holds the pieces every other module leans on: the
//! error taxonomy surfaced by the broker and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{
    BrokerError, NegotiationError, Result, StorageError, TransportError, ValidationError,
};

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
        logging::init("nonsense");
    }
}
