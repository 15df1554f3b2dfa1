// Core building blocks: errors, the record wire format, the worker pool, and the key scanner.
pub mod cursor;
pub mod error;
pub mod pool;
pub mod record;
